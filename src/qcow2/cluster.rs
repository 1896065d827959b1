//! The cluster-mapping engine: guest offset to host offset translation,
//! allocation planning for writes, and the `L2Meta` records that tie a
//! pending allocation to its eventual L2 table update.

use super::table::{
    sc_alloc_mask, sc_zero_mask, L2Entry, L2Table, Table, SC_BITMAP_ALL_ALLOC, SC_BITMAP_ALL_ZERO,
};
use super::{Qcow2Image, Qcow2Metadata, CLUSTER_BITS, CLUSTER_SIZE};
use crate::helpers::cache::CacheEntry;
use crate::{BlockError, BlockResult};
use log::warn;
use std::ops::Range;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::oneshot;

/// Classification of one subcluster (with standard L2 entries, the whole
/// cluster counts as a single subcluster).
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SubclusterType {
    /// No mapping at all; data comes from the backing image
    UnallocatedPlain,
    /// The cluster has a host mapping, but this subcluster is not
    /// allocated in it; data comes from the backing image
    UnallocatedAlloc,
    /// Reads as zeroes, no host cluster
    ZeroPlain,
    /// Reads as zeroes, host cluster present (reusable for writes)
    ZeroAlloc,
    /// Data lives in the host cluster
    Normal,
    /// Compressed cluster
    Compressed,
    /// Contradictory metadata
    Invalid,
}

/// A contiguous guest range with a uniform mapping.
pub(super) struct HostRun {
    pub sc_type: SubclusterType,
    /// Run length in bytes, at least 1
    pub bytes: u64,
    /// Byte position in the data file corresponding to the start of the
    /// run; present for `Normal`, `ZeroAlloc` and `UnallocatedAlloc`
    pub host_offset: Option<u64>,
    /// For `Compressed`: host offset and maximum length of the blob
    pub compressed: Option<(u64, usize)>,
}

/// Start and length of a copy-on-write region, relative to the start of
/// the allocation run; the same value addresses both the guest range and
/// the host range of the run.
#[derive(Clone, Copy, Debug, Default)]
pub(super) struct CowRegion {
    pub offset: u64,
    pub nb_bytes: u64,
}

impl CowRegion {
    pub fn is_empty(&self) -> bool {
        self.nb_bytes == 0
    }

    pub fn end(&self) -> u64 {
        self.offset + self.nb_bytes
    }
}

/// An allocation that has been entered into the L2 serialization list but
/// whose L2 update has not happened yet.
pub(super) struct InFlightAlloc {
    /// Guest cluster indices covered
    pub range: Range<u64>,
    pub waiters: StdMutex<Vec<oneshot::Sender<()>>>,
}

impl InFlightAlloc {
    pub fn overlaps(&self, range: &Range<u64>) -> bool {
        self.range.start < range.end && range.start < self.range.end
    }
}

pub(super) type InFlightList = Arc<StdMutex<Vec<Arc<InFlightAlloc>>>>;

/// Description of a pending cluster allocation: where the data goes, which
/// parts must be copied from the old mapping, and how to finalize the L2
/// table once the data write is done.
pub(super) struct L2Meta {
    /// Guest offset of the first affected cluster (cluster-aligned)
    pub offset: u64,
    /// Host offset of the first cluster of the allocation
    pub alloc_offset: u64,
    pub nb_clusters: usize,
    /// The host clusters are the pre-existing ones; only entry flags and
    /// subcluster bitmaps change
    pub keep_old_clusters: bool,
    pub cow_start: CowRegion,
    pub cow_end: CowRegion,
    /// The COW regions were already zeroed on disk; nothing to copy
    pub skip_cow: bool,

    in_flight: Option<Arc<InFlightAlloc>>,
    list: InFlightList,
}

impl L2Meta {
    /// Remove this allocation from the in-flight list and wake everyone
    /// who was waiting for it.
    pub fn release(&mut self) {
        if let Some(entry) = self.in_flight.take() {
            self.list
                .lock()
                .unwrap()
                .retain(|other| !Arc::ptr_eq(other, &entry));
            for waiter in entry.waiters.lock().unwrap().drain(..) {
                let _ = waiter.send(());
            }
        }
    }
}

impl Drop for L2Meta {
    fn drop(&mut self) {
        if self.in_flight.is_some() {
            // A dropped request cannot free its clusters anymore (that
            // needs the image lock); they stay refcounted and unreferenced
            warn!(
                "write request dropped mid-flight; leaking {} cluster(s) at host offset 0x{:x}",
                self.nb_clusters, self.alloc_offset
            );
            self.release();
        }
    }
}

/// Outcome of allocation planning.
pub(super) enum Planned {
    /// The caller may write `bytes` bytes at `host_offset` now; `meta`, if
    /// present, must be linked (or aborted) afterwards
    Run {
        host_offset: u64,
        bytes: u64,
        meta: Option<L2Meta>,
    },
    /// An in-flight allocation overlaps the start of the request; wait for
    /// the receivers, then re-plan
    Wait(Vec<oneshot::Receiver<()>>),
}

pub(super) struct SplitGuestOffset {
    pub l1_index: usize,
    pub l2_index: usize,
    pub in_cluster: usize,
}

impl Qcow2Image {
    pub(super) fn split_guest_offset(&self, offset: u64) -> SplitGuestOffset {
        let in_cluster = offset as usize & (CLUSTER_SIZE - 1);
        let cluster = offset >> CLUSTER_BITS;
        let l2_index = cluster as usize & (self.l2_entries - 1);
        let l1_index = (cluster >> self.l2_bits) as usize;

        SplitGuestOffset {
            l1_index,
            l2_index,
            in_cluster,
        }
    }

    fn sc_index(&self, in_cluster: usize) -> usize {
        in_cluster >> self.subcluster_bits
    }

    fn sc_align_down(&self, in_cluster: usize) -> usize {
        in_cluster & !(self.subcluster_size - 1)
    }

    fn sc_align_up(&self, in_cluster: usize) -> usize {
        in_cluster.next_multiple_of(self.subcluster_size)
    }

    pub(super) fn classify_subcluster(
        &self,
        entry: L2Entry,
        bitmap: u64,
        sc_index: usize,
    ) -> SubclusterType {
        if entry.is_compressed() {
            return SubclusterType::Compressed;
        }

        if !self.extended_l2 {
            return if entry.is_zero_flagged() {
                if entry.cluster_offset() != 0 {
                    SubclusterType::ZeroAlloc
                } else {
                    SubclusterType::ZeroPlain
                }
            } else if entry.cluster_offset() != 0 {
                SubclusterType::Normal
            } else {
                SubclusterType::UnallocatedPlain
            };
        }

        let alloc_bit = bitmap & sc_alloc_mask(sc_index, sc_index + 1) != 0;
        let zero_bit = bitmap & sc_zero_mask(sc_index, sc_index + 1) != 0;

        if entry.cluster_offset() != 0 {
            if (bitmap >> 32) & bitmap & SC_BITMAP_ALL_ALLOC != 0 {
                SubclusterType::Invalid
            } else if zero_bit {
                SubclusterType::ZeroAlloc
            } else if alloc_bit {
                SubclusterType::Normal
            } else {
                SubclusterType::UnallocatedAlloc
            }
        } else {
            if bitmap & SC_BITMAP_ALL_ALLOC != 0 {
                SubclusterType::Invalid
            } else if zero_bit {
                SubclusterType::ZeroPlain
            } else {
                SubclusterType::UnallocatedPlain
            }
        }
    }

    /// Cached L2 table at the given host offset.
    pub(super) async fn l2_table(
        &self,
        m: &mut Qcow2Metadata,
        l2_offset: u64,
    ) -> BlockResult<CacheEntry<L2Table>> {
        let file = &self.file;
        let entries = self.l2_entries;
        let extended = self.extended_l2;
        m.l2_cache
            .get_or_insert(
                l2_offset,
                L2Table::load(file, l2_offset, entries, extended),
                |entry| async move { entry.value().read().await.write(file).await },
            )
            .await
    }

    /// Offset of the L2 table for `l1_index`, allocating and zeroing a new
    /// table if the L1 slot is empty.
    pub(super) async fn ensure_l2(
        &self,
        m: &mut Qcow2Metadata,
        l1_index: usize,
    ) -> BlockResult<u64> {
        if !m.l1_table.in_bounds(l1_index) {
            return Err(BlockError::InvalidArgument(
                "guest offset beyond the end of the image".into(),
            ));
        }

        let l1_entry = m.l1_table.get(l1_index);
        if !l1_entry.is_empty() {
            if !l1_entry.is_copied() {
                return Err(BlockError::CorruptImage(
                    "L2 table is shared; internal snapshots are not supported".into(),
                ));
            }
            return Ok(l1_entry.l2_offset());
        }

        let l2_offset = self.alloc_clusters(m, CLUSTER_SIZE as u64).await?;

        // The refcount of the new table must be on disk before anything
        // references the table, and the table itself must be valid (zeroed)
        // before the L1 entry points at it.  Any failure returns the
        // cluster to the allocator.
        let result = async {
            self.flush_refblocks_for(m, l2_offset, 1).await?;

            let zero_buf = vec![0u8; CLUSTER_SIZE];
            self.file.write(&zero_buf, l2_offset).await?;

            m.l1_table.map_l2_offset(l1_index, l2_offset);
            if let Err(err) = m.l1_table.write_entry(&self.file, l1_index).await {
                m.l1_table.set(l1_index, l1_entry);
                return Err(err);
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            self.free_clusters(m, l2_offset, CLUSTER_SIZE as u64).await;
            return Err(err);
        }

        let file = &self.file;
        m.l2_cache
            .get_empty(
                l2_offset,
                L2Table::new_cleared(l2_offset, self.l2_entries, self.extended_l2),
                |entry| async move { entry.value().read().await.write(file).await },
            )
            .await?;

        Ok(l2_offset)
    }

    /// Translate `(guest_offset, max_bytes)` into the longest contiguous
    /// run with a uniform subcluster classification.
    pub(super) async fn get_host_offset(
        &self,
        m: &mut Qcow2Metadata,
        guest_offset: u64,
        max_bytes: u64,
    ) -> BlockResult<HostRun> {
        debug_assert!(max_bytes > 0 && guest_offset < self.virtual_size);

        let split = self.split_guest_offset(guest_offset);

        // A run never extends past its L2 table or the virtual size
        let to_l2_end =
            ((self.l2_entries - split.l2_index) * CLUSTER_SIZE - split.in_cluster) as u64;
        let max_bytes = max_bytes
            .min(to_l2_end)
            .min(self.virtual_size - guest_offset);

        let l1_entry = if m.l1_table.in_bounds(split.l1_index) {
            m.l1_table.get(split.l1_index)
        } else {
            Default::default()
        };
        if l1_entry.is_empty() {
            return Ok(HostRun {
                sc_type: SubclusterType::UnallocatedPlain,
                bytes: max_bytes,
                host_offset: None,
                compressed: None,
            });
        }

        let handle = self.l2_table(m, l1_entry.l2_offset()).await?;
        let table = handle.value().read().await;

        let first_entry = table.get(split.l2_index);
        let first_bitmap = table.get_bitmap(split.l2_index);
        let sc0 = self.sc_index(split.in_cluster);
        let sc_type = self.classify_subcluster(first_entry, first_bitmap, sc0);

        match sc_type {
            SubclusterType::Invalid => {
                return Err(BlockError::CorruptImage(format!(
                    "invalid subcluster state in L2 entry 0x{:x} (bitmap 0x{:x})",
                    first_entry.into_plain(),
                    first_bitmap
                )));
            }
            SubclusterType::Compressed => {
                return Ok(HostRun {
                    sc_type,
                    bytes: max_bytes.min((CLUSTER_SIZE - split.in_cluster) as u64),
                    host_offset: None,
                    compressed: first_entry.compressed_range(),
                });
            }
            _ => {}
        }

        let host_offset = (first_entry.cluster_offset() != 0)
            .then(|| first_entry.cluster_offset() + split.in_cluster as u64);

        // Extend subcluster by subcluster while the classification stays
        // uniform and (where host offsets matter) physically contiguous
        let in_subcluster = split.in_cluster & (self.subcluster_size - 1);
        let mut bytes = max_bytes.min((self.subcluster_size - in_subcluster) as u64);
        let mut sc = split.l2_index * self.subclusters_per_cluster + sc0;

        while bytes < max_bytes {
            sc += 1;
            let l2_index = sc / self.subclusters_per_cluster;
            let sc_in_cluster = sc % self.subclusters_per_cluster;

            let entry = table.get(l2_index);
            let bitmap = table.get_bitmap(l2_index);
            if self.classify_subcluster(entry, bitmap, sc_in_cluster) != sc_type {
                break;
            }
            if sc_in_cluster == 0 && first_entry.cluster_offset() != 0 {
                let expected = first_entry.cluster_offset()
                    + ((l2_index - split.l2_index) << CLUSTER_BITS) as u64;
                if entry.cluster_offset() != expected {
                    break;
                }
            }

            bytes = max_bytes.min(bytes + self.subcluster_size as u64);
        }

        Ok(HostRun {
            sc_type,
            bytes,
            host_offset,
            compressed: None,
        })
    }

    /// Register waiters on every in-flight allocation overlapping the
    /// given guest cluster range.  An empty result means no overlap.
    pub(super) fn intersecting_allocs(&self, range: &Range<u64>) -> Vec<oneshot::Receiver<()>> {
        let list = self.cluster_allocs.lock().unwrap();
        list.iter()
            .filter(|alloc| alloc.overlaps(range))
            .map(|alloc| {
                let (sender, receiver) = oneshot::channel();
                alloc.waiters.lock().unwrap().push(sender);
                receiver
            })
            .collect()
    }

    /// Plan the write of `(guest_offset, bytes)`: either an in-place run,
    /// or an allocation described by an `L2Meta`.
    pub(super) async fn alloc_host_offset(
        &self,
        m: &mut Qcow2Metadata,
        guest_offset: u64,
        bytes: u64,
    ) -> BlockResult<Planned> {
        debug_assert!(bytes > 0);

        let split = self.split_guest_offset(guest_offset);
        let to_l2_end =
            ((self.l2_entries - split.l2_index) * CLUSTER_SIZE - split.in_cluster) as u64;
        let mut bytes = bytes.min(to_l2_end);

        // Serialize against overlapping in-flight allocations: wait when
        // the conflict covers our start, truncate when it begins later
        let start_cluster = guest_offset >> CLUSTER_BITS;
        {
            let end_cluster = (guest_offset + bytes - 1) >> CLUSTER_BITS;
            let range = start_cluster..end_cluster + 1;
            let list = self.cluster_allocs.lock().unwrap();

            let mut truncate_at: Option<u64> = None;
            let mut head_conflict = false;
            for alloc in list.iter().filter(|a| a.overlaps(&range)) {
                if alloc.range.start <= start_cluster {
                    head_conflict = true;
                } else {
                    truncate_at = Some(
                        truncate_at
                            .map(|t| t.min(alloc.range.start))
                            .unwrap_or(alloc.range.start),
                    );
                }
            }

            if head_conflict {
                let receivers = list
                    .iter()
                    .filter(|a| a.overlaps(&range))
                    .map(|alloc| {
                        let (sender, receiver) = oneshot::channel();
                        alloc.waiters.lock().unwrap().push(sender);
                        receiver
                    })
                    .collect();
                return Ok(Planned::Wait(receivers));
            }

            if let Some(first_conflicting) = truncate_at {
                bytes = (first_conflicting << CLUSTER_BITS) - guest_offset;
            }
        }

        let l2_offset = self.ensure_l2(m, split.l1_index).await?;
        let handle = self.l2_table(m, l2_offset).await?;

        let nb_request = {
            let end = guest_offset + bytes;
            (((end - 1) >> CLUSTER_BITS) - start_cluster + 1) as usize
        };

        // Phase one under the table read lock: how far does the in-place
        // run reach, or what disposition does the allocation run have?
        enum Disposition {
            InPlace { host: u64, clusters: usize },
            Reuse { host: u64, clusters: usize },
            Fresh { clusters: usize },
        }

        let disposition = {
            let table = handle.value().read().await;

            let covered_sc = |i: usize| -> (usize, usize) {
                let from = if i == 0 { self.sc_index(split.in_cluster) } else { 0 };
                let to = if i == nb_request - 1 {
                    let end_in_cluster =
                        ((guest_offset + bytes - 1) as usize & (CLUSTER_SIZE - 1)) + 1;
                    self.sc_index(end_in_cluster - 1) + 1
                } else {
                    self.subclusters_per_cluster
                };
                (from, to)
            };

            let writable_in_place = |i: usize| -> bool {
                let entry = table.get(split.l2_index + i);
                if entry.is_compressed() || !entry.is_copied() || entry.cluster_offset() == 0 {
                    return false;
                }
                if self.extended_l2 {
                    let bitmap = table.get_bitmap(split.l2_index + i);
                    let (from, to) = covered_sc(i);
                    let alloc = sc_alloc_mask(from, to);
                    bitmap & alloc == alloc && bitmap & sc_zero_mask(from, to) == 0
                } else {
                    !entry.is_zero_flagged()
                }
            };

            let first = table.get(split.l2_index);
            if writable_in_place(0) {
                let mut clusters = 1;
                while clusters < nb_request
                    && writable_in_place(clusters)
                    && table.get(split.l2_index + clusters).cluster_offset()
                        == first.cluster_offset() + ((clusters as u64) << CLUSTER_BITS)
                {
                    clusters += 1;
                }
                Disposition::InPlace {
                    host: first.cluster_offset(),
                    clusters,
                }
            } else {
                let reusable = |entry: L2Entry| -> bool {
                    !entry.is_compressed() && entry.is_copied() && entry.cluster_offset() != 0
                };

                if reusable(first) {
                    let mut clusters = 1;
                    while clusters < nb_request {
                        let entry = table.get(split.l2_index + clusters);
                        if !reusable(entry)
                            || writable_in_place(clusters)
                            || entry.cluster_offset()
                                != first.cluster_offset() + ((clusters as u64) << CLUSTER_BITS)
                        {
                            break;
                        }
                        clusters += 1;
                    }
                    Disposition::Reuse {
                        host: first.cluster_offset(),
                        clusters,
                    }
                } else {
                    let mut clusters = 1;
                    while clusters < nb_request {
                        let entry = table.get(split.l2_index + clusters);
                        if reusable(entry) || writable_in_place(clusters) {
                            break;
                        }
                        clusters += 1;
                    }
                    Disposition::Fresh { clusters }
                }
            }
        };

        let (alloc_offset, nb_clusters, keep_old) = match disposition {
            Disposition::InPlace { host, clusters } => {
                let run = ((clusters * CLUSTER_SIZE) - split.in_cluster) as u64;
                return Ok(Planned::Run {
                    host_offset: host + split.in_cluster as u64,
                    bytes: bytes.min(run),
                    meta: None,
                });
            }
            Disposition::Reuse { host, clusters } => (host, clusters, true),
            Disposition::Fresh { clusters } => {
                let host = self
                    .alloc_clusters(m, (clusters * CLUSTER_SIZE) as u64)
                    .await?;
                (host, clusters, false)
            }
        };

        let bytes = bytes.min(((nb_clusters * CLUSTER_SIZE) - split.in_cluster) as u64);
        let meta = {
            let table = handle.value().read().await;
            self.plan_cow(
                &table,
                &split,
                guest_offset,
                bytes,
                alloc_offset,
                nb_clusters,
                keep_old,
            )
        };

        Ok(Planned::Run {
            host_offset: alloc_offset + split.in_cluster as u64,
            bytes,
            meta: Some(meta),
        })
    }

    /// Compute the COW head and tail regions and post the allocation to
    /// the in-flight list.
    #[allow(clippy::too_many_arguments)]
    fn plan_cow(
        &self,
        table: &L2Table,
        split: &SplitGuestOffset,
        guest_offset: u64,
        bytes: u64,
        alloc_offset: u64,
        nb_clusters: usize,
        keep_old: bool,
    ) -> L2Meta {
        let sc_size = self.subcluster_size;
        let write_start = split.in_cluster;
        let end_in_cluster = ((guest_offset + bytes - 1) as usize & (CLUSTER_SIZE - 1)) + 1;

        let first_entry = table.get(split.l2_index);
        let first_bitmap = table.get_bitmap(split.l2_index);
        let first_type =
            self.classify_subcluster(first_entry, first_bitmap, self.sc_index(write_start));

        let head_from = if keep_old {
            match first_type {
                SubclusterType::Normal => write_start,
                _ => self.sc_align_down(write_start),
            }
        } else {
            match first_type {
                SubclusterType::Compressed => 0,
                SubclusterType::ZeroPlain | SubclusterType::UnallocatedPlain => {
                    self.sc_align_down(write_start)
                }
                _ => {
                    if self.extended_l2 {
                        // Pull the head back to the first allocated
                        // subcluster so no old data is left behind in the
                        // replaced cluster
                        let alloc_bits = (first_bitmap & SC_BITMAP_ALL_ALLOC) as u32;
                        let first_alloc = alloc_bits.trailing_zeros() as usize;
                        (first_alloc * sc_size).min(self.sc_align_down(write_start))
                    } else {
                        0
                    }
                }
            }
        };

        let last_index = split.l2_index + nb_clusters - 1;
        let last_entry = table.get(last_index);
        let last_bitmap = table.get_bitmap(last_index);
        let last_type =
            self.classify_subcluster(last_entry, last_bitmap, self.sc_index(end_in_cluster - 1));

        let tail_to = if keep_old {
            match last_type {
                SubclusterType::Normal => end_in_cluster,
                _ => self.sc_align_up(end_in_cluster),
            }
        } else {
            match last_type {
                SubclusterType::Compressed => CLUSTER_SIZE,
                SubclusterType::ZeroPlain | SubclusterType::UnallocatedPlain => {
                    self.sc_align_up(end_in_cluster)
                }
                _ => {
                    if self.extended_l2 {
                        let alloc_bits = (last_bitmap & SC_BITMAP_ALL_ALLOC) as u32;
                        if alloc_bits == 0 {
                            self.sc_align_up(end_in_cluster)
                        } else {
                            let last_alloc = 31 - alloc_bits.leading_zeros() as usize;
                            ((last_alloc + 1) * sc_size).max(self.sc_align_up(end_in_cluster))
                        }
                    } else {
                        CLUSTER_SIZE
                    }
                }
            }
        };

        let cow_start = CowRegion {
            offset: head_from as u64,
            nb_bytes: (write_start - head_from) as u64,
        };
        let cow_end = CowRegion {
            offset: ((nb_clusters - 1) * CLUSTER_SIZE + end_in_cluster) as u64,
            nb_bytes: (tail_to - end_in_cluster) as u64,
        };

        let start_cluster = guest_offset >> CLUSTER_BITS;
        let in_flight = Arc::new(InFlightAlloc {
            range: start_cluster..start_cluster + nb_clusters as u64,
            waiters: StdMutex::new(Vec::new()),
        });
        self.cluster_allocs.lock().unwrap().push(Arc::clone(&in_flight));

        L2Meta {
            offset: guest_offset & !(CLUSTER_SIZE as u64 - 1),
            alloc_offset,
            nb_clusters,
            keep_old_clusters: keep_old,
            cow_start,
            cow_end,
            skip_cow: false,
            in_flight: Some(in_flight),
            list: Arc::clone(&self.cluster_allocs),
        }
    }

    /// Point the L2 entries of a finished allocation at their new host
    /// clusters, update subcluster bitmaps, and drop references to any
    /// replaced clusters.
    pub(super) async fn alloc_cluster_link_l2(
        &self,
        m: &mut Qcow2Metadata,
        meta: &L2Meta,
    ) -> BlockResult<()> {
        let split = self.split_guest_offset(meta.offset);
        let l1_entry = m.l1_table.get(split.l1_index);
        debug_assert!(!l1_entry.is_empty());

        let handle = self.l2_table(m, l1_entry.l2_offset()).await?;
        let mut freed: Vec<(u64, usize)> = Vec::new();

        {
            let mut table = handle.value().write().await;

            // Everything between the outer edges of the two COW regions
            // now holds valid data in the new mapping
            let touched_from = meta.cow_start.offset;
            let touched_to = if meta.cow_end.is_empty() {
                meta.cow_end.offset
            } else {
                meta.cow_end.end()
            };

            for i in 0..meta.nb_clusters {
                let index = split.l2_index + i;
                let old_entry = table.get(index);
                let host = meta.alloc_offset + ((i as u64) << CLUSTER_BITS);

                if !meta.keep_old_clusters {
                    if let Some(allocation) = old_entry.allocation() {
                        freed.push(allocation);
                    }
                }

                table.set(index, L2Entry::for_data_cluster(host));

                if self.extended_l2 {
                    let cluster_lo = (i * CLUSTER_SIZE) as u64;
                    let cluster_hi = ((i + 1) * CLUSTER_SIZE) as u64;
                    let from = touched_from.max(cluster_lo) - cluster_lo;
                    let to = touched_to.min(cluster_hi) - cluster_lo;

                    let sc_from = from as usize >> self.subcluster_bits;
                    let sc_to = (to as usize + self.subcluster_size - 1) >> self.subcluster_bits;

                    let bitmap = table.get_bitmap(index);
                    table.set_bitmap(
                        index,
                        (bitmap | sc_alloc_mask(sc_from, sc_to))
                            & !sc_zero_mask(sc_from, sc_to),
                    );
                }
            }
        }
        handle.mark_dirty();

        for (host_offset, clusters) in freed {
            self.free_clusters(m, host_offset, (clusters * CLUSTER_SIZE) as u64)
                .await;
        }

        Ok(())
    }

    /// Roll a planned allocation back: newly allocated clusters are freed,
    /// the L2 table is left untouched.
    pub(super) async fn alloc_cluster_abort(&self, m: &mut Qcow2Metadata, meta: &L2Meta) {
        if !meta.keep_old_clusters {
            self.free_clusters(
                m,
                meta.alloc_offset,
                (meta.nb_clusters * CLUSTER_SIZE) as u64,
            )
            .await;
        }
    }

    /// Mark a subcluster-aligned range as reading zero.  Compressed
    /// clusters can only be zeroed whole.
    pub(super) async fn subcluster_zeroize(
        &self,
        m: &mut Qcow2Metadata,
        offset: u64,
        bytes: u64,
    ) -> BlockResult<()> {
        debug_assert!(offset & (self.subcluster_size as u64 - 1) == 0);
        debug_assert!(bytes & (self.subcluster_size as u64 - 1) == 0);

        let mut offset = offset;
        let end = offset + bytes;

        while offset < end {
            let split = self.split_guest_offset(offset);
            let chunk = (end - offset).min((CLUSTER_SIZE - split.in_cluster) as u64);

            let l1_entry = if m.l1_table.in_bounds(split.l1_index) {
                m.l1_table.get(split.l1_index)
            } else {
                Default::default()
            };
            if l1_entry.is_empty() && self.backing.is_none() {
                // Reads as zero already, and allocating an L2 table just to
                // say so helps no one
                offset += chunk;
                continue;
            }

            let l2_offset = self.ensure_l2(m, split.l1_index).await?;
            let handle = self.l2_table(m, l2_offset).await?;

            let sc_from = self.sc_index(split.in_cluster);
            let sc_to = self.sc_index(split.in_cluster + chunk as usize - 1) + 1;
            let whole_cluster = sc_from == 0 && sc_to == self.subclusters_per_cluster;

            let mut freed: Option<(u64, usize)> = None;
            {
                let mut table = handle.value().write().await;
                let entry = table.get(split.l2_index);

                if entry.is_compressed() {
                    if !whole_cluster {
                        return Err(BlockError::NotSupported(
                            "cannot zero part of a compressed cluster".into(),
                        ));
                    }
                    freed = entry.allocation();
                    if self.extended_l2 {
                        table.set(split.l2_index, L2Entry::from_plain(0));
                        table.set_bitmap(split.l2_index, SC_BITMAP_ALL_ZERO);
                    } else {
                        table.set(split.l2_index, L2Entry::for_zero_cluster(0, false));
                    }
                } else if self.extended_l2 {
                    let bitmap = table.get_bitmap(split.l2_index);
                    table.set_bitmap(
                        split.l2_index,
                        (bitmap | sc_zero_mask(sc_from, sc_to)) & !sc_alloc_mask(sc_from, sc_to),
                    );
                } else {
                    table.set(
                        split.l2_index,
                        L2Entry::for_zero_cluster(entry.cluster_offset(), entry.is_copied()),
                    );
                }
            }
            handle.mark_dirty();

            if let Some((host_offset, clusters)) = freed {
                self.free_clusters(m, host_offset, (clusters * CLUSTER_SIZE) as u64)
                    .await;
            }

            offset += chunk;
        }

        Ok(())
    }
}
