//! The qcow2 driver: a copy-on-write image format with two-level cluster
//! mapping, refcounted allocation, optional subcluster granularity
//! (extended L2 entries) and backing files.
//!
//! Requests run as cooperative tasks.  One async mutex per image guards
//! all metadata (L1 table, refcount structures, both metadata caches and
//! the in-flight allocation list); it is held while mappings are resolved
//! and allocations planned or committed, and dropped across guest data
//! I/O.

mod cluster;
mod header;
mod refcount;
mod table;

use cluster::{InFlightList, L2Meta, Planned, SubclusterType};
use header::Qcow2Header;
use table::{L1Table, RefTable, Table};

use crate::helpers::cache::MetadataCache;
use crate::helpers::{IoVector, IoVectorMut};
use crate::node::{require, BlockStatus, ImageNode};
use crate::raw::RawImage;
use crate::{BlockError, BlockResult};

use log::{debug, error, warn};
use miniz_oxide::inflate::core::{decompress as inflate, DecompressorOxide};
use miniz_oxide::inflate::TINFLStatus;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::Mutex as AsyncMutex;

pub const QCOW2_MAGIC: u32 = 0x5146_49fb;

pub(crate) const CLUSTER_BITS: u32 = 16;
pub(crate) const CLUSTER_SIZE: usize = 1 << CLUSTER_BITS;
pub(crate) const REFCOUNT_ORDER: u32 = 4;
/// log2 of the number of refcounts per refcount block
pub(crate) const RB_BITS: u32 = CLUSTER_BITS - (REFCOUNT_ORDER - 3);
pub(crate) const RB_ENTRIES: usize = 1 << RB_BITS;
pub(crate) const SUBCLUSTERS_PER_CLUSTER: usize = 32;
pub(crate) const L2E_OFFSET_MASK: u64 = 0x00ff_ffff_ffff_fe00;

pub(crate) const INCOMPAT_DIRTY: u64 = 1 << 0;
pub(crate) const INCOMPAT_CORRUPT: u64 = 1 << 1;
pub(crate) const INCOMPAT_EXTL2: u64 = 1 << 4;

pub(crate) const HEADER_LENGTH: u32 = 112;
pub(crate) const V2_HEADER_LENGTH: u32 = 72;
pub(crate) const BACKING_NAME_OFFSET: u64 = HEADER_LENGTH as u64;

// Fixed layout of a fresh image: header and L1 table share cluster 0, the
// refcount table occupies clusters 1 and 2, the first refcount block is
// cluster 3.  All four are created with refcount 1.
const L1_TABLE_OFFSET: u64 = 0x8000;
const REFCOUNT_TABLE_OFFSET: u64 = CLUSTER_SIZE as u64;
const REFCOUNT_TABLE_CLUSTERS: usize = 2;
const FIRST_REFBLOCK_OFFSET: u64 = 3 * CLUSTER_SIZE as u64;
const RESERVED_CLUSTERS: usize = 4;

const IOV_MAX: usize = 1024;

/// Options accepted by [`Qcow2Image::create`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Qcow2CreateOptions {
    /// Virtual size in bytes (required)
    pub size: Option<u64>,
    /// Path of the backing file, stored in the image header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing: Option<String>,
    /// Enable extended L2 entries (subcluster allocation)
    #[serde(default)]
    pub subcluster: bool,
}

/// Options accepted by [`Qcow2Image::open`].
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Qcow2OpenOptions {
    /// Override the backing file recorded in the header
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backing: Option<String>,
    /// L2 table cache capacity in bytes; the default covers every L2
    /// table of the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub l2_cache_size: Option<u64>,
}

/// Parsed header facts, for tooling.
#[derive(Clone, Debug)]
pub struct Qcow2Info {
    pub virtual_size: u64,
    pub version: u32,
    pub extended_l2: bool,
    pub backing_filename: Option<String>,
}

/// Metadata guarded by the image mutex.
struct Qcow2Metadata {
    header: Qcow2Header,
    l1_table: L1Table,
    reftable: RefTable,
    l2_cache: MetadataCache<table::L2Table>,
    refblock_cache: MetadataCache<table::RefBlock>,
    /// Allocator hint: no cluster below this index is expected to be free.
    /// Never moves backwards while the image is open.
    free_cluster_index: u64,
}

/// An open qcow2 image.
pub struct Qcow2Image {
    file: RawImage,
    backing: Option<Box<ImageNode>>,
    backing_filename: Option<String>,
    read_only: bool,
    /// Set after a metadata writeback failure; all further writes are
    /// refused
    frozen: AtomicBool,

    virtual_size: u64,
    version: u32,
    extended_l2: bool,
    l2_bits: u32,
    l2_entries: usize,
    subcluster_bits: u32,
    subcluster_size: usize,
    subclusters_per_cluster: usize,

    meta: AsyncMutex<Qcow2Metadata>,
    cluster_allocs: InFlightList,
}

impl Qcow2Image {
    /// Create a new image file at `path`.
    pub async fn create<P: AsRef<Path>>(path: P, opts: Qcow2CreateOptions) -> BlockResult<()> {
        let path = path.as_ref();
        let size = require(opts.size, "size")?;
        let size = size
            .checked_next_multiple_of(512)
            .ok_or_else(|| BlockError::InvalidArgument("size is too large".into()))?;

        let extended_l2 = opts.subcluster;
        let l2_entries = CLUSTER_SIZE / if extended_l2 { 16 } else { 8 };
        let l1_covers = (l2_entries as u64) << CLUSTER_BITS;
        let l1_size = ((size + l1_covers - 1) / l1_covers) as usize;

        if L1_TABLE_OFFSET as usize + l1_size * 8 > CLUSTER_SIZE {
            return Err(BlockError::ResourceExhausted(format!(
                "virtual size {} needs {} L1 entries, but only {} fit into the first cluster",
                size,
                l1_size,
                (CLUSTER_SIZE - L1_TABLE_OFFSET as usize) / 8
            )));
        }

        debug!(
            "creating qcow2 image {:?}: {} bytes, backing: {:?}, subclusters: {}",
            path, size, opts.backing, extended_l2
        );

        let file = RawImage::create(path)?;
        let mut hdr = Qcow2Header::create_new(
            size,
            l1_size as u32,
            L1_TABLE_OFFSET,
            REFCOUNT_TABLE_OFFSET,
            REFCOUNT_TABLE_CLUSTERS as u32,
            opts.backing.clone(),
            extended_l2,
        );
        hdr.write(&file).await?;

        if let Some(name) = opts.backing.as_ref() {
            file.write(name.as_bytes(), BACKING_NAME_OFFSET).await?;
        }

        if l1_size > 0 {
            let l1_zeroes = vec![0u8; l1_size * 8];
            file.write(&l1_zeroes, L1_TABLE_OFFSET).await?;
        }

        // Refcount table with the first refcount block preset, then the
        // (still empty) block itself
        let mut reftable_bytes = vec![0u8; REFCOUNT_TABLE_CLUSTERS * CLUSTER_SIZE];
        reftable_bytes[..8].copy_from_slice(&FIRST_REFBLOCK_OFFSET.to_be_bytes());
        file.write(&reftable_bytes, REFCOUNT_TABLE_OFFSET).await?;

        let refblock_zeroes = vec![0u8; CLUSTER_SIZE];
        file.write(&refblock_zeroes, FIRST_REFBLOCK_OFFSET).await?;
        file.flush().await?;
        drop(file);

        // Claim the reserved clusters through the regular allocator, so
        // their refcounts land in the first refcount block
        let image = Qcow2Image::open(path, Qcow2OpenOptions::default(), false).await?;
        {
            let mut m = image.meta.lock().await;
            let reserved = image
                .alloc_clusters(&mut m, (RESERVED_CLUSTERS * CLUSTER_SIZE) as u64)
                .await?;
            debug_assert_eq!(reserved, 0);
        }
        image.flush_to_os().await
    }

    /// Open an existing image.
    pub async fn open<P: AsRef<Path>>(
        path: P,
        opts: Qcow2OpenOptions,
        read_only: bool,
    ) -> BlockResult<Qcow2Image> {
        let path = path.as_ref();
        let file = RawImage::open(path, read_only)?;
        let hdr = Qcow2Header::load(&file, read_only).await?;

        let extended_l2 = hdr.extended_l2();
        let l2_entries = CLUSTER_SIZE / if extended_l2 { 16 } else { 8 };
        let l2_bits = l2_entries.trailing_zeros();
        let (subcluster_bits, subcluster_size, subclusters_per_cluster) = if extended_l2 {
            (CLUSTER_BITS - 5, CLUSTER_SIZE / SUBCLUSTERS_PER_CLUSTER, SUBCLUSTERS_PER_CLUSTER)
        } else {
            (CLUSTER_BITS, CLUSTER_SIZE, 1)
        };

        let virtual_size = hdr.size();
        let l1_covers = (hdr.l1_entries() as u64) * (l2_entries as u64) * CLUSTER_SIZE as u64;
        if l1_covers < virtual_size {
            return Err(BlockError::CorruptImage(format!(
                "L1 table with {} entries covers only {} bytes of the {}-byte virtual disk",
                hdr.l1_entries(),
                l1_covers,
                virtual_size
            )));
        }

        debug!(
            "opening qcow2 image {:?}: {} bytes, {} L1 entries, extended L2: {}, read-only: {}",
            path,
            virtual_size,
            hdr.l1_entries(),
            extended_l2,
            read_only
        );

        let l1_table = L1Table::load(&file, hdr.l1_table_offset(), hdr.l1_entries()).await?;
        let reftable = RefTable::load(
            &file,
            hdr.reftable_offset(),
            hdr.reftable_clusters() * (CLUSTER_SIZE / 8),
        )
        .await?;

        let l2_cache_entries = match opts.l2_cache_size {
            Some(bytes) => ((bytes as usize + CLUSTER_SIZE - 1) / CLUSTER_SIZE).max(1),
            None => hdr.l1_entries().max(1),
        };
        let refblock_cache_entries = (l2_cache_entries / 2).max(1);

        let backing_filename = opts
            .backing
            .clone()
            .or_else(|| hdr.backing_filename().cloned());
        let backing = match backing_filename.as_ref() {
            Some(name) => {
                let backing_path = Path::new(name);
                let resolved = if backing_path.is_absolute() {
                    backing_path.to_path_buf()
                } else {
                    path.parent().unwrap_or_else(|| Path::new(".")).join(backing_path)
                };
                Some(Box::new(ImageNode::open(resolved, true).await?))
            }
            None => None,
        };

        Ok(Qcow2Image {
            file,
            backing,
            backing_filename,
            read_only,
            frozen: AtomicBool::new(false),
            virtual_size,
            version: hdr.version(),
            extended_l2,
            l2_bits,
            l2_entries,
            subcluster_bits,
            subcluster_size,
            subclusters_per_cluster,
            meta: AsyncMutex::new(Qcow2Metadata {
                header: hdr,
                l1_table,
                reftable,
                l2_cache: MetadataCache::new(l2_cache_entries),
                refblock_cache: MetadataCache::new(refblock_cache_entries),
                free_cluster_index: 0,
            }),
            cluster_allocs: Arc::new(StdMutex::new(Vec::new())),
        })
    }

    pub fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    pub fn info(&self) -> Qcow2Info {
        Qcow2Info {
            virtual_size: self.virtual_size,
            version: self.version,
            extended_l2: self.extended_l2,
            backing_filename: self.backing_filename.clone(),
        }
    }

    fn check_writable(&self) -> BlockResult<()> {
        if self.read_only {
            return Err(BlockError::InvalidArgument("image is read-only".into()));
        }
        if self.frozen.load(Ordering::Relaxed) {
            return Err(BlockError::Io(std::io::Error::other(
                "image is frozen after a metadata writeback failure",
            )));
        }
        Ok(())
    }

    /// Give up on cached metadata after a writeback failure.  The on-disk
    /// state is still self-consistent (ordered flushes), but this image
    /// can no longer guarantee anything it has buffered.
    fn freeze(&self, m: &mut Qcow2Metadata) {
        if !self.frozen.swap(true, Ordering::Relaxed) {
            error!("metadata writeback failed; freezing the image, further writes will be refused");
        }
        m.l2_cache.discard_dirty();
        m.refblock_cache.discard_dirty();
    }

    /// Read into `bufv` from `offset`.  Reads past the virtual size return
    /// zeroes.
    pub async fn preadv_part(&self, bufv: IoVectorMut<'_>, offset: u64) -> BlockResult<()> {
        // Split off anything beyond the image end and zero it
        let remaining = self.virtual_size.saturating_sub(offset);
        let (mut bufv, mut past_end) = bufv.split_at(remaining);
        if !past_end.is_empty() {
            past_end.fill(0);
        }

        let mut offset = offset;

        while !bufv.is_empty() {
            let run = {
                let mut m = self.meta.lock().await;
                self.get_host_offset(&mut m, offset, bufv.len()).await?
            };

            let (mut run_bufv, tail) = bufv.split_at(run.bytes);
            bufv = tail;

            match run.sc_type {
                SubclusterType::ZeroPlain | SubclusterType::ZeroAlloc => run_bufv.fill(0),
                SubclusterType::UnallocatedPlain | SubclusterType::UnallocatedAlloc => {
                    match self.backing.as_ref() {
                        None => run_bufv.fill(0),
                        Some(backing) => backing.readv(run_bufv, offset).await?,
                    }
                }
                SubclusterType::Normal => {
                    self.file.readv(run_bufv, run.host_offset.unwrap()).await?;
                }
                SubclusterType::Compressed => {
                    let (blob_offset, blob_len) = run.compressed.unwrap();
                    let in_cluster = offset as usize & (CLUSTER_SIZE - 1);
                    self.read_compressed(blob_offset, blob_len, run_bufv, in_cluster)
                        .await?;
                }
                SubclusterType::Invalid => unreachable!(),
            }

            offset += run.bytes;
        }

        Ok(())
    }

    async fn read_compressed(
        &self,
        blob_offset: u64,
        blob_len: usize,
        mut bufv: IoVectorMut<'_>,
        in_cluster: usize,
    ) -> BlockResult<()> {
        let mut compressed = vec![0u8; blob_len];
        self.file.read(&mut compressed, blob_offset).await?;

        let mut uncompressed = vec![0u8; CLUSTER_SIZE];
        let mut decompressor = DecompressorOxide::new();
        let (status, _read, written) =
            inflate(&mut decompressor, &compressed, &mut uncompressed, 0, 0);
        // `blob_len` generally exceeds the actual compressed length, so
        // `HasMoreOutput` is expected
        if status != TINFLStatus::Done && status != TINFLStatus::HasMoreOutput {
            return Err(BlockError::CorruptImage(format!(
                "failed to decompress cluster (host offset 0x{:x}+{}): {:?}",
                blob_offset, blob_len, status
            )));
        }
        if written < CLUSTER_SIZE {
            return Err(BlockError::CorruptImage(format!(
                "failed to decompress cluster (host offset 0x{:x}+{}): got {} bytes, expected {}",
                blob_offset, blob_len, written, CLUSTER_SIZE
            )));
        }

        let len = bufv.len() as usize;
        bufv.copy_from_slice(&uncompressed[in_cluster..in_cluster + len]);
        Ok(())
    }

    /// Write `bufv` at `offset`.  Writes are not atomic across clusters;
    /// on error, a prefix of the request may already be on disk.
    pub async fn pwritev_part(&self, mut bufv: IoVector<'_>, offset: u64) -> BlockResult<()> {
        self.check_writable()?;
        if bufv.is_empty() {
            return Ok(());
        }
        if offset
            .checked_add(bufv.len())
            .map(|end| end > self.virtual_size)
            != Some(false)
        {
            return Err(BlockError::InvalidArgument(
                "cannot write beyond the end of the image".into(),
            ));
        }

        let mut offset = offset;
        while !bufv.is_empty() {
            // Plan: map or allocate under the image lock, waiting out any
            // in-flight allocation overlapping our start
            let (host_offset, bytes, meta) = loop {
                let mut m = self.meta.lock().await;
                match self.alloc_host_offset(&mut m, offset, bufv.len()).await {
                    Ok(Planned::Run {
                        host_offset,
                        bytes,
                        meta,
                    }) => break (host_offset, bytes, meta),
                    Ok(Planned::Wait(receivers)) => {
                        drop(m);
                        for receiver in receivers {
                            let _ = receiver.await;
                        }
                    }
                    Err(err) => return Err(err),
                }
            };

            let (run_bufv, tail) = bufv.split_at(bytes);
            bufv = tail;

            // I/O with the lock dropped
            let mut meta = meta;
            let result = self
                .pwritev_task(run_bufv, offset, host_offset, meta.as_mut())
                .await;

            // Commit or roll back under the lock
            let mut m = self.meta.lock().await;
            match (result, meta) {
                (Ok(()), Some(meta)) => self.handle_l2meta(&mut m, meta, true).await?,
                (Ok(()), None) => {}
                (Err(err), Some(meta)) => {
                    let _ = self.handle_l2meta(&mut m, meta, false).await;
                    return Err(err);
                }
                (Err(err), None) => return Err(err),
            }
            drop(m);

            offset += bytes;
        }

        Ok(())
    }

    /// The unlocked part of a write: optional zero-optimization of the COW
    /// envelope, COW reads, and the data write(s).
    async fn pwritev_task(
        &self,
        bufv: IoVector<'_>,
        guest_offset: u64,
        host_offset: u64,
        meta: Option<&mut L2Meta>,
    ) -> BlockResult<()> {
        let Some(meta) = meta else {
            return self.file.writev(bufv, host_offset).await;
        };

        self.handle_alloc_space(meta).await?;

        let cow = !meta.skip_cow && (!meta.cow_start.is_empty() || !meta.cow_end.is_empty());
        if !cow {
            return self.file.writev(bufv, host_offset).await;
        }

        // Fill the COW regions from the pre-allocation mapping; the read
        // dispatch handles zero and backing sources without touching disk
        // where possible
        let mut head_buf = vec![0u8; meta.cow_start.nb_bytes as usize];
        let mut tail_buf = vec![0u8; meta.cow_end.nb_bytes as usize];
        if !meta.cow_start.is_empty() {
            self.preadv_part(
                IoVectorMut::from(&mut head_buf[..]),
                meta.offset + meta.cow_start.offset,
            )
            .await?;
        }
        if !meta.cow_end.is_empty() {
            self.preadv_part(
                IoVectorMut::from(&mut tail_buf[..]),
                meta.offset + meta.cow_end.offset,
            )
            .await?;
        }

        // If the request exactly fills the gap between the COW regions,
        // submit everything as a single write
        let merge = meta.offset + meta.cow_start.end() == guest_offset
            && meta.offset + meta.cow_end.offset == guest_offset + bufv.len()
            && bufv.buffer_count() <= IOV_MAX - 2;

        if merge {
            let mut combined = IoVector::with_capacity(bufv.buffer_count() + 2);
            combined.push(&head_buf);
            combined.append(bufv);
            combined.push(&tail_buf);
            self.file
                .writev(combined, meta.alloc_offset + meta.cow_start.offset)
                .await
        } else {
            self.file.writev(bufv, host_offset).await?;
            if !meta.cow_start.is_empty() {
                self.file
                    .write(&head_buf, meta.alloc_offset + meta.cow_start.offset)
                    .await?;
            }
            if !meta.cow_end.is_empty() {
                self.file
                    .write(&tail_buf, meta.alloc_offset + meta.cow_end.offset)
                    .await?;
            }
            Ok(())
        }
    }

    /// When both COW regions are known to read as zero, zero the whole
    /// allocation envelope with one constant-time request instead of
    /// copying.
    async fn handle_alloc_space(&self, meta: &mut L2Meta) -> BlockResult<()> {
        if meta.cow_start.is_empty() && meta.cow_end.is_empty() {
            return Ok(());
        }
        if !self.is_zero_cow(meta).await? {
            return Ok(());
        }

        let start = meta.alloc_offset + meta.cow_start.offset;
        let nb_bytes = meta.cow_end.end() - meta.cow_start.offset;
        match self.file.write_zeroes(start, nb_bytes, true).await {
            Ok(()) => {
                meta.skip_cow = true;
                Ok(())
            }
            Err(BlockError::NotSupported(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    async fn is_zero_cow(&self, meta: &L2Meta) -> BlockResult<bool> {
        Ok(self
            .is_zero(meta.offset + meta.cow_start.offset, meta.cow_start.nb_bytes)
            .await?
            && self
                .is_zero(meta.offset + meta.cow_end.offset, meta.cow_end.nb_bytes)
                .await?)
    }

    /// Commit (`link`) or roll back an `L2Meta`, then release its place in
    /// the in-flight list.
    async fn handle_l2meta(
        &self,
        m: &mut Qcow2Metadata,
        mut meta: L2Meta,
        link: bool,
    ) -> BlockResult<()> {
        let result = if link {
            let result = self.alloc_cluster_link_l2(m, &meta).await;
            if result.is_err() {
                self.alloc_cluster_abort(m, &meta).await;
            }
            result
        } else {
            self.alloc_cluster_abort(m, &meta).await;
            Ok(())
        };

        meta.release();

        if let Err(ref err) = result {
            if err.is_metadata_hazard() {
                self.freeze(m);
            }
        }
        result
    }

    /// Make `[offset, offset + bytes)` read as zeroes without writing the
    /// data clusters.
    ///
    /// The range must be aligned to the subcluster size (the cluster size
    /// for standard images) on both ends, except that the end may coincide
    /// with the virtual size.  An unaligned range is widened outward when
    /// its surroundings already read as zero; otherwise `NotSupported` is
    /// returned and the caller must fall back to writing zeroes.
    pub async fn pwrite_zeroes(&self, offset: u64, bytes: u64) -> BlockResult<()> {
        self.check_writable()?;
        if bytes == 0 {
            return Ok(());
        }
        let end = offset
            .checked_add(bytes)
            .filter(|end| *end <= self.virtual_size)
            .ok_or_else(|| {
                BlockError::InvalidArgument("cannot zero beyond the end of the image".into())
            })?;

        let sc_size = self.subcluster_size as u64;
        let head = offset & (sc_size - 1);
        let tail = if end == self.virtual_size {
            // Nothing past the virtual size is observable; no rounding
            // needed at the very end of the disk
            0
        } else {
            end.next_multiple_of(sc_size) - end
        };

        let unaligned = head > 0 || tail > 0;
        if unaligned
            && !(self.is_zero(offset - head, head).await?
                && self.is_zero(end, tail).await?)
        {
            return Err(BlockError::NotSupported(
                "unaligned zero-write over non-zero surroundings".into(),
            ));
        }

        let zero_from = offset - head;
        // At the very end of the disk the final partial subcluster is
        // zeroed whole; the part past the virtual size is not observable
        let zero_to = if end == self.virtual_size {
            end.next_multiple_of(sc_size)
        } else {
            end + tail
        };

        // Wait out in-flight allocations covering the range, then hold the
        // lock for the whole metadata update
        let mut m = loop {
            let m = self.meta.lock().await;
            let range = (zero_from >> CLUSTER_BITS)..(((zero_to - 1) >> CLUSTER_BITS) + 1);
            let receivers = self.intersecting_allocs(&range);
            if receivers.is_empty() {
                break m;
            }
            drop(m);
            for receiver in receivers {
                let _ = receiver.await;
            }
        };

        if unaligned {
            // A writer may have slipped in since the zero check above
            let head_run = self.get_host_offset(&mut m, zero_from, 1).await?;
            let tail_check = (zero_to - 1).min(self.virtual_size - 1);
            let tail_run = self.get_host_offset(&mut m, tail_check, 1).await?;
            for run in [head_run, tail_run] {
                match run.sc_type {
                    SubclusterType::UnallocatedPlain
                    | SubclusterType::UnallocatedAlloc
                    | SubclusterType::ZeroPlain
                    | SubclusterType::ZeroAlloc => {}
                    _ => {
                        return Err(BlockError::NotSupported(
                            "unaligned zero-write raced with a data write".into(),
                        ))
                    }
                }
            }
        }

        let result = self.subcluster_zeroize(&mut m, zero_from, zero_to - zero_from).await;
        if let Err(ref err) = result {
            if err.is_metadata_hazard() {
                self.freeze(&mut m);
            }
        }
        result
    }

    /// Classification of the contiguous run starting at `offset`.
    pub async fn block_status(&self, offset: u64, bytes: u64) -> BlockResult<BlockStatus<'_>> {
        if bytes == 0 || offset >= self.virtual_size {
            return Err(BlockError::InvalidArgument(
                "block status query outside the image".into(),
            ));
        }
        let bytes = bytes.min(self.virtual_size - offset);

        let run = {
            let mut m = self.meta.lock().await;
            self.get_host_offset(&mut m, offset, bytes).await?
        };

        let zero = matches!(
            run.sc_type,
            SubclusterType::ZeroPlain | SubclusterType::ZeroAlloc
        ) || (self.backing.is_none()
            && matches!(
                run.sc_type,
                SubclusterType::UnallocatedPlain | SubclusterType::UnallocatedAlloc
            ));
        let data = matches!(
            run.sc_type,
            SubclusterType::Normal | SubclusterType::Compressed
        );
        let offset_valid = run.host_offset.is_some();

        Ok(BlockStatus {
            bytes: run.bytes,
            zero,
            data,
            offset_valid,
            host_offset: run.host_offset.unwrap_or(0),
            file: offset_valid.then_some(&self.file),
        })
    }

    /// Whether the range reads as zeroes, consulting the backing chain for
    /// unallocated parts.  Anything past the virtual size counts as zero.
    pub(crate) async fn is_zero(&self, offset: u64, bytes: u64) -> BlockResult<bool> {
        let end = offset.saturating_add(bytes).min(self.virtual_size);
        let mut offset = offset.min(end);

        while offset < end {
            let status = self.block_status(offset, end - offset).await?;
            if status.zero {
                offset += status.bytes;
            } else if !status.data {
                match self.backing.as_ref() {
                    Some(backing) => {
                        if !backing.is_zero_fast(offset, status.bytes).await? {
                            return Ok(false);
                        }
                        offset += status.bytes;
                    }
                    None => offset += status.bytes,
                }
            } else {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Write out dirty L2 tables, then dirty refcount blocks, then flush
    /// the data file.
    pub async fn flush_to_os(&self) -> BlockResult<()> {
        {
            let mut m = self.meta.lock().await;
            let file = &self.file;

            let result = async {
                m.l2_cache
                    .flush(|entry| async move { entry.value().read().await.write(file).await })
                    .await?;
                m.refblock_cache
                    .flush(|entry| async move { entry.value().read().await.write(file).await })
                    .await
            }
            .await;

            if let Err(err) = result {
                self.freeze(&mut m);
                return Err(err);
            }
        }

        self.file.flush().await
    }

    /// Best-effort teardown; flush failures are logged, not returned.
    pub async fn close(&self) -> BlockResult<()> {
        if let Err(err) = self.flush_to_os().await {
            warn!("failed to flush qcow2 metadata on close: {}", err);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::table::Table;
    use super::*;
    use std::collections::HashMap;
    use std::os::unix::fs::FileExt;
    use std::path::{Path, PathBuf};

    const MIB: u64 = 1 << 20;

    fn image_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
        dir.path().join(name)
    }

    async fn create_image(path: &Path, size: u64, subcluster: bool) {
        Qcow2Image::create(
            path,
            Qcow2CreateOptions {
                size: Some(size),
                backing: None,
                subcluster,
            },
        )
        .await
        .unwrap();
    }

    async fn open_rw(path: &Path) -> Qcow2Image {
        Qcow2Image::open(path, Qcow2OpenOptions::default(), false)
            .await
            .unwrap()
    }

    async fn read_vec(image: &Qcow2Image, offset: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0xcc; len];
        image
            .preadv_part(IoVectorMut::from(&mut buf[..]), offset)
            .await
            .unwrap();
        buf
    }

    async fn write_buf(image: &Qcow2Image, offset: u64, data: &[u8]) {
        image
            .pwritev_part(IoVector::from(data), offset)
            .await
            .unwrap();
    }

    fn test_pattern(len: usize, seed: u64) -> Vec<u8> {
        (0..len).map(|i| ((i as u64 * 31 + seed) % 251) as u8).collect()
    }

    fn be64(buf: &[u8], offset: usize) -> u64 {
        u64::from_be_bytes(buf[offset..offset + 8].try_into().unwrap())
    }

    /// Full-walk verification: the refcount of every host cluster must
    /// equal the number of references to it (cluster 0 for header+L1, the
    /// refcount table, refblocks, L1->L2, L2->data), and every copied flag
    /// must match "refcount == 1".
    fn verify_refcounts(path: &Path) {
        let file = std::fs::File::open(path).unwrap();
        let mut hdr = [0u8; 112];
        file.read_exact_at(&mut hdr, 0).unwrap();

        let l1_size = u32::from_be_bytes(hdr[36..40].try_into().unwrap()) as usize;
        let l1_offset = be64(&hdr, 40);
        let rt_offset = be64(&hdr, 48);
        let rt_clusters = u32::from_be_bytes(hdr[56..60].try_into().unwrap()) as usize;
        let extended = be64(&hdr, 72) & INCOMPAT_EXTL2 != 0;
        let entry_size = if extended { 16 } else { 8 };
        let l2_entries = CLUSTER_SIZE / entry_size;

        let mut expected: HashMap<u64, u16> = HashMap::new();
        let add = |expected: &mut HashMap<u64, u16>, offset: u64, n: usize| {
            for i in 0..n {
                *expected.entry((offset >> CLUSTER_BITS) + i as u64).or_default() += 1;
            }
        };

        add(&mut expected, 0, 1);
        add(&mut expected, rt_offset, rt_clusters);

        let mut rt_bytes = vec![0u8; rt_clusters * CLUSTER_SIZE];
        file.read_exact_at(&mut rt_bytes, rt_offset).unwrap();
        let refblocks: Vec<(usize, u64)> = (0..rt_bytes.len() / 8)
            .filter_map(|i| {
                let value = be64(&rt_bytes, i * 8);
                (value != 0).then_some((i, value))
            })
            .collect();
        for (_, rb_offset) in &refblocks {
            add(&mut expected, *rb_offset, 1);
        }

        // (cluster, copied flag) for every L1/L2 reference
        let mut copied_flags: Vec<(u64, bool)> = Vec::new();

        let mut l1_bytes = vec![0u8; l1_size * 8];
        file.read_exact_at(&mut l1_bytes, l1_offset).unwrap();
        for i in 0..l1_size {
            let l1_entry = be64(&l1_bytes, i * 8);
            let l2_offset = l1_entry & L2E_OFFSET_MASK;
            if l2_offset == 0 {
                continue;
            }
            add(&mut expected, l2_offset, 1);
            copied_flags.push((l2_offset >> CLUSTER_BITS, l1_entry >> 63 != 0));

            let mut l2_bytes = vec![0u8; CLUSTER_SIZE];
            file.read_exact_at(&mut l2_bytes, l2_offset).unwrap();
            for j in 0..l2_entries {
                let word = be64(&l2_bytes, j * entry_size);
                let entry = super::table::L2Entry::from_plain(word);
                if let Some((base, clusters)) = entry.allocation() {
                    add(&mut expected, base, clusters);
                    if !entry.is_compressed() {
                        copied_flags.push((base >> CLUSTER_BITS, entry.is_copied()));
                    }
                }
            }
        }

        let mut actual: HashMap<u64, u16> = HashMap::new();
        for (rt_index, rb_offset) in &refblocks {
            let mut rb_bytes = vec![0u8; CLUSTER_SIZE];
            file.read_exact_at(&mut rb_bytes, *rb_offset).unwrap();
            for i in 0..RB_ENTRIES {
                let count = u16::from_be_bytes(rb_bytes[i * 2..i * 2 + 2].try_into().unwrap());
                if count != 0 {
                    actual.insert(((*rt_index as u64) << RB_BITS) + i as u64, count);
                }
            }
        }

        assert_eq!(expected, actual, "refcounts diverge from the reference walk");
        for (cluster, copied) in copied_flags {
            assert_eq!(
                copied,
                actual.get(&cluster) == Some(&1),
                "copied flag wrong for host cluster {}",
                cluster
            );
        }
    }

    #[tokio::test]
    async fn fresh_image_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_path(&dir, "a.qcow2");
        create_image(&path, MIB, false).await;
        verify_refcounts(&path);

        let image = open_rw(&path).await;
        assert_eq!(image.virtual_size(), MIB);

        let data = read_vec(&image, 0, CLUSTER_SIZE).await;
        assert!(data.iter().all(|b| *b == 0));

        let status = image.block_status(0, CLUSTER_SIZE as u64).await.unwrap();
        assert!(status.zero);
        assert!(!status.data);
        assert!(!status.offset_valid);
        assert_eq!(status.bytes, CLUSTER_SIZE as u64);
    }

    #[tokio::test]
    async fn write_read_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_path(&dir, "a.qcow2");
        create_image(&path, MIB, false).await;

        {
            let image = open_rw(&path).await;
            write_buf(&image, 0, &[0x01; 4096]).await;

            let data = read_vec(&image, 0, 8192).await;
            assert!(data[..4096].iter().all(|b| *b == 0x01));
            assert!(data[4096..].iter().all(|b| *b == 0));

            image.close().await.unwrap();
        }
        verify_refcounts(&path);

        let image = open_rw(&path).await;
        let data = read_vec(&image, 0, 8192).await;
        assert!(data[..4096].iter().all(|b| *b == 0x01));
        assert!(data[4096..].iter().all(|b| *b == 0));

        let status = image.block_status(0, 4096).await.unwrap();
        assert!(status.data && !status.zero && status.offset_valid);
    }

    #[tokio::test]
    async fn write_straddling_cluster_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_path(&dir, "a.qcow2");
        create_image(&path, MIB, false).await;

        let image = open_rw(&path).await;
        write_buf(&image, 65535, &[0xaa]).await;
        write_buf(&image, 65536, &[0xbb]).await;

        let data = read_vec(&image, 65534, 4).await;
        assert_eq!(data, [0x00, 0xaa, 0xbb, 0x00]);

        image.close().await.unwrap();
        verify_refcounts(&path);

        let image = open_rw(&path).await;
        assert_eq!(read_vec(&image, 65534, 4).await, [0x00, 0xaa, 0xbb, 0x00]);
    }

    #[tokio::test]
    async fn subcluster_zero_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_path(&dir, "a.qcow2");
        create_image(&path, MIB, true).await;

        let image = open_rw(&path).await;
        write_buf(&image, 2048, &[0x77; 2048]).await;
        image.pwrite_zeroes(2048, 2048).await.unwrap();

        let data = read_vec(&image, 2048, 2048).await;
        assert!(data.iter().all(|b| *b == 0));

        let status = image.block_status(2048, 2048).await.unwrap();
        assert!(status.zero);
        assert!(!status.data);
        assert!(status.offset_valid);

        // A second zero-write must not change the on-disk state
        image.flush_to_os().await.unwrap();
        let before = std::fs::read(&path).unwrap();
        image.pwrite_zeroes(2048, 2048).await.unwrap();
        image.flush_to_os().await.unwrap();
        assert_eq!(before, std::fs::read(&path).unwrap());

        image.close().await.unwrap();
        verify_refcounts(&path);

        // ALLOC and ZERO bits must be disjoint for the touched cluster
        let file = std::fs::File::open(&path).unwrap();
        let mut hdr = [0u8; 112];
        file.read_exact_at(&mut hdr, 0).unwrap();
        let mut l1_entry = [0u8; 8];
        file.read_exact_at(&mut l1_entry, be64(&hdr, 40)).unwrap();
        let l2_offset = u64::from_be_bytes(l1_entry) & L2E_OFFSET_MASK;
        let mut l2_entry = [0u8; 16];
        file.read_exact_at(&mut l2_entry, l2_offset).unwrap();
        let bitmap = be64(&l2_entry, 8);
        assert_eq!(bitmap & (bitmap >> 32) & table::SC_BITMAP_ALL_ALLOC, 0);
        assert_ne!(bitmap & table::sc_zero_mask(1, 2), 0);
    }

    #[tokio::test]
    async fn backing_chain() {
        let dir = tempfile::tempdir().unwrap();
        let base_path = image_path(&dir, "base.qcow2");
        let overlay_path = image_path(&dir, "overlay.qcow2");

        let pattern = test_pattern(2 * CLUSTER_SIZE, 7);
        create_image(&base_path, 2 * MIB, false).await;
        {
            let base = open_rw(&base_path).await;
            write_buf(&base, 0, &pattern).await;
            base.close().await.unwrap();
        }

        Qcow2Image::create(
            &overlay_path,
            Qcow2CreateOptions {
                size: Some(2 * MIB),
                backing: Some(base_path.to_str().unwrap().to_string()),
                subcluster: false,
            },
        )
        .await
        .unwrap();

        let overlay = open_rw(&overlay_path).await;

        // Unwritten ranges read through to the base image
        assert_eq!(read_vec(&overlay, 600, 1200).await, pattern[600..1800]);
        assert_eq!(
            read_vec(&overlay, 65000, 2000).await,
            pattern[65000..67000]
        );

        // A small write copies the rest of its cluster from the base
        write_buf(&overlay, 0, &[0xee; 512]).await;
        let data = read_vec(&overlay, 0, 1024).await;
        assert!(data[..512].iter().all(|b| *b == 0xee));
        assert_eq!(data[512..], pattern[512..1024]);

        // Beyond the copied cluster the base is still visible
        assert_eq!(
            read_vec(&overlay, CLUSTER_SIZE as u64, 1024).await,
            pattern[CLUSTER_SIZE..CLUSTER_SIZE + 1024]
        );

        overlay.close().await.unwrap();
        verify_refcounts(&overlay_path);

        let overlay = open_rw(&overlay_path).await;
        let data = read_vec(&overlay, 0, 1024).await;
        assert!(data[..512].iter().all(|b| *b == 0xee));
        assert_eq!(data[512..], pattern[512..1024]);
    }

    #[tokio::test]
    async fn reftable_growth() {
        use super::table::{RefTable, RefTableEntry, TableEntry};

        let dir = tempfile::tempdir().unwrap();
        let path = image_path(&dir, "a.qcow2");
        create_image(&path, MIB, false).await;

        let image = open_rw(&path).await;
        let old_rt_offset = REFCOUNT_TABLE_OFFSET;

        // Shrink the refcount table to a single entry so that growth
        // becomes reachable without a many-terabyte host file, then push
        // the allocator past its coverage
        {
            let mut m = image.meta.lock().await;

            let entries =
                vec![RefTableEntry::try_from_plain(FIRST_REFBLOCK_OFFSET).unwrap()]
                    .into_boxed_slice();
            let mut small: RefTable = entries.into();
            small.set_offset(REFCOUNT_TABLE_OFFSET);
            m.header.set_reftable(REFCOUNT_TABLE_OFFSET, 1).unwrap();
            m.reftable = small;
            // The second cluster of the original two-cluster table is no
            // longer part of it
            image
                .free_clusters(&mut m, 2 * CLUSTER_SIZE as u64, CLUSTER_SIZE as u64)
                .await;

            m.free_cluster_index = RB_ENTRIES as u64;
            let offset = image
                .alloc_clusters(&mut m, CLUSTER_SIZE as u64)
                .await
                .unwrap();
            // The new refblock describes itself and the new table, then
            // comes our allocation
            assert_eq!(offset, ((RB_ENTRIES + 2) << CLUSTER_BITS) as u64);
            image.free_clusters(&mut m, offset, CLUSTER_SIZE as u64).await;
        }

        {
            let m = image.meta.lock().await;
            assert_ne!(m.header.reftable_offset(), old_rt_offset);
            assert_eq!(
                m.header.reftable_offset(),
                ((RB_ENTRIES + 1) << CLUSTER_BITS) as u64
            );
        }

        // Both clusters of the original refcount table are free now
        {
            let mut m = image.meta.lock().await;
            assert_eq!(image.get_refcount(&mut m, 1).await.unwrap(), 0);
            assert_eq!(image.get_refcount(&mut m, 2).await.unwrap(), 0);
        }

        // The image still works
        write_buf(&image, 0, &[0x42; 4096]).await;
        assert!(read_vec(&image, 0, 4096).await.iter().all(|b| *b == 0x42));

        image.close().await.unwrap();
        verify_refcounts(&path);
    }

    #[tokio::test]
    async fn allocator_hint_never_regresses() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_path(&dir, "a.qcow2");
        create_image(&path, MIB, false).await;

        let image = open_rw(&path).await;
        let mut m = image.meta.lock().await;

        let first = image.alloc_clusters(&mut m, CLUSTER_SIZE as u64).await.unwrap();
        assert_eq!(first, (RESERVED_CLUSTERS * CLUSTER_SIZE) as u64);

        let second = image
            .alloc_clusters(&mut m, 2 * CLUSTER_SIZE as u64)
            .await
            .unwrap();
        assert_eq!(second, first + CLUSTER_SIZE as u64);

        // Freeing must not pull later allocations back down
        image.free_clusters(&mut m, first, CLUSTER_SIZE as u64).await;
        assert_eq!(image.get_refcount(&mut m, 4).await.unwrap(), 0);

        let third = image.alloc_clusters(&mut m, CLUSTER_SIZE as u64).await.unwrap();
        assert!(third > second);

        drop(m);
        image.close().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn overlapping_concurrent_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_path(&dir, "a.qcow2");
        create_image(&path, MIB, false).await;

        let image = open_rw(&path).await;
        let first = vec![0x11u8; 4096];
        let second = vec![0x22u8; 4096];

        let (r1, r2) = tokio::join!(
            image.pwritev_part(IoVector::from(&first[..]), 0),
            image.pwritev_part(IoVector::from(&second[..]), 2048),
        );
        r1.unwrap();
        r2.unwrap();

        let data = read_vec(&image, 0, 8192).await;
        assert!(data[..2048].iter().all(|b| *b == 0x11));
        // The overlap belongs wholly to whichever write landed last
        let winner = data[2048];
        assert!(winner == 0x11 || winner == 0x22);
        assert!(data[2048..4096].iter().all(|b| *b == winner));
        assert!(data[4096..6144].iter().all(|b| *b == 0x22));
        assert!(data[6144..].iter().all(|b| *b == 0));

        image.close().await.unwrap();
        verify_refcounts(&path);
    }

    #[tokio::test]
    async fn zero_write_alignment_rules() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_path(&dir, "a.qcow2");
        create_image(&path, MIB, false).await;

        let image = open_rw(&path).await;

        // Over untouched space, an unaligned request rounds outward
        image.pwrite_zeroes(100, 50).await.unwrap();
        let status = image.block_status(0, CLUSTER_SIZE as u64).await.unwrap();
        assert!(status.zero);

        // Over data, it must be refused so the caller can fall back
        write_buf(&image, 0, &vec![0xff; CLUSTER_SIZE]).await;
        match image.pwrite_zeroes(100, 50).await {
            Err(BlockError::NotSupported(_)) => {}
            other => panic!("expected NotSupported, got {:?}", other),
        }

        // Aligned zeroing of the whole cluster keeps the allocation and
        // flips it to a zero cluster
        image.pwrite_zeroes(0, CLUSTER_SIZE as u64).await.unwrap();
        assert!(read_vec(&image, 0, CLUSTER_SIZE).await.iter().all(|b| *b == 0));
        let status = image.block_status(0, CLUSTER_SIZE as u64).await.unwrap();
        assert!(status.zero && status.offset_valid);

        image.close().await.unwrap();
        verify_refcounts(&path);
    }

    #[tokio::test]
    async fn partial_write_into_allocated_cluster() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_path(&dir, "a.qcow2");
        create_image(&path, MIB, true).await;

        let image = open_rw(&path).await;
        write_buf(&image, 0, &[0xab; 2048]).await;
        // Unaligned write into a different, unallocated subcluster of the
        // same cluster
        write_buf(&image, 3000, &[0x5a; 100]).await;

        let data = read_vec(&image, 0, 6144).await;
        assert!(data[..2048].iter().all(|b| *b == 0xab));
        assert!(data[2048..3000].iter().all(|b| *b == 0));
        assert!(data[3000..3100].iter().all(|b| *b == 0x5a));
        assert!(data[3100..].iter().all(|b| *b == 0));

        // Both subclusters now count as data, served from one cluster
        let status = image.block_status(0, 4096).await.unwrap();
        assert!(status.data && status.offset_valid);
        assert_eq!(status.bytes, 4096);

        image.close().await.unwrap();
        verify_refcounts(&path);

        let image = open_rw(&path).await;
        let data = read_vec(&image, 0, 6144).await;
        assert!(data[3000..3100].iter().all(|b| *b == 0x5a));
        assert!(data[3100..].iter().all(|b| *b == 0));
    }

    #[tokio::test]
    async fn compressed_cluster_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_path(&dir, "a.qcow2");
        create_image(&path, MIB, false).await;

        // Allocate the first cluster normally, then patch its L2 entry to
        // point at a deflate blob
        {
            let image = open_rw(&path).await;
            write_buf(&image, 0, &vec![0u8; CLUSTER_SIZE]).await;
            image.close().await.unwrap();
        }

        let pattern = test_pattern(CLUSTER_SIZE, 99);
        let blob = miniz_oxide::deflate::compress_to_vec(&pattern, 6);
        assert!(blob.len() < CLUSTER_SIZE);

        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut hdr = [0u8; 112];
        file.read_exact_at(&mut hdr, 0).unwrap();
        let mut l1_entry = [0u8; 8];
        file.read_exact_at(&mut l1_entry, be64(&hdr, 40)).unwrap();
        let l2_offset = u64::from_be_bytes(l1_entry) & L2E_OFFSET_MASK;

        let blob_offset = (file.metadata().unwrap().len() + 511) & !511;
        file.write_all_at(&blob, blob_offset).unwrap();

        let compressed_offset_bits = 62 - (CLUSTER_BITS - 8);
        let sectors = ((blob.len() - 1) / 512) as u64;
        let entry = (1u64 << 62) | (sectors << compressed_offset_bits) | blob_offset;
        file.write_all_at(&entry.to_be_bytes(), l2_offset).unwrap();
        drop(file);

        let image = Qcow2Image::open(&path, Qcow2OpenOptions::default(), true)
            .await
            .unwrap();
        assert_eq!(read_vec(&image, 0, CLUSTER_SIZE).await, pattern);
        assert_eq!(read_vec(&image, 1000, 2000).await, pattern[1000..3000]);

        let status = image.block_status(0, CLUSTER_SIZE as u64).await.unwrap();
        assert!(status.data && !status.zero && !status.offset_valid);
    }

    #[tokio::test]
    async fn l2_cache_eviction() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_path(&dir, "a.qcow2");
        create_image(&path, 1024 * MIB, false).await;

        // A single-page L2 cache forces writeback when the second L2
        // table comes in
        let image = Qcow2Image::open(
            &path,
            Qcow2OpenOptions {
                backing: None,
                l2_cache_size: Some(CLUSTER_SIZE as u64),
            },
            false,
        )
        .await
        .unwrap();

        let far = 512 * MIB;
        write_buf(&image, 0, &[0x01; 512]).await;
        write_buf(&image, far, &[0x02; 512]).await;
        write_buf(&image, 4096, &[0x03; 512]).await;

        assert!(read_vec(&image, 0, 512).await.iter().all(|b| *b == 0x01));
        assert!(read_vec(&image, far, 512).await.iter().all(|b| *b == 0x02));
        assert!(read_vec(&image, 4096, 512).await.iter().all(|b| *b == 0x03));

        image.close().await.unwrap();
        verify_refcounts(&path);

        let image = open_rw(&path).await;
        assert!(read_vec(&image, far, 512).await.iter().all(|b| *b == 0x02));
    }

    #[tokio::test]
    async fn create_requires_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_path(&dir, "a.qcow2");
        match Qcow2Image::create(&path, Qcow2CreateOptions::default()).await {
            Err(BlockError::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn read_only_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = image_path(&dir, "a.qcow2");
        create_image(&path, MIB, false).await;

        let image = Qcow2Image::open(&path, Qcow2OpenOptions::default(), true)
            .await
            .unwrap();
        match image.pwritev_part(IoVector::from(&[0u8; 512][..]), 0).await {
            Err(BlockError::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
        match image.pwrite_zeroes(0, 65536).await {
            Err(BlockError::InvalidArgument(_)) => {}
            other => panic!("expected InvalidArgument, got {:?}", other),
        }
    }

    #[test]
    fn options_parse() {
        let opts: Qcow2CreateOptions =
            serde_json::from_str(r#"{"size": 1048576, "subcluster": true}"#).unwrap();
        assert_eq!(opts.size, Some(1048576));
        assert!(opts.subcluster);
        assert!(opts.backing.is_none());

        let opts: Qcow2OpenOptions =
            serde_json::from_str(r#"{"l2-cache-size": 131072, "backing": "base.qcow2"}"#).unwrap();
        assert_eq!(opts.l2_cache_size, Some(131072));
        assert_eq!(opts.backing.as_deref(), Some("base.qcow2"));

        assert!(serde_json::from_str::<Qcow2OpenOptions>(r#"{"bogus": 1}"#).is_err());
    }
}
