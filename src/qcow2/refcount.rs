//! The cluster allocator: refcount bookkeeping and free-cluster search.
//!
//! Refcounts live in a two-level structure (refcount table pointing at
//! refcount blocks).  New refcount blocks are placed at the first cluster
//! they themselves cover, which makes them self-describing: their own
//! refcount is the first entry they hold.  Growing the refcount table
//! follows the recoverable order new block, new table, header, free old
//! table.

use super::table::{RefBlock, Table};
use super::{Qcow2Image, Qcow2Metadata, CLUSTER_BITS, CLUSTER_SIZE, RB_BITS, RB_ENTRIES};
use crate::helpers::cache::CacheEntry;
use crate::{BlockError, BlockResult};
use log::warn;

impl Qcow2Image {
    /// Current refcount of the given host cluster.  Clusters beyond the
    /// refcount structures read as free.
    pub(super) async fn get_refcount(
        &self,
        m: &mut Qcow2Metadata,
        cluster_index: u64,
    ) -> BlockResult<u16> {
        let rt_index = (cluster_index >> RB_BITS) as usize;
        if !m.reftable.in_bounds(rt_index) {
            return Ok(0);
        }

        let rt_entry = m.reftable.get(rt_index);
        if rt_entry.is_empty() {
            return Ok(0);
        }

        let handle = self.refblock(m, rt_entry.refblock_offset()).await?;
        let block = handle.value().read().await;
        Ok(block.get(cluster_index as usize & (RB_ENTRIES - 1)))
    }

    /// Add `delta` to the refcount of each cluster in
    /// `[start_cluster, start_cluster + n_clusters)`.  Refcount blocks are
    /// allocated as needed when increasing.  Decreasing requires
    /// `decrease_is_allowed`; dropping any count below zero is corruption.
    pub(super) async fn update_refcount(
        &self,
        m: &mut Qcow2Metadata,
        start_cluster: u64,
        n_clusters: usize,
        delta: i64,
        decrease_is_allowed: bool,
    ) -> BlockResult<()> {
        if delta == 0 {
            return Ok(());
        }
        if delta < 0 && !decrease_is_allowed {
            return Err(BlockError::InvalidArgument(
                "refcount decrease is not allowed here".into(),
            ));
        }

        let mut cluster = start_cluster;
        let end = start_cluster + n_clusters as u64;
        while cluster < end {
            let rt_index = (cluster >> RB_BITS) as usize;
            let rb_first_cluster = (rt_index as u64) << RB_BITS;

            let rb_offset = if delta > 0 {
                self.alloc_refblock(m, rt_index).await?
            } else {
                if !m.reftable.in_bounds(rt_index) || m.reftable.get(rt_index).is_empty() {
                    return Err(BlockError::CorruptImage(format!(
                        "no refcount block for cluster {} while freeing",
                        cluster
                    )));
                }
                m.reftable.get(rt_index).refblock_offset()
            };

            let handle = self.refblock(m, rb_offset).await?;
            {
                let mut block = handle.value().write().await;
                while cluster < end && (cluster >> RB_BITS) as usize == rt_index {
                    block.update((cluster - rb_first_cluster) as usize, delta)?;
                    cluster += 1;
                }
            }
            handle.mark_dirty();
        }

        Ok(())
    }

    /// Find and claim the lowest run of free clusters large enough for
    /// `size` bytes, starting the search at the free-cluster hint.  The
    /// hint advances past the claimed run and never regresses.
    pub(super) async fn alloc_clusters(&self, m: &mut Qcow2Metadata, size: u64) -> BlockResult<u64> {
        let count = ((size + CLUSTER_SIZE as u64 - 1) >> CLUSTER_BITS) as usize;
        debug_assert!(count > 0);

        // One entry of a refblock must stay free so a new refblock can
        // always hold its own refcount; runs cannot cross refblocks
        if count > RB_ENTRIES - 1 {
            return Err(BlockError::ResourceExhausted(format!(
                "cannot allocate {} contiguous bytes, at most {} are possible",
                size,
                (RB_ENTRIES - 1) * CLUSTER_SIZE,
            )));
        }

        let mut cluster_index = m.free_cluster_index;
        loop {
            let rt_index = (cluster_index >> RB_BITS) as usize;
            let rb_first_cluster = (rt_index as u64) << RB_BITS;
            let rb_index = (cluster_index - rb_first_cluster) as usize;

            if rb_index + count > RB_ENTRIES {
                // Does not fit before the refblock boundary; go on with the
                // next refblock
                cluster_index = rb_first_cluster + RB_ENTRIES as u64;
                continue;
            }

            let rb_offset = self.ensure_refblock(m, rt_index).await?;
            let handle = self.refblock(m, rb_offset).await?;

            let mut found: Option<usize> = None;
            {
                let mut block = handle.value().write().await;

                let mut start_i: Option<usize> = None;
                for i in rb_index..RB_ENTRIES {
                    if block.is_zero(i) {
                        let start = *start_i.get_or_insert(i);
                        if i - start == count - 1 {
                            for j in start..=i {
                                block.increment(j)?;
                            }
                            found = Some(start);
                            break;
                        }
                    } else {
                        start_i = None;
                    }
                }
            }

            if let Some(start) = found {
                handle.mark_dirty();
                let first_cluster = rb_first_cluster + start as u64;
                m.free_cluster_index = first_cluster + count as u64;
                return Ok(first_cluster << CLUSTER_BITS);
            }

            // Nothing free in this refblock
            cluster_index = rb_first_cluster + RB_ENTRIES as u64;
        }
    }

    /// Allocation of metadata that need not be cluster-sized.  Rounds up to
    /// whole clusters; sub-cluster packing is not worth its state.
    pub(super) async fn alloc_bytes(&self, m: &mut Qcow2Metadata, size: u64) -> BlockResult<u64> {
        self.alloc_clusters(m, size).await
    }

    /// Release the clusters backing `[host_offset, host_offset + size)`.
    /// Failures only leak clusters and are not propagated.
    pub(super) async fn free_clusters(&self, m: &mut Qcow2Metadata, host_offset: u64, size: u64) {
        debug_assert!(host_offset & (CLUSTER_SIZE as u64 - 1) == 0);
        let first = host_offset >> CLUSTER_BITS;
        let count = ((size + CLUSTER_SIZE as u64 - 1) >> CLUSTER_BITS) as usize;

        if let Err(err) = self
            .update_refcount(m, first, count, -1, true)
            .await
        {
            warn!(
                "leaking {} cluster(s) at host offset 0x{:x}: {}",
                count, host_offset, err
            );
        }
    }

    /// Cached refcount block at the given host offset.
    async fn refblock(
        &self,
        m: &mut Qcow2Metadata,
        rb_offset: u64,
    ) -> BlockResult<CacheEntry<RefBlock>> {
        let file = &self.file;
        m.refblock_cache
            .get_or_insert(rb_offset, RefBlock::load(file, rb_offset), |entry| async move {
                entry.value().read().await.write(file).await
            })
            .await
    }

    /// Refblock offset for `rt_index`, allocating the block if the slot is
    /// empty.  The refcount table itself must already cover `rt_index`.
    async fn alloc_refblock(&self, m: &mut Qcow2Metadata, rt_index: usize) -> BlockResult<u64> {
        if !m.reftable.in_bounds(rt_index) {
            return Err(BlockError::CorruptImage(format!(
                "refcount table does not cover refblock index {}",
                rt_index
            )));
        }

        let rt_entry = m.reftable.get(rt_index);
        if !rt_entry.is_empty() {
            return Ok(rt_entry.refblock_offset());
        }

        // An empty slot means no cluster it covers was ever allocated, so
        // the block can describe itself: place it at the first cluster it
        // covers, with its own refcount as its first entry
        let rb_offset = ((rt_index as u64) << RB_BITS) << CLUSTER_BITS;

        let mut block = RefBlock::new_cleared();
        block.set_offset(rb_offset);
        block.increment(0)?;
        block.write(&self.file).await?;

        m.reftable.set_refblock_offset(rt_index, rb_offset);
        if let Err(err) = m.reftable.write_entry(&self.file, rt_index).await {
            m.reftable.set(rt_index, rt_entry);
            return Err(err);
        }

        Ok(rb_offset)
    }

    /// Like `alloc_refblock`, but grows the refcount table first when
    /// `rt_index` is beyond it.
    async fn ensure_refblock(&self, m: &mut Qcow2Metadata, rt_index: usize) -> BlockResult<u64> {
        if !m.reftable.in_bounds(rt_index) {
            self.grow_reftable(m, rt_index).await?;
        }
        self.alloc_refblock(m, rt_index).await
    }

    /// Replace the refcount table with a larger copy covering at least
    /// `at_least_index`.  Write order matters for recoverability: the new
    /// refblock first, then the new table, then the header; only then is
    /// the old table freed.
    async fn grow_reftable(&self, m: &mut Qcow2Metadata, at_least_index: usize) -> BlockResult<()> {
        let mut grown = m.reftable.clone_and_grow(at_least_index);
        let grown_clusters = grown.cluster_count();

        if grown_clusters + 1 > RB_ENTRIES {
            return Err(BlockError::ResourceExhausted(format!(
                "the refcount table cannot grow to {} bytes",
                grown.byte_size()
            )));
        }

        // The region right behind what the old table could address is
        // untouched; put the new refblock and the new table there.  The
        // refblock covers that region, so it can describe both itself and
        // the table.
        let new_rt_index = m.reftable.entries();
        debug_assert!(grown.in_bounds(new_rt_index));
        let rb_offset = ((new_rt_index as u64) << RB_BITS) << CLUSTER_BITS;
        let table_offset = rb_offset + CLUSTER_SIZE as u64;

        let mut block = RefBlock::new_cleared();
        block.set_offset(rb_offset);
        block.increment(0)?;
        for i in 1..=grown_clusters {
            block.increment(i)?;
        }
        block.write(&self.file).await?;

        grown.set_refblock_offset(new_rt_index, rb_offset);
        grown.set_offset(table_offset);
        grown.write(&self.file).await?;

        let old_offset = m.reftable.get_offset().unwrap();
        let old_clusters = m.reftable.cluster_count();

        m.header.set_reftable(table_offset, grown_clusters)?;
        if let Err(err) = m.header.write(&self.file).await {
            m.header.set_reftable(old_offset, old_clusters)?;
            return Err(err);
        }

        m.reftable = grown;
        self.free_clusters(m, old_offset, (old_clusters * CLUSTER_SIZE) as u64)
            .await;
        Ok(())
    }

    /// Write back any cached dirty refblocks covering the given host
    /// cluster range.  Needed before on-disk references to freshly
    /// allocated clusters are created.
    pub(super) async fn flush_refblocks_for(
        &self,
        m: &mut Qcow2Metadata,
        host_offset: u64,
        clusters: usize,
    ) -> BlockResult<()> {
        let first_rt = ((host_offset >> CLUSTER_BITS) >> RB_BITS) as usize;
        let last_cluster = (host_offset >> CLUSTER_BITS) + clusters as u64 - 1;
        let last_rt = (last_cluster >> RB_BITS) as usize;

        let file = &self.file;
        for rt_index in first_rt..=last_rt {
            if !m.reftable.in_bounds(rt_index) {
                continue;
            }
            let rt_entry = m.reftable.get(rt_index);
            if rt_entry.is_empty() {
                continue;
            }
            m.refblock_cache
                .flush_entry(rt_entry.refblock_offset(), |entry| async move {
                    entry.value().read().await.write(file).await
                })
                .await?;
        }
        Ok(())
    }
}
