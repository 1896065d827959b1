//! Fixed-capacity cache for cluster-sized metadata pages.
//!
//! Pages are keyed by their host byte offset and handed out as counted
//! handles; a page is evictable only while no handle to it is held.  Dirty
//! pages are written back through a caller-supplied flush function before
//! they may be evicted.

use crate::BlockResult;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock as AsyncRwLock;

pub struct CacheEntryInner<V> {
    value: AsyncRwLock<V>,
    host_offset: u64,
    last_used: AtomicUsize,
    dirty: AtomicBool,
}

pub type CacheEntry<V> = Arc<CacheEntryInner<V>>;

pub struct MetadataCache<V> {
    map: HashMap<u64, CacheEntry<V>>,
    lru_timer: usize,
    limit: usize,
}

impl<V> MetadataCache<V> {
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0);
        MetadataCache {
            map: HashMap::new(),
            lru_timer: 0,
            limit,
        }
    }

    pub fn capacity(&self) -> usize {
        self.limit
    }

    fn touch(&mut self, entry: &CacheEntry<V>) {
        entry.last_used.store(self.lru_timer, Ordering::Relaxed);
        self.lru_timer = self.lru_timer.wrapping_add(1);
    }

    /// Pick the eviction victim: least-recently-used among entries without
    /// outside handles, preferring clean pages over dirty ones.
    fn victim(&self) -> Option<(u64, bool)> {
        let now = self.lru_timer;
        let mut clean: Option<(usize, u64)> = None;
        let mut dirty: Option<(usize, u64)> = None;

        for (offset, entry) in self.map.iter() {
            // Cannot drop entries that are in use
            if Arc::strong_count(entry) > 1 {
                continue;
            }

            let age = now.wrapping_sub(entry.last_used.load(Ordering::Relaxed));
            let slot = if entry.is_dirty() {
                &mut dirty
            } else {
                &mut clean
            };
            if slot.map(|(a, _)| age >= a).unwrap_or(true) {
                *slot = Some((age, *offset));
            }
        }

        if let Some((_, offset)) = clean {
            Some((offset, false))
        } else {
            dirty.map(|(_, offset)| (offset, true))
        }
    }

    async fn make_room<FlushFut: Future<Output = BlockResult<()>>, F: Fn(CacheEntry<V>) -> FlushFut>(
        &mut self,
        flush: &F,
    ) -> BlockResult<()> {
        while self.map.len() >= self.limit {
            let Some((offset, is_dirty)) = self.victim() else {
                // Everything is held; the cache may exceed its limit until
                // handles are released
                return Ok(());
            };

            let entry = self.map.remove(&offset).unwrap();
            if is_dirty {
                entry.mark_clean();
                if let Err(err) = flush(Arc::clone(&entry)).await {
                    entry.mark_dirty();
                    self.map.insert(offset, entry);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Return the page at `offset`, reading it through `read` on a miss.
    pub async fn get_or_insert<
        ReadFut: Future<Output = BlockResult<V>>,
        FlushFut: Future<Output = BlockResult<()>>,
        F: Fn(CacheEntry<V>) -> FlushFut,
    >(
        &mut self,
        offset: u64,
        read: ReadFut,
        flush: F,
    ) -> BlockResult<CacheEntry<V>> {
        if let Some(entry) = self.map.get(&offset).map(Arc::clone) {
            self.touch(&entry);
            return Ok(entry);
        }

        self.make_room(&flush).await?;

        let entry = Arc::new(CacheEntryInner {
            value: AsyncRwLock::new(read.await?),
            host_offset: offset,
            last_used: AtomicUsize::new(self.lru_timer),
            dirty: AtomicBool::new(false),
        });
        self.lru_timer = self.lru_timer.wrapping_add(1);
        self.map.insert(offset, Arc::clone(&entry));

        Ok(entry)
    }

    /// Insert a freshly constructed page without reading from disk (the
    /// caller has just created or fully overwritten it).
    pub async fn get_empty<
        FlushFut: Future<Output = BlockResult<()>>,
        F: Fn(CacheEntry<V>) -> FlushFut,
    >(
        &mut self,
        offset: u64,
        value: V,
        flush: F,
    ) -> BlockResult<CacheEntry<V>> {
        self.make_room(&flush).await?;

        let entry = Arc::new(CacheEntryInner {
            value: AsyncRwLock::new(value),
            host_offset: offset,
            last_used: AtomicUsize::new(self.lru_timer),
            dirty: AtomicBool::new(false),
        });
        self.lru_timer = self.lru_timer.wrapping_add(1);
        // Replacing an existing entry would lose its dirty state; the caller
        // must only use this for offsets it has never cached or has flushed
        let old = self.map.insert(offset, Arc::clone(&entry));
        assert!(old.map(|e| !e.is_dirty()).unwrap_or(true));

        Ok(entry)
    }

    /// Write back every dirty page.  Pages stay cached.
    pub async fn flush<
        FlushFut: Future<Output = BlockResult<()>>,
        F: Fn(CacheEntry<V>) -> FlushFut,
    >(
        &self,
        flush: F,
    ) -> BlockResult<()> {
        for entry in self.map.values() {
            if entry.is_dirty() {
                entry.mark_clean();
                if let Err(err) = flush(Arc::clone(entry)).await {
                    entry.mark_dirty();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Write back the page at `offset` if it is cached and dirty.
    pub async fn flush_entry<
        FlushFut: Future<Output = BlockResult<()>>,
        F: FnOnce(CacheEntry<V>) -> FlushFut,
    >(
        &self,
        offset: u64,
        flush: F,
    ) -> BlockResult<()> {
        if let Some(entry) = self.map.get(&offset) {
            if entry.is_dirty() {
                entry.mark_clean();
                if let Err(err) = flush(Arc::clone(entry)).await {
                    entry.mark_dirty();
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    /// Drop all dirty state without writing it back.  Only for images that
    /// are already frozen after a writeback failure; the on-disk state wins.
    pub fn discard_dirty(&mut self) {
        for entry in self.map.values() {
            entry.mark_clean();
        }
    }
}

impl<V> CacheEntryInner<V> {
    pub fn value(&self) -> &AsyncRwLock<V> {
        &self.value
    }

    pub fn host_offset(&self) -> u64 {
        self.host_offset
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Relaxed)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Relaxed)
    }

    fn mark_clean(&self) {
        self.dirty.store(false, Ordering::Relaxed)
    }
}

impl<V> Drop for CacheEntryInner<V> {
    fn drop(&mut self) {
        assert!(!self.is_dirty());
    }
}
