//! LRU block cache and the cached disk endpoint.
//!
//! `BlockCache` maps block numbers to 1024-byte pages with a dirty flag.
//! Eviction never writes back: a dirty page evicted under capacity pressure
//! is dropped, and callers needing durability must `flush` first.
//! `CachedDisk` composes the cache over a `DiskImage` with write-back
//! (default) or write-through modes.

use crate::{BlockIo, DiskImage};
use parking_lot::Mutex;
use rsfs_error::{FsError, Result};
use rsfs_types::{BlockNo, CacheStats, BLOCK_SIZE};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::trace;

struct CacheEntry {
    data: Vec<u8>,
    dirty: bool,
    seq: u64,
}

struct CacheState {
    capacity: usize,
    next_seq: u64,
    entries: HashMap<BlockNo, CacheEntry>,
    // (seq, block) ordered oldest-first; one member per resident block.
    by_recency: BTreeSet<(u64, BlockNo)>,
}

impl CacheState {
    fn touch(&mut self, block: BlockNo) {
        if let Some(entry) = self.entries.get_mut(&block) {
            self.by_recency.remove(&(entry.seq, block));
            entry.seq = self.next_seq;
            self.by_recency.insert((entry.seq, block));
            self.next_seq += 1;
        }
    }

    /// Drop the least-recently-used entry, dirty or not.
    fn evict_lru(&mut self) -> Option<BlockNo> {
        let &(seq, block) = self.by_recency.iter().next()?;
        self.by_recency.remove(&(seq, block));
        self.entries.remove(&block);
        Some(block)
    }
}

#[derive(Default)]
struct CacheCounters {
    hits: u64,
    misses: u64,
    evictions: u64,
}

/// Fixed-capacity LRU map from block number to cached page.
pub struct BlockCache {
    state: Mutex<CacheState>,
    counters: Mutex<CacheCounters>,
}

impl BlockCache {
    /// Capacity is clamped to at least one block.
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            state: Mutex::new(CacheState {
                capacity: capacity.max(1) as usize,
                next_seq: 0,
                entries: HashMap::new(),
                by_recency: BTreeSet::new(),
            }),
            counters: Mutex::new(CacheCounters::default()),
        }
    }

    /// Copy the cached page for `block` into `out`; a hit refreshes recency.
    pub fn get(&self, block: BlockNo, out: &mut [u8]) -> bool {
        let mut state = self.state.lock();
        if state.entries.contains_key(&block) {
            state.touch(block);
            let entry = &state.entries[&block];
            out[..BLOCK_SIZE].copy_from_slice(&entry.data);
            drop(state);
            self.counters.lock().hits += 1;
            true
        } else {
            drop(state);
            self.counters.lock().misses += 1;
            false
        }
    }

    /// Insert or update `block`. Updating an existing entry ORs the dirty
    /// bit; inserting past capacity evicts the LRU entry first.
    pub fn put(&self, block: BlockNo, data: &[u8], dirty: bool) {
        debug_assert_eq!(data.len(), BLOCK_SIZE);
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.get_mut(&block) {
            entry.data.copy_from_slice(data);
            entry.dirty = entry.dirty || dirty;
            state.touch(block);
            return;
        }

        let mut evicted = 0u64;
        while state.entries.len() >= state.capacity {
            if let Some(victim) = state.evict_lru() {
                trace!(target: "rsfs::block::cache", event = "evict", block = victim.0);
                evicted += 1;
            } else {
                break;
            }
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.entries.insert(
            block,
            CacheEntry {
                data: data.to_vec(),
                dirty,
                seq,
            },
        );
        state.by_recency.insert((seq, block));
        drop(state);
        if evicted > 0 {
            self.counters.lock().evictions += evicted;
        }
    }

    #[must_use]
    pub fn contains(&self, block: BlockNo) -> bool {
        self.state.lock().entries.contains_key(&block)
    }

    /// Set the dirty flag on a resident block. Returns false on absence.
    pub fn mark_dirty(&self, block: BlockNo) -> bool {
        let mut state = self.state.lock();
        match state.entries.get_mut(&block) {
            Some(entry) => {
                entry.dirty = true;
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn is_dirty(&self, block: BlockNo) -> bool {
        self.state
            .lock()
            .entries
            .get(&block)
            .is_some_and(|e| e.dirty)
    }

    /// Remove a block without writeback.
    pub fn invalidate(&self, block: BlockNo) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.remove(&block) {
            state.by_recency.remove(&(entry.seq, block));
        }
    }

    /// Drop every entry without writeback.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.by_recency.clear();
    }

    /// Snapshot of all dirty (block, page) pairs, for flushing.
    #[must_use]
    pub fn dirty_blocks(&self) -> Vec<(BlockNo, Vec<u8>)> {
        let state = self.state.lock();
        state
            .by_recency
            .iter()
            .filter_map(|&(_, block)| {
                let entry = &state.entries[&block];
                entry.dirty.then(|| (block, entry.data.clone()))
            })
            .collect()
    }

    /// Clear the dirty flag after successful writeback.
    pub fn clear_dirty(&self, block: BlockNo) {
        if let Some(entry) = self.state.lock().entries.get_mut(&block) {
            entry.dirty = false;
        }
    }

    pub fn clear_all_dirty(&self) {
        for entry in self.state.lock().entries.values_mut() {
            entry.dirty = false;
        }
    }

    /// Shrink or grow capacity, evicting down with the normal LRU policy.
    pub fn set_capacity(&self, capacity: u32) {
        let mut state = self.state.lock();
        state.capacity = capacity.max(1) as usize;
        let mut evicted = 0u64;
        while state.entries.len() > state.capacity {
            if state.evict_lru().is_some() {
                evicted += 1;
            } else {
                break;
            }
        }
        drop(state);
        if evicted > 0 {
            self.counters.lock().evictions += evicted;
        }
    }

    #[must_use]
    pub fn current_size(&self) -> u32 {
        self.state.lock().entries.len() as u32
    }

    /// Resident blocks ordered MRU → LRU.
    #[must_use]
    pub fn lru_order(&self) -> Vec<BlockNo> {
        self.state
            .lock()
            .by_recency
            .iter()
            .rev()
            .map(|&(_, block)| block)
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        let capacity = state.capacity as u32;
        let current_size = state.entries.len() as u32;
        drop(state);

        let counters = self.counters.lock();
        let total = counters.hits + counters.misses;
        CacheStats {
            hits: counters.hits,
            misses: counters.misses,
            evictions: counters.evictions,
            capacity,
            current_size,
            hit_rate: if total > 0 {
                counters.hits as f64 / total as f64
            } else {
                0.0
            },
        }
    }

    pub fn reset_stats(&self) {
        *self.counters.lock() = CacheCounters::default();
    }
}

// ── CachedDisk ──────────────────────────────────────────────────────────────

/// `BlockCache` composed over a `DiskImage`.
///
/// One mutex serializes read/write/flush so a miss-then-install is atomic
/// with respect to other accesses to the same block.
pub struct CachedDisk {
    disk: Arc<DiskImage>,
    cache: BlockCache,
    io_mutex: Mutex<()>,
    cache_enabled: AtomicBool,
    write_through: AtomicBool,
}

impl CachedDisk {
    #[must_use]
    pub fn new(disk: Arc<DiskImage>, cache_capacity: u32) -> Self {
        Self {
            disk,
            cache: BlockCache::new(cache_capacity),
            io_mutex: Mutex::new(()),
            cache_enabled: AtomicBool::new(true),
            write_through: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn disk(&self) -> &Arc<DiskImage> {
        &self.disk
    }

    pub fn set_write_through(&self, enabled: bool) {
        self.write_through.store(enabled, Ordering::Release);
    }

    #[must_use]
    pub fn write_through(&self) -> bool {
        self.write_through.load(Ordering::Acquire)
    }

    /// Bypass mode: when disabled, reads and writes go straight to disk.
    pub fn set_cache_enabled(&self, enabled: bool) {
        self.cache_enabled.store(enabled, Ordering::Release);
    }

    /// Serve from cache on hit; on miss read from disk and install clean.
    pub fn read_block(&self, block: BlockNo, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(FsError::InvalidParam("read buffer size mismatch".into()));
        }
        let _guard = self.io_mutex.lock();
        let enabled = self.cache_enabled.load(Ordering::Acquire);
        if enabled && self.cache.get(block, buf) {
            return Ok(());
        }
        self.disk.read_block(block, buf)?;
        if enabled {
            self.cache.put(block, buf, false);
        }
        Ok(())
    }

    /// Install in cache; write through to disk when the configured mode or
    /// the per-call override demands it.
    pub fn write_block_opts(&self, block: BlockNo, data: &[u8], write_through: bool) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(FsError::InvalidParam("write buffer size mismatch".into()));
        }
        let _guard = self.io_mutex.lock();
        let enabled = self.cache_enabled.load(Ordering::Acquire);
        let through = write_through || self.write_through.load(Ordering::Acquire);

        if enabled {
            self.cache.put(block, data, !through);
        }
        if through || !enabled {
            self.disk.write_block(block, data)?;
            if enabled {
                self.cache.clear_dirty(block);
            }
        }
        Ok(())
    }

    pub fn write_block(&self, block: BlockNo, data: &[u8]) -> Result<()> {
        self.write_block_opts(block, data, false)
    }

    pub fn read_blocks(&self, start: BlockNo, count: u32, buf: &mut [u8]) -> Result<()> {
        if buf.len() != count as usize * BLOCK_SIZE {
            return Err(FsError::InvalidParam("range buffer size mismatch".into()));
        }
        for i in 0..count {
            let chunk = &mut buf[i as usize * BLOCK_SIZE..(i as usize + 1) * BLOCK_SIZE];
            self.read_block(BlockNo(start.0 + i), chunk)?;
        }
        Ok(())
    }

    pub fn write_blocks(&self, start: BlockNo, count: u32, buf: &[u8]) -> Result<()> {
        if buf.len() != count as usize * BLOCK_SIZE {
            return Err(FsError::InvalidParam("range buffer size mismatch".into()));
        }
        for i in 0..count {
            let chunk = &buf[i as usize * BLOCK_SIZE..(i as usize + 1) * BLOCK_SIZE];
            self.write_block(BlockNo(start.0 + i), chunk)?;
        }
        Ok(())
    }

    /// Write every dirty page to disk, clear the flags, then fsync.
    ///
    /// After a successful flush the cache holds no dirty entries and disk
    /// content equals cache content for every resident block.
    pub fn flush(&self) -> Result<()> {
        let _guard = self.io_mutex.lock();
        let dirty = self.cache.dirty_blocks();
        let count = dirty.len();
        for (block, data) in dirty {
            self.disk.write_block(block, &data)?;
            self.cache.clear_dirty(block);
        }
        if count > 0 {
            trace!(target: "rsfs::block::cache", event = "flush", blocks = count);
        }
        self.disk.sync()
    }

    /// Remove a single block without writeback.
    pub fn invalidate(&self, block: BlockNo) {
        let _guard = self.io_mutex.lock();
        self.cache.invalidate(block);
    }

    /// Flush, then drop every cached page.
    pub fn clear_cache(&self) -> Result<()> {
        self.flush()?;
        let _guard = self.io_mutex.lock();
        self.cache.clear();
        Ok(())
    }

    /// Flush, then resize. Shrinking evicts clean pages down to the new
    /// capacity.
    pub fn set_cache_capacity(&self, capacity: u32) -> Result<()> {
        self.flush()?;
        self.cache.set_capacity(capacity);
        Ok(())
    }

    #[must_use]
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn reset_cache_stats(&self) {
        self.cache.reset_stats();
    }

    #[must_use]
    pub fn cache(&self) -> &BlockCache {
        &self.cache
    }
}

impl BlockIo for CachedDisk {
    fn read_block(&self, block: BlockNo, buf: &mut [u8]) -> Result<()> {
        Self::read_block(self, block, buf)
    }

    fn write_block(&self, block: BlockNo, data: &[u8]) -> Result<()> {
        Self::write_block(self, block, data)
    }

    fn block_count(&self) -> u32 {
        self.disk.total_blocks()
    }

    fn flush(&self) -> Result<()> {
        Self::flush(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn page(byte: u8) -> Vec<u8> {
        vec![byte; BLOCK_SIZE]
    }

    #[test]
    fn get_miss_then_hit() {
        let cache = BlockCache::new(4);
        let mut out = page(0);
        assert!(!cache.get(BlockNo(1), &mut out));
        cache.put(BlockNo(1), &page(0xAB), false);
        assert!(cache.get(BlockNo(1), &mut out));
        assert!(out.iter().all(|&b| b == 0xAB));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn lru_eviction_order() {
        let cache = BlockCache::new(3);
        cache.put(BlockNo(1), &page(1), false);
        cache.put(BlockNo(2), &page(2), false);
        cache.put(BlockNo(3), &page(3), false);

        // Touch 1 so that 2 becomes LRU.
        let mut out = page(0);
        assert!(cache.get(BlockNo(1), &mut out));

        cache.put(BlockNo(4), &page(4), false);
        assert!(!cache.contains(BlockNo(2)));
        assert!(cache.contains(BlockNo(1)));
        assert!(cache.contains(BlockNo(3)));
        assert!(cache.contains(BlockNo(4)));
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn mru_first_in_lru_order() {
        let cache = BlockCache::new(4);
        cache.put(BlockNo(1), &page(1), false);
        cache.put(BlockNo(2), &page(2), false);
        cache.put(BlockNo(3), &page(3), false);
        let mut out = page(0);
        assert!(cache.get(BlockNo(1), &mut out));

        assert_eq!(
            cache.lru_order(),
            vec![BlockNo(1), BlockNo(3), BlockNo(2)]
        );
    }

    #[test]
    fn dirty_bit_ors_on_reput() {
        let cache = BlockCache::new(4);
        cache.put(BlockNo(1), &page(1), true);
        cache.put(BlockNo(1), &page(2), false);
        assert!(cache.is_dirty(BlockNo(1)));

        cache.clear_dirty(BlockNo(1));
        assert!(!cache.is_dirty(BlockNo(1)));
    }

    #[test]
    fn eviction_silently_drops_dirty_pages() {
        let cache = BlockCache::new(1);
        cache.put(BlockNo(1), &page(1), true);
        cache.put(BlockNo(2), &page(2), false);

        assert!(!cache.contains(BlockNo(1)));
        assert!(cache.dirty_blocks().is_empty());
    }

    #[test]
    fn dirty_snapshot_and_clear_all() {
        let cache = BlockCache::new(8);
        cache.put(BlockNo(1), &page(1), true);
        cache.put(BlockNo(2), &page(2), false);
        cache.put(BlockNo(3), &page(3), true);

        let dirty = cache.dirty_blocks();
        let mut blocks: Vec<u32> = dirty.iter().map(|(b, _)| b.0).collect();
        blocks.sort_unstable();
        assert_eq!(blocks, vec![1, 3]);

        cache.clear_all_dirty();
        assert!(cache.dirty_blocks().is_empty());
    }

    #[test]
    fn set_capacity_evicts_down() {
        let cache = BlockCache::new(4);
        for i in 1..=4 {
            cache.put(BlockNo(i), &page(i as u8), false);
        }
        cache.set_capacity(2);
        assert_eq!(cache.current_size(), 2);
        // The two most recently inserted survive.
        assert!(cache.contains(BlockNo(3)));
        assert!(cache.contains(BlockNo(4)));
    }

    #[test]
    fn invalidate_removes_without_writeback() {
        let cache = BlockCache::new(4);
        cache.put(BlockNo(1), &page(1), true);
        cache.invalidate(BlockNo(1));
        assert!(!cache.contains(BlockNo(1)));
        assert!(cache.dirty_blocks().is_empty());
    }

    // ── CachedDisk over a real image ────────────────────────────────────

    fn make_cached(dir: &TempDir, capacity: u32) -> CachedDisk {
        let disk = DiskImage::create(dir.path().join("c.img"), 64).expect("create");
        CachedDisk::new(Arc::new(disk), capacity)
    }

    #[test]
    fn write_back_hides_data_until_flush() {
        let dir = TempDir::new().expect("tempdir");
        let cached = make_cached(&dir, 16);

        let data = page(0x5A);
        cached.write_block(BlockNo(7), &data).expect("write");

        // Raw disk still sees zeros.
        let mut raw = page(0);
        cached.disk().read_block(BlockNo(7), &mut raw).expect("raw read");
        assert!(raw.iter().all(|&b| b == 0));

        cached.flush().expect("flush");
        cached.disk().read_block(BlockNo(7), &mut raw).expect("raw read");
        assert_eq!(raw, data);
        assert!(cached.cache().dirty_blocks().is_empty());
    }

    #[test]
    fn write_through_lands_immediately() {
        let dir = TempDir::new().expect("tempdir");
        let cached = make_cached(&dir, 16);
        cached.set_write_through(true);

        let data = page(0x77);
        cached.write_block(BlockNo(9), &data).expect("write");

        let mut raw = page(0);
        cached.disk().read_block(BlockNo(9), &mut raw).expect("raw read");
        assert_eq!(raw, data);
        assert!(!cached.cache().is_dirty(BlockNo(9)));
    }

    #[test]
    fn per_call_override_forces_through() {
        let dir = TempDir::new().expect("tempdir");
        let cached = make_cached(&dir, 16);

        let data = page(0x33);
        cached
            .write_block_opts(BlockNo(4), &data, true)
            .expect("write");

        let mut raw = page(0);
        cached.disk().read_block(BlockNo(4), &mut raw).expect("raw read");
        assert_eq!(raw, data);
    }

    #[test]
    fn read_miss_installs_clean() {
        let dir = TempDir::new().expect("tempdir");
        let cached = make_cached(&dir, 16);

        let data = page(0x11);
        cached.disk().write_block(BlockNo(2), &data).expect("seed");

        let mut out = page(0);
        cached.read_block(BlockNo(2), &mut out).expect("read");
        assert_eq!(out, data);
        assert!(cached.cache().contains(BlockNo(2)));
        assert!(!cached.cache().is_dirty(BlockNo(2)));

        // Second read hits.
        cached.read_block(BlockNo(2), &mut out).expect("read");
        assert_eq!(cached.cache_stats().hits, 1);
    }

    #[test]
    fn disabled_cache_bypasses() {
        let dir = TempDir::new().expect("tempdir");
        let cached = make_cached(&dir, 16);
        cached.set_cache_enabled(false);

        let data = page(0x99);
        cached.write_block(BlockNo(5), &data).expect("write");

        let mut raw = page(0);
        cached.disk().read_block(BlockNo(5), &mut raw).expect("raw read");
        assert_eq!(raw, data);
        assert!(!cached.cache().contains(BlockNo(5)));
    }

    #[test]
    fn clear_cache_flushes_first() {
        let dir = TempDir::new().expect("tempdir");
        let cached = make_cached(&dir, 16);

        let data = page(0x42);
        cached.write_block(BlockNo(6), &data).expect("write");
        cached.clear_cache().expect("clear");

        assert_eq!(cached.cache().current_size(), 0);
        let mut raw = page(0);
        cached.disk().read_block(BlockNo(6), &mut raw).expect("raw read");
        assert_eq!(raw, data);
    }
}
