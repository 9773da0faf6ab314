#![forbid(unsafe_code)]
//! Inode and block allocation for rsfs.
//!
//! The `Allocator` owns the superblock, both bitmaps, the inode table, and
//! the per-data-block reference-count table. Bitmaps are held in memory with
//! dirty flags and written back on `sync`. Free-bit scans are first-fit
//! (lowest index), which gives deterministic IDs.

use parking_lot::Mutex;
use rsfs_block::BlockIo;
use rsfs_error::{FsError, Result};
use rsfs_types::{
    bitmap_clear, bitmap_count_used, bitmap_find_first_free, bitmap_get, bitmap_set, BlockNo,
    Inode, InodeId, Superblock, BLOCK_SIZE, INODES_PER_BLOCK, INODE_SIZE,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Hard cap on a data block's reference count.
pub const MAX_BLOCK_REFS: u8 = 255;

/// Allocator operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocStats {
    pub inode_allocs: u64,
    pub inode_frees: u64,
    pub block_allocs: u64,
    pub block_frees: u64,
    pub bitmap_reads: u64,
    pub bitmap_writes: u64,
}

struct AllocState {
    loaded: bool,
    superblock: Superblock,
    inode_bitmap: Vec<u8>,
    block_bitmap: Vec<u8>,
    /// Live references per data block, indexed relative to
    /// `data_block_start`, clamped to 0..=255.
    block_refcount: Vec<u8>,
    inode_bitmap_dirty: bool,
    block_bitmap_dirty: bool,
    superblock_dirty: bool,
    stats: AllocStats,
}

impl AllocState {
    fn unloaded() -> Self {
        Self {
            loaded: false,
            superblock: Superblock::new(rsfs_types::MIN_TOTAL_BLOCKS, rsfs_types::MIN_TOTAL_INODES),
            inode_bitmap: Vec::new(),
            block_bitmap: Vec::new(),
            block_refcount: Vec::new(),
            inode_bitmap_dirty: false,
            block_bitmap_dirty: false,
            superblock_dirty: false,
            stats: AllocStats::default(),
        }
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.loaded {
            Ok(())
        } else {
            Err(FsError::InvalidParam("allocator not loaded".into()))
        }
    }

    fn data_to_absolute(&self, data_idx: u32) -> BlockNo {
        BlockNo(self.superblock.data_block_start.0 + data_idx)
    }

    fn absolute_to_data(&self, block: BlockNo) -> u32 {
        block.0 - self.superblock.data_block_start.0
    }

    fn is_valid_data_block(&self, block: BlockNo) -> bool {
        block.0 >= self.superblock.data_block_start.0
            && block.0 < self.superblock.data_block_start.0 + self.superblock.data_block_count
    }

    fn bump_inode_counters(&mut self, delta: i32) {
        if delta > 0 {
            self.superblock.used_inodes += delta as u32;
            self.superblock.free_inodes -= delta as u32;
        } else {
            self.superblock.used_inodes -= (-delta) as u32;
            self.superblock.free_inodes += (-delta) as u32;
        }
        self.superblock_dirty = true;
    }

    fn bump_block_counters(&mut self, delta: i32) {
        if delta > 0 {
            self.superblock.used_blocks += delta as u32;
            self.superblock.free_blocks -= delta as u32;
        } else {
            self.superblock.used_blocks -= (-delta) as u32;
            self.superblock.free_blocks += (-delta) as u32;
        }
        self.superblock_dirty = true;
    }
}

/// Bitmap-backed inode/block allocator with a refcount table for snapshot
/// sharing. Every public operation serializes under one mutex.
pub struct Allocator {
    io: Arc<dyn BlockIo>,
    state: Mutex<AllocState>,
}

impl Allocator {
    #[must_use]
    pub fn new(io: Arc<dyn BlockIo>) -> Self {
        Self {
            io,
            state: Mutex::new(AllocState::unloaded()),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Read the superblock and both bitmaps into memory; initialize the
    /// refcount table to 1 for every data block (the snapshot layer rebuilds
    /// exact counts after mount).
    pub fn load(&self) -> Result<()> {
        let mut state = self.state.lock();

        let mut block0 = [0u8; BLOCK_SIZE];
        self.io.read_block(BlockNo(0), &mut block0)?;
        let sb = Superblock::decode(&block0)
            .map_err(|e| FsError::InvalidParam(format!("bad superblock: {e}")))?;
        if !sb.validate() {
            return Err(FsError::InvalidParam("superblock failed validation".into()));
        }

        let mut inode_bitmap = vec![0u8; sb.inode_bitmap_blocks as usize * BLOCK_SIZE];
        for i in 0..sb.inode_bitmap_blocks {
            let chunk = &mut inode_bitmap[i as usize * BLOCK_SIZE..(i as usize + 1) * BLOCK_SIZE];
            self.io.read_block(BlockNo(sb.inode_bitmap_start.0 + i), chunk)?;
        }

        let mut block_bitmap = vec![0u8; sb.block_bitmap_blocks as usize * BLOCK_SIZE];
        for i in 0..sb.block_bitmap_blocks {
            let chunk = &mut block_bitmap[i as usize * BLOCK_SIZE..(i as usize + 1) * BLOCK_SIZE];
            self.io.read_block(BlockNo(sb.block_bitmap_start.0 + i), chunk)?;
        }

        state.stats.bitmap_reads += u64::from(sb.inode_bitmap_blocks + sb.block_bitmap_blocks);
        state.block_refcount = vec![1u8; sb.data_block_count as usize];
        state.inode_bitmap = inode_bitmap;
        state.block_bitmap = block_bitmap;
        state.superblock = sb;
        state.inode_bitmap_dirty = false;
        state.block_bitmap_dirty = false;
        state.superblock_dirty = false;
        state.loaded = true;

        debug!(
            target: "rsfs::alloc",
            event = "loaded",
            used_inodes = state.superblock.used_inodes,
            used_blocks = state.superblock.used_blocks
        );
        Ok(())
    }

    /// Drop in-memory state and run `load()` again.
    pub fn reload(&self) -> Result<()> {
        {
            let mut state = self.state.lock();
            *state = AllocState::unloaded();
        }
        self.load()
    }

    /// Write dirty bitmaps and superblock back, then flush the endpoint.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;

        if state.inode_bitmap_dirty {
            let sb = state.superblock.clone();
            for i in 0..sb.inode_bitmap_blocks {
                let chunk =
                    &state.inode_bitmap[i as usize * BLOCK_SIZE..(i as usize + 1) * BLOCK_SIZE];
                self.io.write_block(BlockNo(sb.inode_bitmap_start.0 + i), chunk)?;
            }
            state.stats.bitmap_writes += u64::from(sb.inode_bitmap_blocks);
            state.inode_bitmap_dirty = false;
        }

        if state.block_bitmap_dirty {
            let sb = state.superblock.clone();
            for i in 0..sb.block_bitmap_blocks {
                let chunk =
                    &state.block_bitmap[i as usize * BLOCK_SIZE..(i as usize + 1) * BLOCK_SIZE];
                self.io.write_block(BlockNo(sb.block_bitmap_start.0 + i), chunk)?;
            }
            state.stats.bitmap_writes += u64::from(sb.block_bitmap_blocks);
            state.block_bitmap_dirty = false;
        }

        if state.superblock_dirty {
            self.io.write_block(BlockNo(0), &state.superblock.encode())?;
            state.superblock_dirty = false;
        }

        drop(state);
        self.io.flush()
    }

    // ── Inodes ──────────────────────────────────────────────────────────

    /// Allocate the lowest-numbered free inode and zero-initialize its
    /// on-disk record (a subsequent `write_inode` sets the real type).
    pub fn alloc_inode(&self) -> Result<InodeId> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;

        if state.superblock.free_inodes == 0 {
            return Err(FsError::NoInode);
        }
        let Some(idx) = bitmap_find_first_free(&state.inode_bitmap, state.superblock.total_inodes)
        else {
            return Err(FsError::NoInode);
        };

        let id = InodeId(idx);
        bitmap_set(&mut state.inode_bitmap, idx);
        state.inode_bitmap_dirty = true;

        if let Err(err) = self.write_inode_locked(&state, id, &Inode::new(rsfs_types::FileType::Free))
        {
            bitmap_clear(&mut state.inode_bitmap, idx);
            return Err(err);
        }

        state.bump_inode_counters(1);
        state.stats.inode_allocs += 1;
        trace!(target: "rsfs::alloc", event = "inode_alloc", inode = id.0);
        Ok(id)
    }

    /// Free an inode, zeroing its on-disk record. The root inode is refused.
    pub fn free_inode(&self, id: InodeId) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;

        if id.0 >= state.superblock.total_inodes {
            return Err(FsError::InvalidParam(format!("inode {id} out of range")));
        }
        if id == InodeId::ROOT {
            return Err(FsError::PermissionDenied);
        }
        if !bitmap_get(&state.inode_bitmap, id.0) {
            return Err(FsError::InvalidParam(format!("inode {id} not allocated")));
        }

        self.write_inode_locked(&state, id, &Inode::cleared())?;
        bitmap_clear(&mut state.inode_bitmap, id.0);
        state.inode_bitmap_dirty = true;
        state.bump_inode_counters(-1);
        state.stats.inode_frees += 1;
        trace!(target: "rsfs::alloc", event = "inode_free", inode = id.0);
        Ok(())
    }

    #[must_use]
    pub fn is_inode_allocated(&self, id: InodeId) -> bool {
        let state = self.state.lock();
        state.loaded
            && id.0 < state.superblock.total_inodes
            && bitmap_get(&state.inode_bitmap, id.0)
    }

    /// Read an inode from the table.
    pub fn read_inode(&self, id: InodeId) -> Result<Inode> {
        let state = self.state.lock();
        state.ensure_loaded()?;
        if id.0 >= state.superblock.total_inodes {
            return Err(FsError::InvalidParam(format!("inode {id} out of range")));
        }

        let (block, offset) = Self::inode_location(&state.superblock, id);
        let mut buf = [0u8; BLOCK_SIZE];
        self.io.read_block(block, &mut buf)?;
        Inode::decode(&buf[offset..offset + INODE_SIZE])
            .map_err(|e| FsError::Internal(format!("inode {id} decode failed: {e}")))
    }

    /// Write an inode into the table (read-modify-write of its block).
    pub fn write_inode(&self, id: InodeId, inode: &Inode) -> Result<()> {
        let state = self.state.lock();
        state.ensure_loaded()?;
        if id.0 >= state.superblock.total_inodes {
            return Err(FsError::InvalidParam(format!("inode {id} out of range")));
        }
        self.write_inode_locked(&state, id, inode)
    }

    fn write_inode_locked(&self, state: &AllocState, id: InodeId, inode: &Inode) -> Result<()> {
        let (block, offset) = Self::inode_location(&state.superblock, id);
        let mut buf = [0u8; BLOCK_SIZE];
        self.io.read_block(block, &mut buf)?;
        inode.encode_into(&mut buf[offset..offset + INODE_SIZE]);
        self.io.write_block(block, &buf)
    }

    fn inode_location(sb: &Superblock, id: InodeId) -> (BlockNo, usize) {
        let block = BlockNo(sb.inode_table_start.0 + id.0 / INODES_PER_BLOCK as u32);
        let offset = (id.0 as usize % INODES_PER_BLOCK) * INODE_SIZE;
        (block, offset)
    }

    // ── Data blocks ─────────────────────────────────────────────────────

    /// Allocate the lowest-numbered free data block, set its refcount to 1,
    /// and zero-fill it. Returns the absolute block number.
    pub fn alloc_block(&self) -> Result<BlockNo> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;

        if state.superblock.free_blocks == 0 {
            return Err(FsError::NoSpace);
        }
        let Some(idx) =
            bitmap_find_first_free(&state.block_bitmap, state.superblock.data_block_count)
        else {
            return Err(FsError::NoSpace);
        };

        let block = state.data_to_absolute(idx);
        bitmap_set(&mut state.block_bitmap, idx);
        state.block_bitmap_dirty = true;
        state.block_refcount[idx as usize] = 1;

        if let Err(err) = self.io.write_block(block, &[0u8; BLOCK_SIZE]) {
            bitmap_clear(&mut state.block_bitmap, idx);
            state.block_refcount[idx as usize] = 0;
            return Err(err);
        }

        state.bump_block_counters(1);
        state.stats.block_allocs += 1;
        trace!(target: "rsfs::alloc", event = "block_alloc", block = block.0);
        Ok(block)
    }

    /// Allocate `count` blocks; on partial failure every block allocated so
    /// far in the batch is freed again.
    pub fn alloc_blocks(&self, count: u32) -> Result<Vec<BlockNo>> {
        let mut blocks = Vec::with_capacity(count as usize);
        for _ in 0..count {
            match self.alloc_block() {
                Ok(block) => blocks.push(block),
                Err(err) => {
                    warn!(
                        target: "rsfs::alloc",
                        event = "batch_rollback",
                        requested = count,
                        allocated = blocks.len()
                    );
                    for block in blocks {
                        let _ = self.free_block(block);
                    }
                    return Err(err);
                }
            }
        }
        Ok(blocks)
    }

    /// Release one reference to `block`. With refcount > 1 the block stays
    /// live; at 1 the block is freed and its bitmap bit cleared.
    pub fn free_block(&self, block: BlockNo) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;

        if !state.is_valid_data_block(block) {
            return Err(FsError::InvalidParam(format!("block {block} outside data region")));
        }
        let idx = state.absolute_to_data(block);
        if !bitmap_get(&state.block_bitmap, idx) {
            return Err(FsError::InvalidParam(format!("block {block} not allocated")));
        }

        if state.block_refcount[idx as usize] > 1 {
            state.block_refcount[idx as usize] -= 1;
            return Ok(());
        }

        state.block_refcount[idx as usize] = 0;
        bitmap_clear(&mut state.block_bitmap, idx);
        state.block_bitmap_dirty = true;
        state.bump_block_counters(-1);
        state.stats.block_frees += 1;
        trace!(target: "rsfs::alloc", event = "block_free", block = block.0);
        Ok(())
    }

    pub fn free_blocks(&self, blocks: &[BlockNo]) -> Result<()> {
        for &block in blocks {
            self.free_block(block)?;
        }
        Ok(())
    }

    #[must_use]
    pub fn is_block_allocated(&self, block: BlockNo) -> bool {
        let state = self.state.lock();
        if !state.loaded || !state.is_valid_data_block(block) {
            return false;
        }
        let idx = state.absolute_to_data(block);
        bitmap_get(&state.block_bitmap, idx)
    }

    // ── Reference counts ────────────────────────────────────────────────

    /// Increment a block's refcount; errors at the 255 cap.
    pub fn inc_block_ref(&self, block: BlockNo) -> Result<u32> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;
        if !state.is_valid_data_block(block) {
            return Err(FsError::InvalidParam(format!("block {block} outside data region")));
        }
        let idx = state.absolute_to_data(block) as usize;
        if state.block_refcount[idx] >= MAX_BLOCK_REFS {
            return Err(FsError::Internal(format!("refcount overflow on block {block}")));
        }
        state.block_refcount[idx] += 1;
        Ok(u32::from(state.block_refcount[idx]))
    }

    /// Decrement a block's refcount; errors at 0. Reaching 0 frees the block
    /// as `free_block` would.
    pub fn dec_block_ref(&self, block: BlockNo) -> Result<u32> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;
        if !state.is_valid_data_block(block) {
            return Err(FsError::InvalidParam(format!("block {block} outside data region")));
        }
        let idx = state.absolute_to_data(block) as usize;
        if state.block_refcount[idx] == 0 {
            return Err(FsError::Internal(format!("refcount underflow on block {block}")));
        }
        state.block_refcount[idx] -= 1;

        if state.block_refcount[idx] == 0 {
            let rel = idx as u32;
            bitmap_clear(&mut state.block_bitmap, rel);
            state.block_bitmap_dirty = true;
            state.bump_block_counters(-1);
            state.stats.block_frees += 1;
            trace!(target: "rsfs::alloc", event = "block_free", block = block.0);
        }
        Ok(u32::from(state.block_refcount[idx]))
    }

    /// Current refcount; 0 for anything outside the data region.
    #[must_use]
    pub fn block_ref(&self, block: BlockNo) -> u32 {
        let state = self.state.lock();
        if !state.loaded || !state.is_valid_data_block(block) {
            return 0;
        }
        let idx = state.absolute_to_data(block) as usize;
        u32::from(state.block_refcount[idx])
    }

    /// Zero the whole refcount table (refcount rebuild, phase one).
    pub fn reset_block_refs(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;
        state.block_refcount.fill(0);
        Ok(())
    }

    /// Count one reference during a refcount rebuild; saturates at the cap
    /// instead of erroring.
    pub fn bump_block_ref(&self, block: BlockNo) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;
        if !state.is_valid_data_block(block) {
            return Err(FsError::InvalidParam(format!("block {block} outside data region")));
        }
        let idx = state.absolute_to_data(block) as usize;
        if state.block_refcount[idx] < MAX_BLOCK_REFS {
            state.block_refcount[idx] += 1;
        }
        Ok(())
    }

    // ── Superblock access ───────────────────────────────────────────────

    /// Snapshot of the in-memory superblock.
    #[must_use]
    pub fn superblock(&self) -> Superblock {
        self.state.lock().superblock.clone()
    }

    pub fn set_snapshot_list_block(&self, block: BlockNo) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;
        state.superblock.snapshot_list_block = block;
        state.superblock_dirty = true;
        Ok(())
    }

    pub fn set_snapshot_count(&self, count: u32) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;
        state.superblock.snapshot_count = count;
        state.superblock_dirty = true;
        Ok(())
    }

    pub fn touch_mount_time(&self, now: i64) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;
        state.superblock.mount_time = now;
        state.superblock_dirty = true;
        Ok(())
    }

    pub fn touch_write_time(&self, now: i64) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;
        state.superblock.write_time = now;
        state.superblock_dirty = true;
        Ok(())
    }

    // ── Counters ────────────────────────────────────────────────────────

    #[must_use]
    pub fn free_inode_count(&self) -> u32 {
        let state = self.state.lock();
        if state.loaded { state.superblock.free_inodes } else { 0 }
    }

    #[must_use]
    pub fn used_inode_count(&self) -> u32 {
        let state = self.state.lock();
        if state.loaded { state.superblock.used_inodes } else { 0 }
    }

    #[must_use]
    pub fn free_block_count(&self) -> u32 {
        let state = self.state.lock();
        if state.loaded { state.superblock.free_blocks } else { 0 }
    }

    #[must_use]
    pub fn used_block_count(&self) -> u32 {
        let state = self.state.lock();
        if state.loaded { state.superblock.used_blocks } else { 0 }
    }

    #[must_use]
    pub fn alloc_stats(&self) -> AllocStats {
        self.state.lock().stats
    }

    pub fn reset_alloc_stats(&self) {
        self.state.lock().stats = AllocStats::default();
    }

    // ── Consistency ─────────────────────────────────────────────────────

    /// Cross-check bitmap cardinalities against the superblock counters and
    /// verify the root inode bit. With `fix`, counters are rewritten to
    /// match the bitmaps (the ground truth). Returns `Internal` when any
    /// discrepancy was found, fixed or not.
    pub fn check_consistency(&self, fix: bool) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;

        let mut has_error = false;

        let actual_used_inodes =
            bitmap_count_used(&state.inode_bitmap, state.superblock.total_inodes);
        if actual_used_inodes != state.superblock.used_inodes {
            warn!(
                target: "rsfs::alloc",
                event = "inode_count_mismatch",
                bitmap = actual_used_inodes,
                superblock = state.superblock.used_inodes
            );
            has_error = true;
            if fix {
                state.superblock.used_inodes = actual_used_inodes;
                state.superblock.free_inodes =
                    state.superblock.total_inodes - actual_used_inodes;
                state.superblock_dirty = true;
            }
        }

        let actual_used_blocks =
            bitmap_count_used(&state.block_bitmap, state.superblock.data_block_count);
        if actual_used_blocks != state.superblock.used_blocks {
            warn!(
                target: "rsfs::alloc",
                event = "block_count_mismatch",
                bitmap = actual_used_blocks,
                superblock = state.superblock.used_blocks
            );
            has_error = true;
            if fix {
                state.superblock.used_blocks = actual_used_blocks;
                state.superblock.free_blocks =
                    state.superblock.data_block_count - actual_used_blocks;
                state.superblock_dirty = true;
            }
        }

        if !bitmap_get(&state.inode_bitmap, InodeId::ROOT.0) {
            warn!(target: "rsfs::alloc", event = "root_inode_unallocated");
            has_error = true;
            if fix {
                bitmap_set(&mut state.inode_bitmap, InodeId::ROOT.0);
                state.inode_bitmap_dirty = true;
            }
        }

        if has_error {
            Err(FsError::Internal("allocator state inconsistent".into()))
        } else {
            Ok(())
        }
    }

    /// Intersect reachable sets (live tree + snapshots) with the bitmaps.
    /// Allocated-but-unreachable entries are orphans; reachable-but-free
    /// entries are corruption. With `fix`, both are corrected in the bitmaps
    /// and counters. Returns `Internal` when any discrepancy was found.
    pub fn reconcile_usage(
        &self,
        used_inodes: &HashSet<InodeId>,
        used_blocks: &HashSet<BlockNo>,
        fix: bool,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.ensure_loaded()?;

        let mut orphan_inodes = 0u32;
        let mut orphan_blocks = 0u32;
        let mut missing_bits = 0u32;

        for idx in 0..state.superblock.total_inodes {
            let id = InodeId(idx);
            let allocated = bitmap_get(&state.inode_bitmap, idx);
            let reachable = used_inodes.contains(&id);
            if allocated && !reachable {
                orphan_inodes += 1;
                if fix {
                    bitmap_clear(&mut state.inode_bitmap, idx);
                    state.inode_bitmap_dirty = true;
                    state.bump_inode_counters(-1);
                }
            } else if !allocated && reachable {
                missing_bits += 1;
                if fix {
                    bitmap_set(&mut state.inode_bitmap, idx);
                    state.inode_bitmap_dirty = true;
                    state.bump_inode_counters(1);
                }
            }
        }

        for idx in 0..state.superblock.data_block_count {
            let block = state.data_to_absolute(idx);
            let allocated = bitmap_get(&state.block_bitmap, idx);
            let reachable = used_blocks.contains(&block);
            if allocated && !reachable {
                orphan_blocks += 1;
                if fix {
                    bitmap_clear(&mut state.block_bitmap, idx);
                    state.block_bitmap_dirty = true;
                    state.block_refcount[idx as usize] = 0;
                    state.bump_block_counters(-1);
                }
            } else if !allocated && reachable {
                missing_bits += 1;
                if fix {
                    bitmap_set(&mut state.block_bitmap, idx);
                    state.block_bitmap_dirty = true;
                    if state.block_refcount[idx as usize] == 0 {
                        state.block_refcount[idx as usize] = 1;
                    }
                    state.bump_block_counters(1);
                }
            }
        }

        if orphan_inodes + orphan_blocks + missing_bits > 0 {
            warn!(
                target: "rsfs::alloc",
                event = "usage_reconciled",
                orphan_inodes,
                orphan_blocks,
                missing_bits,
                fixed = fix
            );
            Err(FsError::Internal(format!(
                "usage mismatch: {orphan_inodes} orphan inodes, \
                 {orphan_blocks} orphan blocks, {missing_bits} missing bits"
            )))
        } else {
            Ok(())
        }
    }
}

impl Drop for Allocator {
    fn drop(&mut self) {
        let loaded = self.state.lock().loaded;
        if loaded {
            // Best-effort persistence on teardown.
            let _ = self.sync();
        }
    }
}
