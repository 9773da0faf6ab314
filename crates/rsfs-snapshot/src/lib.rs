#![forbid(unsafe_code)]
//! Copy-on-write snapshot manager for rsfs.
//!
//! Snapshots are named, read-only logical copies of the directory tree:
//! directory inodes and their entry blocks are deep-cloned, while file data
//! blocks (and indirect blocks) are shared with the live tree through the
//! allocator's refcount table. Writes to shared blocks are intercepted by
//! the `needs_cow`/`perform_cow` contract installed into the directory
//! engine.

use parking_lot::Mutex;
use rsfs_alloc::Allocator;
use rsfs_block::{BlockIo, CachedDisk};
use rsfs_dir::{
    file_block_at, read_dir_entries, set_file_block, write_dir_entries, BlockCow,
};
use rsfs_error::{FsError, Result};
use rsfs_types::{
    unix_now, BlockNo, Inode, InodeId, SnapshotMeta, BLOCK_SIZE, MAX_SNAPSHOTS,
    MAX_SNAPSHOT_NAME_LEN, SNAPSHOT_META_SIZE,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// One live snapshot as held in memory and listed to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub name: String,
    pub create_time: i64,
    pub root_inode: InodeId,
    pub block_count: u32,
    pub valid: bool,
}

/// Snapshot/COW activity counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub cow_operations: u64,
    pub shared_blocks: u64,
    pub total_snapshots: u32,
}

struct SnapState {
    loaded: bool,
    list_block: BlockNo,
    snapshots: Vec<SnapshotInfo>,
    dirty: bool,
    stats: SnapshotStats,
}

/// Maintains the bounded snapshot list and implements the COW contract.
pub struct SnapshotManager {
    alloc: Arc<Allocator>,
    io: Arc<dyn BlockIo>,
    /// Cleared on restore; pages may reference the pre-restore tree.
    cache: Option<Arc<CachedDisk>>,
    state: Mutex<SnapState>,
}

impl SnapshotManager {
    #[must_use]
    pub fn new(alloc: Arc<Allocator>, io: Arc<dyn BlockIo>, cache: Option<Arc<CachedDisk>>) -> Self {
        Self {
            alloc,
            io,
            cache,
            state: Mutex::new(SnapState {
                loaded: false,
                list_block: BlockNo::INVALID,
                snapshots: Vec::new(),
                dirty: false,
                stats: SnapshotStats::default(),
            }),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Read the snapshot list from the block recorded in the superblock.
    pub fn load(&self) -> Result<()> {
        let mut state = self.state.lock();
        let sb = self.alloc.superblock();
        state.list_block = sb.snapshot_list_block;

        if state.list_block.0 == 0 || !state.list_block.is_valid() {
            state.snapshots.clear();
        } else {
            let mut buf = [0u8; BLOCK_SIZE];
            self.io.read_block(state.list_block, &mut buf)?;
            let count = (u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize)
                .min(MAX_SNAPSHOTS);

            state.snapshots.clear();
            for i in 0..count {
                let off = 8 + i * SNAPSHOT_META_SIZE;
                let meta = SnapshotMeta::decode(&buf[off..off + SNAPSHOT_META_SIZE])
                    .map_err(|e| FsError::Internal(format!("snapshot list decode: {e}")))?;
                if meta.is_valid() {
                    state.snapshots.push(SnapshotInfo {
                        name: meta.name(),
                        create_time: meta.create_time,
                        root_inode: meta.root_inode,
                        block_count: meta.block_count,
                        valid: true,
                    });
                }
            }
        }

        state.stats.total_snapshots = state.snapshots.len() as u32;
        state.loaded = true;
        state.dirty = false;
        debug!(
            target: "rsfs::snapshot",
            event = "loaded",
            snapshots = state.snapshots.len()
        );
        Ok(())
    }

    /// Persist the list if needed, then sync the allocator.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !state.loaded {
            return Ok(());
        }
        if !state.dirty && state.snapshots.is_empty() {
            return Ok(());
        }
        self.save_list(&mut state)?;
        state.dirty = false;
        drop(state);
        self.alloc.sync()
    }

    fn save_list(&self, state: &mut SnapState) -> Result<()> {
        if state.snapshots.is_empty()
            && (state.list_block.0 == 0 || !state.list_block.is_valid())
        {
            return Ok(());
        }

        if state.list_block.0 == 0 || !state.list_block.is_valid() {
            // Lazily allocate the list block on the first snapshot.
            let block = self.alloc.alloc_block()?;
            state.list_block = block;
            self.alloc.set_snapshot_list_block(block)?;
        }

        let mut buf = [0u8; BLOCK_SIZE];
        buf[0..4].copy_from_slice(&(state.snapshots.len() as u32).to_le_bytes());
        for (i, info) in state.snapshots.iter().take(MAX_SNAPSHOTS).enumerate() {
            let meta =
                SnapshotMeta::new(&info.name, info.create_time, info.root_inode, info.block_count);
            let off = 8 + i * SNAPSHOT_META_SIZE;
            meta.encode_into(&mut buf[off..off + SNAPSHOT_META_SIZE]);
        }
        self.io.write_block(state.list_block, &buf)
    }

    fn find_index(state: &SnapState, name: &str) -> Option<usize> {
        state
            .snapshots
            .iter()
            .position(|s| s.valid && s.name == name)
    }

    // ── Snapshot operations ─────────────────────────────────────────────

    /// Deep-clone the live directory tree under a new name.
    ///
    /// Directory inodes and entry blocks are copied; file inodes are copied
    /// with their block trees shared via refcount increments. A mid-clone
    /// failure leaves already-allocated inodes and blocks behind; a
    /// subsequent consistency check with usage reconciliation reclaims them.
    pub fn create_snapshot(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.loaded {
            return Err(FsError::InvalidParam("snapshot manager not loaded".into()));
        }
        if name.is_empty() {
            return Err(FsError::InvalidParam("snapshot name empty".into()));
        }
        if name.len() > MAX_SNAPSHOT_NAME_LEN - 1 {
            return Err(FsError::NameTooLong);
        }
        if Self::find_index(&state, name).is_some() {
            return Err(FsError::SnapshotExists(name.to_string()));
        }
        if state.snapshots.len() >= MAX_SNAPSHOTS {
            return Err(FsError::MaxSnapshots);
        }

        let live_root = self.alloc.superblock().root_inode;
        let mut inode_map = HashMap::new();
        let snapshot_root = match self.clone_tree(live_root, InodeId::INVALID, &mut inode_map, &mut state)
        {
            Ok(root) => root,
            Err(err) => {
                warn!(
                    target: "rsfs::snapshot",
                    event = "clone_abandoned",
                    name,
                    cloned_inodes = inode_map.len(),
                    error = %err
                );
                return Err(err);
            }
        };

        let block_count = self
            .alloc
            .read_inode(snapshot_root)
            .map(|inode| inode.block_count)
            .unwrap_or(0);

        state.snapshots.push(SnapshotInfo {
            name: name.to_string(),
            create_time: unix_now(),
            root_inode: snapshot_root,
            block_count,
            valid: true,
        });
        state.dirty = true;
        state.stats.total_snapshots = state.snapshots.len() as u32;

        self.alloc.set_snapshot_count(state.snapshots.len() as u32)?;
        self.save_list(&mut state)?;
        state.dirty = false;
        drop(state);

        debug!(target: "rsfs::snapshot", event = "created", name, root = snapshot_root.0);
        self.alloc.sync()
    }

    /// Replace the live root inode with the snapshot's, rewriting the root
    /// directory's `.`/`..` entries and dropping every cached page.
    ///
    /// Blocks owned solely by the pre-restore live tree become orphans until
    /// usage reconciliation runs. The caller must reload the allocator and
    /// rebuild refcounts afterwards.
    pub fn restore_snapshot(&self, name: &str) -> Result<()> {
        let state = self.state.lock();
        if !state.loaded {
            return Err(FsError::InvalidParam("snapshot manager not loaded".into()));
        }
        let idx = Self::find_index(&state, name)
            .ok_or_else(|| FsError::SnapshotNotFound(name.to_string()))?;
        let snapshot_root = state.snapshots[idx].root_inode;
        drop(state);

        let mut restored = self.alloc.read_inode(snapshot_root)?;
        restored.ref_count = 1;
        if restored.is_directory() {
            restored.link_count = 2;
        }
        self.alloc.write_inode(InodeId::ROOT, &restored)?;

        if restored.is_directory() {
            let num_blocks = (restored.size as usize).div_ceil(BLOCK_SIZE).max(1) as u32;
            for bi in 0..num_blocks {
                let Ok(block) = file_block_at(self.io.as_ref(), &restored, bi) else {
                    continue;
                };
                let mut entries = read_dir_entries(self.io.as_ref(), block)?;
                let mut updated = false;
                for entry in &mut entries {
                    if !entry.is_valid() {
                        continue;
                    }
                    let entry_name = entry.name();
                    if (entry_name == "." || entry_name == "..") && entry.inode != InodeId::ROOT {
                        entry.inode = InodeId::ROOT;
                        updated = true;
                    }
                }
                if updated {
                    write_dir_entries(self.io.as_ref(), block, &entries)?;
                }
            }
        }

        if let Some(cache) = &self.cache {
            cache.clear_cache()?;
        }
        debug!(target: "rsfs::snapshot", event = "restored", name);
        self.alloc.sync()
    }

    /// Drop a snapshot: walk its cloned tree decrementing block refcounts
    /// and freeing its inodes, then rewrite the list.
    pub fn delete_snapshot(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        if !state.loaded {
            return Err(FsError::InvalidParam("snapshot manager not loaded".into()));
        }
        let idx = Self::find_index(&state, name)
            .ok_or_else(|| FsError::SnapshotNotFound(name.to_string()))?;
        let root = state.snapshots[idx].root_inode;

        let mut visited = HashSet::new();
        if let Err(err) = self.free_snapshot_tree(root, &mut visited) {
            warn!(target: "rsfs::snapshot", event = "delete_partial", name, error = %err);
        }

        state.snapshots.remove(idx);
        state.dirty = true;
        state.stats.total_snapshots = state.snapshots.len() as u32;
        self.alloc.set_snapshot_count(state.snapshots.len() as u32)?;
        self.save_list(&mut state)?;
        state.dirty = false;
        debug!(target: "rsfs::snapshot", event = "deleted", name);
        Ok(())
    }

    #[must_use]
    pub fn list_snapshots(&self) -> Vec<SnapshotInfo> {
        self.state.lock().snapshots.clone()
    }

    pub fn get_snapshot(&self, name: &str) -> Result<SnapshotInfo> {
        let state = self.state.lock();
        Self::find_index(&state, name)
            .map(|idx| state.snapshots[idx].clone())
            .ok_or_else(|| FsError::SnapshotNotFound(name.to_string()))
    }

    #[must_use]
    pub fn snapshot_exists(&self, name: &str) -> bool {
        Self::find_index(&self.state.lock(), name).is_some()
    }

    #[must_use]
    pub fn snapshot_count(&self) -> u32 {
        self.state.lock().snapshots.len() as u32
    }

    #[must_use]
    pub fn max_snapshots(&self) -> u32 {
        MAX_SNAPSHOTS as u32
    }

    #[must_use]
    pub fn stats(&self) -> SnapshotStats {
        self.state.lock().stats
    }

    pub fn reset_stats(&self) {
        let mut state = self.state.lock();
        state.stats.cow_operations = 0;
        state.stats.shared_blocks = 0;
    }

    // ── Tree cloning ────────────────────────────────────────────────────

    fn clone_tree(
        &self,
        src_inode: InodeId,
        parent_inode: InodeId,
        inode_map: &mut HashMap<InodeId, InodeId>,
        state: &mut SnapState,
    ) -> Result<InodeId> {
        if let Some(&already) = inode_map.get(&src_inode) {
            return Ok(already);
        }

        let src = self.alloc.read_inode(src_inode)?;
        let new_inode_id = self.alloc.alloc_inode()?;
        inode_map.insert(src_inode, new_inode_id);

        let mut dst = src.clone();
        dst.ref_count = 1;

        if dst.is_directory() {
            // Directories are deep-copied: fresh entry blocks with child ids
            // rewritten to their clones.
            dst.direct_blocks = [BlockNo::INVALID; rsfs_types::NUM_DIRECT_BLOCKS];
            dst.single_indirect = BlockNo::INVALID;
            dst.double_indirect = BlockNo::INVALID;
            dst.block_count = 0;

            let num_blocks = (src.size as usize).div_ceil(BLOCK_SIZE).max(1) as u32;
            for bi in 0..num_blocks {
                let Ok(block) = file_block_at(self.io.as_ref(), &src, bi) else {
                    continue;
                };
                let mut entries = read_dir_entries(self.io.as_ref(), block)?;
                for entry in &mut entries {
                    if !entry.is_valid() {
                        continue;
                    }
                    let entry_name = entry.name();
                    if entry_name == "." {
                        entry.inode = new_inode_id;
                    } else if entry_name == ".." {
                        entry.inode = if parent_inode == InodeId::INVALID {
                            new_inode_id
                        } else {
                            parent_inode
                        };
                    } else {
                        entry.inode =
                            self.clone_tree(entry.inode, new_inode_id, inode_map, state)?;
                    }
                }

                let new_block = self.alloc.alloc_block()?;
                if let Err(err) = write_dir_entries(self.io.as_ref(), new_block, &entries) {
                    let _ = self.alloc.free_block(new_block);
                    return Err(err);
                }
                if let Err(err) =
                    set_file_block(self.io.as_ref(), &self.alloc, &mut dst, bi, new_block)
                {
                    let _ = self.alloc.free_block(new_block);
                    return Err(err);
                }
            }
        } else {
            // Files share their whole block tree by refcount.
            self.increment_block_refs(&src, state)?;
        }

        self.alloc.write_inode(new_inode_id, &dst)?;
        Ok(new_inode_id)
    }

    /// Bump the refcount of every data and indirect block reachable from a
    /// file inode.
    fn increment_block_refs(&self, inode: &Inode, state: &mut SnapState) -> Result<()> {
        for &block in &inode.direct_blocks {
            if block.is_valid() {
                self.alloc.inc_block_ref(block)?;
                state.stats.shared_blocks += 1;
            }
        }

        if inode.single_indirect.is_valid() {
            self.alloc.inc_block_ref(inode.single_indirect)?;
            for ptr in self.indirect_pointers(inode.single_indirect)? {
                self.alloc.inc_block_ref(ptr)?;
                state.stats.shared_blocks += 1;
            }
        }

        if inode.double_indirect.is_valid() {
            self.alloc.inc_block_ref(inode.double_indirect)?;
            for l1 in self.indirect_pointers(inode.double_indirect)? {
                self.alloc.inc_block_ref(l1)?;
                for ptr in self.indirect_pointers(l1)? {
                    self.alloc.inc_block_ref(ptr)?;
                    state.stats.shared_blocks += 1;
                }
            }
        }
        Ok(())
    }

    /// Drop one reference from every data and indirect block reachable from
    /// a file inode (data first, then the indirect block itself).
    fn decrement_block_refs(&self, inode: &Inode) -> Result<()> {
        for &block in &inode.direct_blocks {
            if block.is_valid() {
                self.alloc.dec_block_ref(block)?;
            }
        }

        if inode.single_indirect.is_valid() {
            for ptr in self.indirect_pointers(inode.single_indirect)? {
                self.alloc.dec_block_ref(ptr)?;
            }
            self.alloc.dec_block_ref(inode.single_indirect)?;
        }

        if inode.double_indirect.is_valid() {
            for l1 in self.indirect_pointers(inode.double_indirect)? {
                for ptr in self.indirect_pointers(l1)? {
                    self.alloc.dec_block_ref(ptr)?;
                }
                self.alloc.dec_block_ref(l1)?;
            }
            self.alloc.dec_block_ref(inode.double_indirect)?;
        }
        Ok(())
    }

    /// Valid pointers stored in one indirect block.
    fn indirect_pointers(&self, indirect: BlockNo) -> Result<Vec<BlockNo>> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.io.read_block(indirect, &mut buf)?;
        let mut pointers = Vec::new();
        for slot in 0..rsfs_types::PTRS_PER_BLOCK {
            let off = slot * 4;
            let ptr = BlockNo(u32::from_le_bytes([
                buf[off],
                buf[off + 1],
                buf[off + 2],
                buf[off + 3],
            ]));
            if ptr.is_valid() {
                pointers.push(ptr);
            }
        }
        Ok(pointers)
    }

    fn free_snapshot_tree(&self, inode_id: InodeId, visited: &mut HashSet<InodeId>) -> Result<()> {
        if inode_id == InodeId::INVALID || !visited.insert(inode_id) {
            return Ok(());
        }

        let inode = self.alloc.read_inode(inode_id)?;

        if inode.is_directory() {
            let num_blocks = (inode.size as usize).div_ceil(BLOCK_SIZE).max(1) as u32;
            for bi in 0..num_blocks {
                let Ok(block) = file_block_at(self.io.as_ref(), &inode, bi) else {
                    continue;
                };
                for entry in read_dir_entries(self.io.as_ref(), block)? {
                    if !entry.is_valid() {
                        continue;
                    }
                    let entry_name = entry.name();
                    if entry_name == "." || entry_name == ".." {
                        continue;
                    }
                    self.free_snapshot_tree(entry.inode, visited)?;
                }
            }
        }

        self.decrement_block_refs(&inode)?;
        self.alloc.free_inode(inode_id)?;
        Ok(())
    }

    // ── Refcount bootstrap & usage collection ───────────────────────────

    /// Recompute the whole refcount table from reachability: zero it, pin
    /// the snapshot list block, then walk the live root and every snapshot
    /// root counting one reference per pointer slot.
    pub fn rebuild_block_refcounts(&self) -> Result<()> {
        self.alloc.reset_block_refs()?;

        let sb = self.alloc.superblock();
        if sb.snapshot_list_block.0 != 0 && sb.snapshot_list_block.is_valid() {
            // Allocated but unreachable from any inode tree.
            self.alloc.bump_block_ref(sb.snapshot_list_block)?;
        }

        let mut roots = vec![sb.root_inode];
        roots.extend(self.state.lock().snapshots.iter().map(|s| s.root_inode));

        for root in roots {
            let mut visited = HashSet::new();
            self.walk_tree(root, &mut visited, &mut |_inode| {}, &mut |block| {
                let _ = self.alloc.bump_block_ref(block);
            })?;
        }
        trace!(target: "rsfs::snapshot", event = "refcounts_rebuilt");
        Ok(())
    }

    /// Reachable inode and block sets over the live tree plus every
    /// snapshot, for consistency reconciliation. Includes the snapshot list
    /// block.
    pub fn collect_usage(
        &self,
        used_inodes: &mut HashSet<InodeId>,
        used_blocks: &mut HashSet<BlockNo>,
    ) -> Result<()> {
        let sb = self.alloc.superblock();
        if sb.snapshot_list_block.0 != 0 && sb.snapshot_list_block.is_valid() {
            used_blocks.insert(sb.snapshot_list_block);
        }

        let mut roots = vec![sb.root_inode];
        roots.extend(self.state.lock().snapshots.iter().map(|s| s.root_inode));

        for root in roots {
            let mut visited = HashSet::new();
            self.walk_tree(
                root,
                &mut visited,
                &mut |inode| {
                    used_inodes.insert(inode);
                },
                &mut |block| {
                    used_blocks.insert(block);
                },
            )?;
        }
        Ok(())
    }

    /// Depth-first walk over one inode tree, reporting every reachable
    /// inode and every reachable block (data + indirect).
    fn walk_tree(
        &self,
        inode_id: InodeId,
        visited: &mut HashSet<InodeId>,
        on_inode: &mut dyn FnMut(InodeId),
        on_block: &mut dyn FnMut(BlockNo),
    ) -> Result<()> {
        if inode_id == InodeId::INVALID || !visited.insert(inode_id) {
            return Ok(());
        }
        on_inode(inode_id);

        let inode = self.alloc.read_inode(inode_id)?;

        for &block in &inode.direct_blocks {
            if block.is_valid() {
                on_block(block);
            }
        }
        if inode.single_indirect.is_valid() {
            on_block(inode.single_indirect);
            for ptr in self.indirect_pointers(inode.single_indirect)? {
                on_block(ptr);
            }
        }
        if inode.double_indirect.is_valid() {
            on_block(inode.double_indirect);
            for l1 in self.indirect_pointers(inode.double_indirect)? {
                on_block(l1);
                for ptr in self.indirect_pointers(l1)? {
                    on_block(ptr);
                }
            }
        }

        if inode.is_directory() {
            let num_blocks = (inode.size as usize).div_ceil(BLOCK_SIZE).max(1) as u32;
            for bi in 0..num_blocks {
                let Ok(block) = file_block_at(self.io.as_ref(), &inode, bi) else {
                    continue;
                };
                for entry in read_dir_entries(self.io.as_ref(), block)? {
                    if !entry.is_valid() {
                        continue;
                    }
                    let entry_name = entry.name();
                    if entry_name == "." || entry_name == ".." {
                        continue;
                    }
                    self.walk_tree(entry.inode, visited, on_inode, on_block)?;
                }
            }
        }
        Ok(())
    }
}

// ── COW contract ────────────────────────────────────────────────────────────

impl BlockCow for SnapshotManager {
    /// A block needs COW when snapshots exist and more than one reference
    /// points at it.
    fn needs_cow(&self, block: BlockNo) -> bool {
        if self.state.lock().snapshots.is_empty() {
            return false;
        }
        self.alloc.block_ref(block) > 1
    }

    /// Allocate a fresh block, copy the shared contents, and release one
    /// reference from the original.
    fn perform_cow(&self, block: BlockNo) -> Result<BlockNo> {
        if !self.needs_cow(block) {
            return Ok(block);
        }

        let new_block = self.alloc.alloc_block()?;
        let mut buf = [0u8; BLOCK_SIZE];
        if let Err(err) = self.io.read_block(block, &mut buf) {
            let _ = self.alloc.free_block(new_block);
            return Err(err);
        }
        if let Err(err) = self.io.write_block(new_block, &buf) {
            let _ = self.alloc.free_block(new_block);
            return Err(err);
        }

        self.alloc.dec_block_ref(block)?;
        self.state.lock().stats.cow_operations += 1;
        trace!(
            target: "rsfs::snapshot",
            event = "cow",
            old = block.0,
            new = new_block.0
        );
        Ok(new_block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsfs_block::{format_image, DiskImage, FormatOptions};
    use rsfs_dir::Directory;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        alloc: Arc<Allocator>,
        engine: Arc<Directory>,
        snap: Arc<SnapshotManager>,
    }

    /// Format a real image and wire allocator + directory + snapshot layer
    /// the way mount does.
    fn mount_fresh() -> Harness {
        let tmp = TempDir::new().expect("tempdir");
        let path = tmp.path().join("snap.img");
        format_image(
            &path,
            &FormatOptions {
                total_blocks: 2048,
                total_inodes: 256,
                force: false,
            },
        )
        .expect("format");

        let io: Arc<dyn BlockIo> = Arc::new(DiskImage::open(&path).expect("open"));
        let alloc = Arc::new(Allocator::new(io.clone()));
        alloc.load().expect("load");
        let engine = Arc::new(Directory::new(alloc.clone(), io.clone()));
        let snap = Arc::new(SnapshotManager::new(alloc.clone(), io, None));
        snap.load().expect("load snapshots");
        snap.rebuild_block_refcounts().expect("rebuild");
        engine.set_cow(snap.clone());

        Harness {
            _dir: tmp,
            alloc,
            engine,
            snap,
        }
    }

    #[test]
    fn create_lists_and_persists() {
        let h = mount_fresh();
        h.engine.create_file("/f").expect("create");
        h.engine.write_file("/f", b"payload", 0).expect("write");

        h.snap.create_snapshot("v1").expect("snapshot");
        assert!(h.snap.snapshot_exists("v1"));
        assert_eq!(h.snap.snapshot_count(), 1);
        assert_eq!(h.snap.list_snapshots()[0].name, "v1");

        // List block was lazily allocated and recorded in the superblock.
        let sb = h.alloc.superblock();
        assert!(sb.snapshot_list_block.0 != 0);
        assert_eq!(sb.snapshot_count, 1);

        // A second manager over the same endpoint reads the list back.
        let snap2 = SnapshotManager::new(h.alloc.clone(), h.snap.io.clone(), None);
        snap2.load().expect("reload");
        assert!(snap2.snapshot_exists("v1"));
        assert_ne!(
            snap2.get_snapshot("v1").expect("get").root_inode,
            InodeId::ROOT
        );
    }

    #[test]
    fn name_validation_and_bounds() {
        let h = mount_fresh();
        assert!(matches!(
            h.snap.create_snapshot(""),
            Err(FsError::InvalidParam(_))
        ));
        assert!(matches!(
            h.snap.create_snapshot(&"x".repeat(32)),
            Err(FsError::NameTooLong)
        ));

        h.snap.create_snapshot("dup").expect("snapshot");
        assert!(matches!(
            h.snap.create_snapshot("dup"),
            Err(FsError::SnapshotExists(_))
        ));
        assert!(matches!(
            h.snap.delete_snapshot("ghost"),
            Err(FsError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn snapshot_limit_enforced() {
        let h = mount_fresh();
        for i in 0..MAX_SNAPSHOTS {
            h.snap.create_snapshot(&format!("s{i}")).expect("snapshot");
        }
        assert!(matches!(
            h.snap.create_snapshot("one-too-many"),
            Err(FsError::MaxSnapshots)
        ));
    }

    #[test]
    fn file_blocks_are_shared_by_refcount() {
        let h = mount_fresh();
        h.engine.create_file("/f").expect("create");
        h.engine.write_file("/f", &vec![7u8; 2048], 0).expect("write");

        let inode_id = h.engine.resolve_path("/f").expect("resolve");
        let inode = h.alloc.read_inode(inode_id).expect("read inode");
        let block = inode.direct_blocks[0];
        assert_eq!(h.alloc.block_ref(block), 1);

        h.snap.create_snapshot("v1").expect("snapshot");
        assert_eq!(h.alloc.block_ref(block), 2);
        assert!(h.snap.needs_cow(block));
    }

    #[test]
    fn no_cow_without_snapshots() {
        let h = mount_fresh();
        h.engine.create_file("/f").expect("create");
        h.engine.write_file("/f", b"x", 0).expect("write");

        let inode_id = h.engine.resolve_path("/f").expect("resolve");
        let block = h
            .alloc
            .read_inode(inode_id)
            .expect("inode")
            .direct_blocks[0];
        assert!(!h.snap.needs_cow(block));
        // perform_cow on an unshared block is the identity.
        assert_eq!(h.snap.perform_cow(block).expect("cow"), block);
    }

    #[test]
    fn write_after_snapshot_cows_data_block() {
        let h = mount_fresh();
        h.engine.create_file("/f").expect("create");
        h.engine.write_file("/f", b"original", 0).expect("write");

        let inode_id = h.engine.resolve_path("/f").expect("resolve");
        let old_block = h
            .alloc
            .read_inode(inode_id)
            .expect("inode")
            .direct_blocks[0];

        h.snap.create_snapshot("v1").expect("snapshot");
        h.engine.write_file("/f", b"modified", 0).expect("write");

        let new_block = h
            .alloc
            .read_inode(inode_id)
            .expect("inode")
            .direct_blocks[0];
        assert_ne!(new_block, old_block);
        assert_eq!(h.alloc.block_ref(old_block), 1);
        assert_eq!(h.alloc.block_ref(new_block), 1);
        assert!(h.snap.stats().cow_operations >= 1);

        // The snapshot's clone still points at the original bytes.
        let snap_root = h.snap.get_snapshot("v1").expect("get").root_inode;
        let root = h.alloc.read_inode(snap_root).expect("snap root");
        let entries = read_dir_entries(h.snap.io.as_ref(), root.direct_blocks[0]).expect("entries");
        let snap_file = entries
            .iter()
            .find(|e| e.is_valid() && e.name() == "f")
            .expect("snapshot entry");
        let snap_inode = h.alloc.read_inode(snap_file.inode).expect("snap inode");
        assert_eq!(snap_inode.direct_blocks[0], old_block);
    }

    #[test]
    fn restore_brings_back_old_content() {
        let h = mount_fresh();
        h.engine.create_file("/f").expect("create");
        h.engine
            .write_file("/f", b"Hello, World!", 0)
            .expect("write");

        h.snap.create_snapshot("v1").expect("snapshot");
        h.engine
            .write_file("/f", b"overwritten content!", 0)
            .expect("write");
        assert_eq!(
            h.engine.read_file("/f", 0, 0).expect("read"),
            b"overwritten content!"
        );

        h.snap.restore_snapshot("v1").expect("restore");
        h.alloc.reload().expect("reload");
        h.snap.rebuild_block_refcounts().expect("rebuild");

        let data = h.engine.read_file("/f", 0, 0).expect("read");
        assert_eq!(data, b"Hello, World!");
        assert_eq!(h.engine.stat("/f").expect("stat").size, 13);

        // Root's dot entries point at the live root again.
        let entries = h.engine.list("/").expect("list");
        for entry in entries.iter().filter(|e| e.name() == "." || e.name() == "..") {
            assert_eq!(entry.inode, InodeId::ROOT);
        }
    }

    #[test]
    fn restore_missing_snapshot_fails() {
        let h = mount_fresh();
        assert!(matches!(
            h.snap.restore_snapshot("nope"),
            Err(FsError::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn delete_returns_resources() {
        let h = mount_fresh();
        h.engine.mkdir("/d").expect("mkdir");
        h.engine.create_file("/d/f").expect("create");
        h.engine
            .write_file("/d/f", &vec![3u8; 5000], 0)
            .expect("write");

        let free_blocks_before = h.alloc.free_block_count();
        let free_inodes_before = h.alloc.free_inode_count();

        h.snap.create_snapshot("v1").expect("snapshot");
        h.snap.delete_snapshot("v1").expect("delete");

        // All clone resources returned except the retained list block.
        assert_eq!(h.alloc.free_block_count(), free_blocks_before - 1);
        assert_eq!(h.alloc.free_inode_count(), free_inodes_before);
        assert!(!h.snap.snapshot_exists("v1"));

        // Live data is untouched.
        assert_eq!(
            h.engine.read_file("/d/f", 0, 0).expect("read"),
            vec![3u8; 5000]
        );
    }

    #[test]
    fn rebuild_refcounts_from_reachability() {
        let h = mount_fresh();
        h.engine.create_file("/f").expect("create");
        h.engine.write_file("/f", &vec![9u8; 3000], 0).expect("write");
        h.snap.create_snapshot("v1").expect("snapshot");

        let inode_id = h.engine.resolve_path("/f").expect("resolve");
        let block = h
            .alloc
            .read_inode(inode_id)
            .expect("inode")
            .direct_blocks[0];
        assert_eq!(h.alloc.block_ref(block), 2);

        // Rebuild from scratch reproduces the same counts.
        h.snap.rebuild_block_refcounts().expect("rebuild");
        assert_eq!(h.alloc.block_ref(block), 2);

        // The snapshot list block stays pinned at one reference.
        let list_block = h.alloc.superblock().snapshot_list_block;
        assert_eq!(h.alloc.block_ref(list_block), 1);
    }

    #[test]
    fn collect_usage_covers_everything_allocated() {
        let h = mount_fresh();
        h.engine.mkdir("/a").expect("mkdir");
        h.engine.create_file("/a/f").expect("create");
        h.engine
            .write_file("/a/f", &vec![5u8; 20 * 1024], 0)
            .expect("write");
        h.snap.create_snapshot("v1").expect("snapshot");

        let mut used_inodes = HashSet::new();
        let mut used_blocks = HashSet::new();
        h.snap
            .collect_usage(&mut used_inodes, &mut used_blocks)
            .expect("collect");

        // Every allocation is accounted for: reconciliation is clean.
        assert!(h
            .alloc
            .reconcile_usage(&used_inodes, &used_blocks, false)
            .is_ok());
        assert!(used_inodes.contains(&InodeId::ROOT));
    }

    #[test]
    fn snapshot_of_nested_tree_clones_directories() {
        let h = mount_fresh();
        h.engine.mkdir("/a").expect("mkdir");
        h.engine.mkdir("/a/b").expect("mkdir");
        h.engine.create_file("/a/b/leaf").expect("create");
        h.engine.write_file("/a/b/leaf", b"leaf", 0).expect("write");

        h.snap.create_snapshot("tree").expect("snapshot");

        // Clone roots differ from the live tree.
        let snap_root = h.snap.get_snapshot("tree").expect("get").root_inode;
        assert_ne!(snap_root, InodeId::ROOT);

        // Deleting live content leaves the snapshot intact.
        h.engine.remove("/a/b/leaf").expect("remove");
        h.engine.rmdir("/a/b").expect("rmdir");
        h.engine.rmdir("/a").expect("rmdir");

        h.snap.restore_snapshot("tree").expect("restore");
        h.alloc.reload().expect("reload");
        h.snap.rebuild_block_refcounts().expect("rebuild");
        assert_eq!(
            h.engine.read_file("/a/b/leaf", 0, 0).expect("read"),
            b"leaf"
        );
    }
}

