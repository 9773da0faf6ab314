#![forbid(unsafe_code)]
//! Directory and file engine for rsfs.
//!
//! Path resolution, fixed-width directory entries, file block lookup
//! through direct/single-indirect/double-indirect pointers, and
//! read/write/truncate/append with copy-on-write interception when
//! snapshots share blocks.

mod path;

pub use path::{is_valid_filename, is_valid_path, normalize_path, split_path};

use parking_lot::Mutex;
use rsfs_alloc::Allocator;
use rsfs_block::BlockIo;
use rsfs_error::{FsError, Result};
use rsfs_types::{
    unix_now, BlockNo, DirEntry, FileStat, FileType, Inode, InodeId, BLOCK_SIZE,
    DIRENTRIES_PER_BLOCK, DIRENTRY_SIZE, MAX_FILENAME_LEN, NUM_DIRECT_BLOCKS, PTRS_PER_BLOCK,
};
use std::sync::Arc;
use tracing::{debug, trace};

/// Copy-on-write interception hook, installed by the snapshot layer.
///
/// `needs_cow` answers whether a block is shared (refcount > 1 while
/// snapshots exist); `perform_cow` allocates a fresh copy, decrements the
/// old block's refcount, and returns the replacement.
pub trait BlockCow: Send + Sync {
    fn needs_cow(&self, block: BlockNo) -> bool;
    fn perform_cow(&self, block: BlockNo) -> Result<BlockNo>;
}

/// Result of resolving the parent of a path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentInfo {
    pub parent_inode: InodeId,
    pub filename: String,
}

// ── Directory block helpers ─────────────────────────────────────────────────

/// Parse a directory block into its 16 entry slots.
pub fn read_dir_entries(io: &dyn BlockIo, block: BlockNo) -> Result<Vec<DirEntry>> {
    let mut buf = [0u8; BLOCK_SIZE];
    io.read_block(block, &mut buf)?;
    let mut entries = Vec::with_capacity(DIRENTRIES_PER_BLOCK);
    for slot in 0..DIRENTRIES_PER_BLOCK {
        let off = slot * DIRENTRY_SIZE;
        let entry = DirEntry::decode(&buf[off..off + DIRENTRY_SIZE])
            .map_err(|e| FsError::Internal(format!("dir block {block} decode failed: {e}")))?;
        entries.push(entry);
    }
    Ok(entries)
}

/// Serialize 16 entry slots back into a directory block.
pub fn write_dir_entries(io: &dyn BlockIo, block: BlockNo, entries: &[DirEntry]) -> Result<()> {
    debug_assert_eq!(entries.len(), DIRENTRIES_PER_BLOCK);
    let mut buf = [0u8; BLOCK_SIZE];
    for (slot, entry) in entries.iter().enumerate() {
        let off = slot * DIRENTRY_SIZE;
        entry.encode_into(&mut buf[off..off + DIRENTRY_SIZE]);
    }
    io.write_block(block, &buf)
}

// ── Indirect block helpers ──────────────────────────────────────────────────

/// Read pointer `idx` out of an indirect block; absence is `NotFound`.
pub fn read_indirect_slot(io: &dyn BlockIo, indirect: BlockNo, idx: u32) -> Result<BlockNo> {
    if !indirect.is_valid() || idx as usize >= PTRS_PER_BLOCK {
        return Err(FsError::InvalidParam(format!("indirect slot {idx} invalid")));
    }
    let mut buf = [0u8; BLOCK_SIZE];
    io.read_block(indirect, &mut buf)?;
    let off = idx as usize * 4;
    let ptr = BlockNo(u32::from_le_bytes([
        buf[off],
        buf[off + 1],
        buf[off + 2],
        buf[off + 3],
    ]));
    if ptr.is_valid() {
        Ok(ptr)
    } else {
        Err(FsError::NotFound(format!("indirect slot {idx} empty")))
    }
}

/// Write pointer `idx` into an indirect block.
pub fn write_indirect_slot(
    io: &dyn BlockIo,
    indirect: BlockNo,
    idx: u32,
    value: BlockNo,
) -> Result<()> {
    if !indirect.is_valid() || idx as usize >= PTRS_PER_BLOCK {
        return Err(FsError::InvalidParam(format!("indirect slot {idx} invalid")));
    }
    let mut buf = [0u8; BLOCK_SIZE];
    io.read_block(indirect, &mut buf)?;
    let off = idx as usize * 4;
    buf[off..off + 4].copy_from_slice(&value.0.to_le_bytes());
    io.write_block(indirect, &buf)
}

/// Allocate a fresh indirect block with every pointer absent.
pub fn alloc_indirect_block(io: &dyn BlockIo, alloc: &Allocator) -> Result<BlockNo> {
    let block = alloc.alloc_block()?;
    let mut buf = [0u8; BLOCK_SIZE];
    for slot in 0..PTRS_PER_BLOCK {
        let off = slot * 4;
        buf[off..off + 4].copy_from_slice(&BlockNo::INVALID.0.to_le_bytes());
    }
    if let Err(err) = io.write_block(block, &buf) {
        let _ = alloc.free_block(block);
        return Err(err);
    }
    Ok(block)
}

// ── File block mapping ──────────────────────────────────────────────────────

const SINGLE_LIMIT: u32 = (NUM_DIRECT_BLOCKS + PTRS_PER_BLOCK) as u32;
const DOUBLE_LIMIT: u32 = Inode::max_blocks();

/// Look up the absolute block for file block index `index`.
///
/// A missing pointer along the way is `NotFound` (read paths treat it as a
/// zero-filled hole); an index past the double-indirect capacity is
/// `FileTooLarge`.
pub fn file_block_at(io: &dyn BlockIo, inode: &Inode, index: u32) -> Result<BlockNo> {
    if (index as usize) < NUM_DIRECT_BLOCKS {
        let block = inode.direct_blocks[index as usize];
        return if block.is_valid() {
            Ok(block)
        } else {
            Err(FsError::NotFound(format!("file block {index} unmapped")))
        };
    }

    if index < SINGLE_LIMIT {
        if !inode.single_indirect.is_valid() {
            return Err(FsError::NotFound(format!("file block {index} unmapped")));
        }
        return read_indirect_slot(io, inode.single_indirect, index - NUM_DIRECT_BLOCKS as u32);
    }

    if index < DOUBLE_LIMIT {
        if !inode.double_indirect.is_valid() {
            return Err(FsError::NotFound(format!("file block {index} unmapped")));
        }
        let rel = index - SINGLE_LIMIT;
        let l1 = read_indirect_slot(io, inode.double_indirect, rel / PTRS_PER_BLOCK as u32)?;
        return read_indirect_slot(io, l1, rel % PTRS_PER_BLOCK as u32);
    }

    Err(FsError::FileTooLarge)
}

/// Bind file block index `index` to `block`, allocating any missing indirect
/// blocks. New bindings (and new indirect blocks) bump `inode.block_count`;
/// the caller persists the inode.
pub fn set_file_block(
    io: &dyn BlockIo,
    alloc: &Allocator,
    inode: &mut Inode,
    index: u32,
    block: BlockNo,
) -> Result<()> {
    if (index as usize) < NUM_DIRECT_BLOCKS {
        if !inode.direct_blocks[index as usize].is_valid() {
            inode.block_count += 1;
        }
        inode.direct_blocks[index as usize] = block;
        return Ok(());
    }

    if index < SINGLE_LIMIT {
        if !inode.single_indirect.is_valid() {
            inode.single_indirect = alloc_indirect_block(io, alloc)?;
            inode.block_count += 1;
        }
        let slot = index - NUM_DIRECT_BLOCKS as u32;
        if read_indirect_slot(io, inode.single_indirect, slot).is_err() {
            inode.block_count += 1;
        }
        return write_indirect_slot(io, inode.single_indirect, slot, block);
    }

    if index < DOUBLE_LIMIT {
        if !inode.double_indirect.is_valid() {
            inode.double_indirect = alloc_indirect_block(io, alloc)?;
            inode.block_count += 1;
        }
        let rel = index - SINGLE_LIMIT;
        let l1_idx = rel / PTRS_PER_BLOCK as u32;
        let l2_idx = rel % PTRS_PER_BLOCK as u32;

        let l1 = match read_indirect_slot(io, inode.double_indirect, l1_idx) {
            Ok(existing) => existing,
            Err(FsError::NotFound(_)) => {
                let fresh = alloc_indirect_block(io, alloc)?;
                write_indirect_slot(io, inode.double_indirect, l1_idx, fresh)?;
                inode.block_count += 1;
                fresh
            }
            Err(err) => return Err(err),
        };

        if read_indirect_slot(io, l1, l2_idx).is_err() {
            inode.block_count += 1;
        }
        return write_indirect_slot(io, l1, l2_idx, block);
    }

    Err(FsError::FileTooLarge)
}

// ── Directory engine ────────────────────────────────────────────────────────

/// Path and file operations over one mounted allocator + block endpoint.
///
/// All public operations serialize under one mutex; lock order is always
/// Directory → Allocator → block endpoint.
pub struct Directory {
    alloc: Arc<Allocator>,
    io: Arc<dyn BlockIo>,
    cow: Mutex<Option<Arc<dyn BlockCow>>>,
    ops: Mutex<()>,
}

impl Directory {
    #[must_use]
    pub fn new(alloc: Arc<Allocator>, io: Arc<dyn BlockIo>) -> Self {
        Self {
            alloc,
            io,
            cow: Mutex::new(None),
            ops: Mutex::new(()),
        }
    }

    /// Install the snapshot layer's COW hook. Writes consult it from then on.
    pub fn set_cow(&self, cow: Arc<dyn BlockCow>) {
        *self.cow.lock() = Some(cow);
    }

    fn cow_hook(&self) -> Option<Arc<dyn BlockCow>> {
        self.cow.lock().clone()
    }

    // ── Path resolution ─────────────────────────────────────────────────

    /// Resolve an absolute path to its inode. `/` is the root.
    pub fn resolve_path(&self, path: &str) -> Result<InodeId> {
        let _guard = self.ops.lock();
        self.resolve_path_inner(path)
    }

    fn resolve_path_inner(&self, path: &str) -> Result<InodeId> {
        let components = split_path(path);
        let mut current = InodeId::ROOT;
        for name in &components {
            let inode = self.alloc.read_inode(current)?;
            if !inode.is_directory() {
                return Err(FsError::NotDirectory);
            }
            let entry = self
                .lookup_inner(current, name)?
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            current = entry.inode;
        }
        Ok(current)
    }

    /// Resolve everything but the last component; fails on `/` itself.
    pub fn resolve_parent(&self, path: &str) -> Result<ParentInfo> {
        let _guard = self.ops.lock();
        self.resolve_parent_inner(path)
    }

    fn resolve_parent_inner(&self, path: &str) -> Result<ParentInfo> {
        let mut components = split_path(path);
        let Some(filename) = components.pop() else {
            return Err(FsError::InvalidPath(path.to_string()));
        };

        let mut current = InodeId::ROOT;
        for name in &components {
            let inode = self.alloc.read_inode(current)?;
            if !inode.is_directory() {
                return Err(FsError::NotDirectory);
            }
            let entry = self
                .lookup_inner(current, name)?
                .ok_or_else(|| FsError::NotFound(path.to_string()))?;
            current = entry.inode;
        }

        let parent = self.alloc.read_inode(current)?;
        if !parent.is_directory() {
            return Err(FsError::NotDirectory);
        }
        Ok(ParentInfo {
            parent_inode: current,
            filename,
        })
    }

    // ── Metadata ────────────────────────────────────────────────────────

    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let _guard = self.ops.lock();
        let inode_id = self.resolve_path_inner(path)?;
        self.stat_inode_inner(inode_id)
    }

    pub fn stat_inode(&self, inode_id: InodeId) -> Result<FileStat> {
        let _guard = self.ops.lock();
        self.stat_inode_inner(inode_id)
    }

    fn stat_inode_inner(&self, inode_id: InodeId) -> Result<FileStat> {
        let inode = self.alloc.read_inode(inode_id)?;
        Ok(FileStat {
            inode: inode_id,
            file_type: inode.file_type,
            size: inode.size,
            link_count: inode.link_count,
            create_time: inode.create_time,
            modify_time: inode.modify_time,
            access_time: inode.access_time,
            blocks: inode.block_count,
        })
    }

    pub fn exists(&self, path: &str) -> bool {
        self.resolve_path(path).is_ok()
    }

    pub fn is_directory(&self, path: &str) -> bool {
        self.stat(path)
            .map(|st| st.file_type == FileType::Directory)
            .unwrap_or(false)
    }

    pub fn is_file(&self, path: &str) -> bool {
        self.stat(path)
            .map(|st| st.file_type == FileType::Regular)
            .unwrap_or(false)
    }

    // ── Directory entries ───────────────────────────────────────────────

    /// First valid entry named `name` inside `dir_inode`.
    pub fn lookup(&self, dir_inode: InodeId, name: &str) -> Result<DirEntry> {
        let _guard = self.ops.lock();
        self.lookup_inner(dir_inode, name)?
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    fn lookup_inner(&self, dir_inode: InodeId, name: &str) -> Result<Option<DirEntry>> {
        let dir = self.alloc.read_inode(dir_inode)?;
        if !dir.is_directory() {
            return Err(FsError::NotDirectory);
        }
        for block in self.dir_blocks(&dir) {
            for entry in read_dir_entries(self.io.as_ref(), block)? {
                if entry.is_valid() && entry.name() == name {
                    return Ok(Some(entry));
                }
            }
        }
        Ok(None)
    }

    /// Directory content blocks, in file order, skipping holes.
    fn dir_blocks(&self, dir: &Inode) -> Vec<BlockNo> {
        let num_blocks = (dir.size as usize).div_ceil(BLOCK_SIZE).max(1) as u32;
        (0..num_blocks)
            .filter_map(|bi| file_block_at(self.io.as_ref(), dir, bi).ok())
            .collect()
    }

    /// Insert `name → target` into `dir_inode`, reusing the first invalid
    /// slot or growing the directory by one block.
    pub fn add_entry(
        &self,
        dir_inode: InodeId,
        name: &str,
        target: InodeId,
        file_type: FileType,
    ) -> Result<()> {
        let _guard = self.ops.lock();
        self.add_entry_inner(dir_inode, name, target, file_type)
    }

    fn add_entry_inner(
        &self,
        dir_inode: InodeId,
        name: &str,
        target: InodeId,
        file_type: FileType,
    ) -> Result<()> {
        validate_filename(name)?;
        if self.lookup_inner(dir_inode, name)?.is_some() {
            return Err(FsError::AlreadyExists(name.to_string()));
        }

        let mut dir = self.alloc.read_inode(dir_inode)?;
        if !dir.is_directory() {
            return Err(FsError::NotDirectory);
        }

        let num_blocks = (dir.size as usize).div_ceil(BLOCK_SIZE).max(1) as u32;
        for bi in 0..num_blocks {
            let Ok(block) = file_block_at(self.io.as_ref(), &dir, bi) else {
                continue;
            };
            let mut entries = read_dir_entries(self.io.as_ref(), block)?;
            if let Some(slot) = entries.iter().position(|e| !e.is_valid()) {
                entries[slot] = DirEntry::new(target, name, file_type);
                write_dir_entries(self.io.as_ref(), block, &entries)?;

                let end = bi * BLOCK_SIZE as u32 + (slot as u32 + 1) * DIRENTRY_SIZE as u32;
                if end > dir.size {
                    dir.size = end;
                }
                touch_modify(&mut dir);
                return self.alloc.write_inode(dir_inode, &dir);
            }
        }

        // Every slot taken; extend the directory by one block.
        let new_block = self.get_or_alloc_file_block(&mut dir, dir_inode, num_blocks)?;
        let mut entries = vec![DirEntry::invalid(); DIRENTRIES_PER_BLOCK];
        entries[0] = DirEntry::new(target, name, file_type);
        write_dir_entries(self.io.as_ref(), new_block, &entries)?;

        dir.size = num_blocks * BLOCK_SIZE as u32 + DIRENTRY_SIZE as u32;
        touch_modify(&mut dir);
        self.alloc.write_inode(dir_inode, &dir)
    }

    /// Remove the entry named `name`; `.` and `..` are refused.
    pub fn remove_entry(&self, dir_inode: InodeId, name: &str) -> Result<()> {
        let _guard = self.ops.lock();
        self.remove_entry_inner(dir_inode, name)
    }

    fn remove_entry_inner(&self, dir_inode: InodeId, name: &str) -> Result<()> {
        if name == "." || name == ".." {
            return Err(FsError::PermissionDenied);
        }
        let mut dir = self.alloc.read_inode(dir_inode)?;
        if !dir.is_directory() {
            return Err(FsError::NotDirectory);
        }

        for block in self.dir_blocks(&dir) {
            let mut entries = read_dir_entries(self.io.as_ref(), block)?;
            if let Some(slot) = entries
                .iter()
                .position(|e| e.is_valid() && e.name() == name)
            {
                entries[slot] = DirEntry::invalid();
                write_dir_entries(self.io.as_ref(), block, &entries)?;
                touch_modify(&mut dir);
                return self.alloc.write_inode(dir_inode, &dir);
            }
        }
        Err(FsError::NotFound(name.to_string()))
    }

    /// All valid entries of a directory, including `.` and `..`.
    pub fn list_directory(&self, dir_inode: InodeId) -> Result<Vec<DirEntry>> {
        let _guard = self.ops.lock();
        self.list_directory_inner(dir_inode)
    }

    fn list_directory_inner(&self, dir_inode: InodeId) -> Result<Vec<DirEntry>> {
        let dir = self.alloc.read_inode(dir_inode)?;
        if !dir.is_directory() {
            return Err(FsError::NotDirectory);
        }
        let mut result = Vec::new();
        for block in self.dir_blocks(&dir) {
            for entry in read_dir_entries(self.io.as_ref(), block)? {
                if entry.is_valid() {
                    result.push(entry);
                }
            }
        }
        Ok(result)
    }

    pub fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let _guard = self.ops.lock();
        let inode = self.resolve_path_inner(path)?;
        self.list_directory_inner(inode)
    }

    fn is_directory_empty(&self, dir_inode: InodeId) -> Result<bool> {
        Ok(self
            .list_directory_inner(dir_inode)?
            .iter()
            .all(|e| e.name() == "." || e.name() == ".."))
    }

    // ── Create / remove ─────────────────────────────────────────────────

    /// Create a directory at `path` with `.` and `..` seeded.
    pub fn mkdir(&self, path: &str) -> Result<InodeId> {
        let _guard = self.ops.lock();
        let parent = self.resolve_parent_inner(path)?;
        validate_filename(&parent.filename)?;
        if self.lookup_inner(parent.parent_inode, &parent.filename)?.is_some() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }

        let new_inode = self.alloc.alloc_inode()?;
        let dir_block = match self.alloc.alloc_block() {
            Ok(block) => block,
            Err(err) => {
                let _ = self.alloc.free_inode(new_inode);
                return Err(err);
            }
        };

        let result = self.mkdir_commit(&parent, new_inode, dir_block);
        if result.is_err() {
            let _ = self.alloc.free_block(dir_block);
            let _ = self.alloc.free_inode(new_inode);
        }
        result?;

        debug!(target: "rsfs::dir", event = "mkdir", path, inode = new_inode.0);
        self.alloc.sync()?;
        Ok(new_inode)
    }

    fn mkdir_commit(&self, parent: &ParentInfo, new_inode: InodeId, dir_block: BlockNo) -> Result<()> {
        let now = unix_now();
        let mut entries = vec![DirEntry::invalid(); DIRENTRIES_PER_BLOCK];
        entries[0] = DirEntry::new(new_inode, ".", FileType::Directory);
        entries[1] = DirEntry::new(parent.parent_inode, "..", FileType::Directory);
        write_dir_entries(self.io.as_ref(), dir_block, &entries)?;

        let mut dir = Inode::new(FileType::Directory);
        dir.size = 2 * DIRENTRY_SIZE as u32;
        dir.link_count = 2;
        dir.block_count = 1;
        dir.direct_blocks[0] = dir_block;
        dir.create_time = now;
        dir.modify_time = now;
        dir.access_time = now;
        self.alloc.write_inode(new_inode, &dir)?;

        self.add_entry_inner(
            parent.parent_inode,
            &parent.filename,
            new_inode,
            FileType::Directory,
        )?;

        // New subdirectory's `..` adds one link to the parent.
        let mut parent_inode = self.alloc.read_inode(parent.parent_inode)?;
        parent_inode.link_count += 1;
        self.alloc.write_inode(parent.parent_inode, &parent_inode)
    }

    /// Remove an empty directory. Root is refused.
    pub fn rmdir(&self, path: &str) -> Result<()> {
        let _guard = self.ops.lock();
        if normalize_path(path) == "/" {
            return Err(FsError::PermissionDenied);
        }
        let parent = self.resolve_parent_inner(path)?;
        let entry = self
            .lookup_inner(parent.parent_inode, &parent.filename)?
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let dir_inode = entry.inode;

        let mut dir = self.alloc.read_inode(dir_inode)?;
        if !dir.is_directory() {
            return Err(FsError::NotDirectory);
        }
        if !self.is_directory_empty(dir_inode)? {
            return Err(FsError::NotEmpty);
        }

        self.free_file_blocks(&mut dir, 0)?;
        self.remove_entry_inner(parent.parent_inode, &parent.filename)?;

        let mut parent_inode = self.alloc.read_inode(parent.parent_inode)?;
        if parent_inode.link_count > 0 {
            parent_inode.link_count -= 1;
        }
        self.alloc.write_inode(parent.parent_inode, &parent_inode)?;

        self.alloc.free_inode(dir_inode)?;
        debug!(target: "rsfs::dir", event = "rmdir", path);
        self.alloc.sync()
    }

    /// Create an empty regular file at `path`.
    pub fn create_file(&self, path: &str) -> Result<InodeId> {
        let _guard = self.ops.lock();
        let parent = self.resolve_parent_inner(path)?;
        validate_filename(&parent.filename)?;
        if self.lookup_inner(parent.parent_inode, &parent.filename)?.is_some() {
            return Err(FsError::AlreadyExists(path.to_string()));
        }

        let new_inode = self.alloc.alloc_inode()?;
        let now = unix_now();
        let mut file = Inode::new(FileType::Regular);
        file.create_time = now;
        file.modify_time = now;
        file.access_time = now;

        if let Err(err) = self.alloc.write_inode(new_inode, &file) {
            let _ = self.alloc.free_inode(new_inode);
            return Err(err);
        }
        if let Err(err) = self.add_entry_inner(
            parent.parent_inode,
            &parent.filename,
            new_inode,
            FileType::Regular,
        ) {
            let _ = self.alloc.free_inode(new_inode);
            return Err(err);
        }

        debug!(target: "rsfs::dir", event = "create", path, inode = new_inode.0);
        self.alloc.sync()?;
        Ok(new_inode)
    }

    /// Unlink a regular file; data blocks are freed when the link count
    /// reaches zero.
    pub fn remove_file(&self, path: &str) -> Result<()> {
        let _guard = self.ops.lock();
        let parent = self.resolve_parent_inner(path)?;
        let entry = self
            .lookup_inner(parent.parent_inode, &parent.filename)?
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let file_inode = entry.inode;

        let mut file = self.alloc.read_inode(file_inode)?;
        if !file.is_regular_file() {
            return Err(FsError::IsDirectory);
        }

        self.remove_entry_inner(parent.parent_inode, &parent.filename)?;

        file.link_count = file.link_count.saturating_sub(1);
        if file.link_count == 0 {
            self.free_file_blocks(&mut file, 0)?;
            self.alloc.free_inode(file_inode)?;
        } else {
            self.alloc.write_inode(file_inode, &file)?;
        }

        debug!(target: "rsfs::dir", event = "unlink", path);
        self.alloc.sync()
    }

    /// Remove a path of either kind.
    pub fn remove(&self, path: &str) -> Result<()> {
        let is_dir = self.is_directory(path);
        if is_dir {
            self.rmdir(path)
        } else {
            self.remove_file(path)
        }
    }

    // ── File I/O ────────────────────────────────────────────────────────

    /// Read up to `length` bytes from `offset`; `length == 0` reads to EOF.
    /// Holes contribute zeros. Refreshes the access time.
    pub fn read_file(&self, path: &str, offset: u32, length: u32) -> Result<Vec<u8>> {
        let _guard = self.ops.lock();
        let inode_id = self.resolve_path_inner(path)?;
        self.read_file_inner(inode_id, offset, length)
    }

    pub fn read_file_by_inode(&self, inode_id: InodeId, offset: u32, length: u32) -> Result<Vec<u8>> {
        let _guard = self.ops.lock();
        self.read_file_inner(inode_id, offset, length)
    }

    fn read_file_inner(&self, inode_id: InodeId, offset: u32, length: u32) -> Result<Vec<u8>> {
        let mut inode = self.alloc.read_inode(inode_id)?;
        if !inode.is_regular_file() {
            return Err(FsError::IsDirectory);
        }

        if offset >= inode.size {
            return Ok(Vec::new());
        }
        let length = if length == 0 || offset.saturating_add(length) > inode.size {
            inode.size - offset
        } else {
            length
        };

        let mut data = vec![0u8; length as usize];
        let mut bytes_read = 0u32;
        let mut block_buf = [0u8; BLOCK_SIZE];

        while bytes_read < length {
            let pos = offset + bytes_read;
            let block_index = pos / BLOCK_SIZE as u32;
            let block_offset = (pos % BLOCK_SIZE as u32) as usize;
            let to_read =
                ((BLOCK_SIZE - block_offset) as u32).min(length - bytes_read) as usize;

            match file_block_at(self.io.as_ref(), &inode, block_index) {
                Ok(block) => {
                    self.io.read_block(block, &mut block_buf)?;
                    data[bytes_read as usize..bytes_read as usize + to_read]
                        .copy_from_slice(&block_buf[block_offset..block_offset + to_read]);
                }
                Err(FsError::NotFound(_)) => {
                    // Hole: the destination is already zeroed.
                }
                Err(err) => return Err(err),
            }
            bytes_read += to_read as u32;
        }

        inode.access_time = unix_now();
        self.alloc.write_inode(inode_id, &inode)?;
        Ok(data)
    }

    /// Write `data` at `offset`, allocating and COWing blocks as needed.
    ///
    /// A failure after at least one byte landed reports the partial count as
    /// success; a failure before any byte landed propagates the error.
    pub fn write_file(&self, path: &str, data: &[u8], offset: u32) -> Result<u32> {
        let _guard = self.ops.lock();
        let inode_id = self.resolve_path_inner(path)?;
        self.write_file_inner(inode_id, data, offset)
    }

    pub fn write_file_by_inode(&self, inode_id: InodeId, data: &[u8], offset: u32) -> Result<u32> {
        let _guard = self.ops.lock();
        self.write_file_inner(inode_id, data, offset)
    }

    fn write_file_inner(&self, inode_id: InodeId, data: &[u8], offset: u32) -> Result<u32> {
        if data.is_empty() {
            return Ok(0);
        }
        let mut inode = self.alloc.read_inode(inode_id)?;
        if !inode.is_regular_file() {
            return Err(FsError::IsDirectory);
        }

        let write_end = offset as u64 + data.len() as u64;
        if write_end > Inode::max_file_size() {
            return Err(FsError::FileTooLarge);
        }

        let mut bytes_written = 0u32;
        let mut block_buf = [0u8; BLOCK_SIZE];

        while (bytes_written as usize) < data.len() {
            let pos = offset + bytes_written;
            let block_index = pos / BLOCK_SIZE as u32;
            let block_offset = (pos % BLOCK_SIZE as u32) as usize;
            let to_write =
                (BLOCK_SIZE - block_offset).min(data.len() - bytes_written as usize);

            let step = (|| -> Result<()> {
                let mut block = self.get_or_alloc_file_block(&mut inode, inode_id, block_index)?;
                block = self.cow_data_block_if_needed(&mut inode, inode_id, block_index, block)?;

                if block_offset != 0 || to_write != BLOCK_SIZE {
                    // Partial block: read-modify-write; unreadable means fresh.
                    if self.io.read_block(block, &mut block_buf).is_err() {
                        block_buf.fill(0);
                    }
                } else {
                    block_buf.fill(0);
                }
                block_buf[block_offset..block_offset + to_write].copy_from_slice(
                    &data[bytes_written as usize..bytes_written as usize + to_write],
                );
                self.io.write_block(block, &block_buf)
            })();

            match step {
                Ok(()) => bytes_written += to_write as u32,
                Err(err) => {
                    if bytes_written > 0 {
                        break;
                    }
                    return Err(err);
                }
            }
        }

        // Re-read: the allocation helpers persisted pointer updates.
        let mut updated = self.alloc.read_inode(inode_id)?;
        let end = offset + bytes_written;
        if end > updated.size {
            updated.size = end;
        }
        touch_modify(&mut updated);
        self.alloc.write_inode(inode_id, &updated)?;
        Ok(bytes_written)
    }

    /// Shrinking frees every block with index ≥ ceil(new_size / 1024);
    /// extending only updates the size (later reads of the gap see zeros).
    pub fn truncate(&self, path: &str, new_size: u32) -> Result<()> {
        let _guard = self.ops.lock();
        let inode_id = self.resolve_path_inner(path)?;
        let mut inode = self.alloc.read_inode(inode_id)?;
        if !inode.is_regular_file() {
            return Err(FsError::IsDirectory);
        }

        if new_size < inode.size {
            let keep_blocks = (new_size as usize).div_ceil(BLOCK_SIZE) as u32;
            let old_blocks = (inode.size as usize).div_ceil(BLOCK_SIZE) as u32;
            if keep_blocks < old_blocks {
                self.free_file_blocks(&mut inode, keep_blocks)?;
            }
        }
        inode.size = new_size;
        touch_modify(&mut inode);
        self.alloc.write_inode(inode_id, &inode)
    }

    /// Write at the current end of file.
    pub fn append_file(&self, path: &str, data: &[u8]) -> Result<u32> {
        let _guard = self.ops.lock();
        let inode_id = self.resolve_path_inner(path)?;
        let size = self.alloc.read_inode(inode_id)?.size;
        self.write_file_inner(inode_id, data, size)
    }

    /// Flush the block endpoint and persist allocator state.
    pub fn sync(&self) -> Result<()> {
        self.io.flush()?;
        self.alloc.sync()
    }

    // ── Block mapping with COW ──────────────────────────────────────────

    /// Like `file_block_at`, but lazily allocates missing data and indirect
    /// blocks, COWing shared indirect blocks before writing through them.
    /// Persists inode pointer updates as it goes.
    fn get_or_alloc_file_block(
        &self,
        inode: &mut Inode,
        inode_id: InodeId,
        index: u32,
    ) -> Result<BlockNo> {
        if (index as usize) < NUM_DIRECT_BLOCKS {
            if !inode.direct_blocks[index as usize].is_valid() {
                let block = self.alloc.alloc_block()?;
                inode.direct_blocks[index as usize] = block;
                inode.block_count += 1;
                self.alloc.write_inode(inode_id, inode)?;
            }
            return Ok(inode.direct_blocks[index as usize]);
        }

        if index < SINGLE_LIMIT {
            if !inode.single_indirect.is_valid() {
                let indirect = alloc_indirect_block(self.io.as_ref(), &self.alloc)?;
                inode.single_indirect = indirect;
                inode.block_count += 1;
                self.alloc.write_inode(inode_id, inode)?;
            }
            let indirect = self.cow_indirect(inode, inode_id, IndirectSlot::Single)?;
            let slot = index - NUM_DIRECT_BLOCKS as u32;

            match read_indirect_slot(self.io.as_ref(), indirect, slot) {
                Ok(existing) => return Ok(existing),
                Err(FsError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }

            let block = self.alloc.alloc_block()?;
            if let Err(err) = write_indirect_slot(self.io.as_ref(), indirect, slot, block) {
                let _ = self.alloc.free_block(block);
                return Err(err);
            }
            inode.block_count += 1;
            self.alloc.write_inode(inode_id, inode)?;
            return Ok(block);
        }

        if index < DOUBLE_LIMIT {
            if !inode.double_indirect.is_valid() {
                let indirect = alloc_indirect_block(self.io.as_ref(), &self.alloc)?;
                inode.double_indirect = indirect;
                inode.block_count += 1;
                self.alloc.write_inode(inode_id, inode)?;
            }
            let dbl = self.cow_indirect(inode, inode_id, IndirectSlot::Double)?;

            let rel = index - SINGLE_LIMIT;
            let l1_idx = rel / PTRS_PER_BLOCK as u32;
            let l2_idx = rel % PTRS_PER_BLOCK as u32;

            let mut l1 = match read_indirect_slot(self.io.as_ref(), dbl, l1_idx) {
                Ok(existing) => existing,
                Err(FsError::NotFound(_)) => {
                    let fresh = alloc_indirect_block(self.io.as_ref(), &self.alloc)?;
                    if let Err(err) = write_indirect_slot(self.io.as_ref(), dbl, l1_idx, fresh) {
                        let _ = self.alloc.free_block(fresh);
                        return Err(err);
                    }
                    inode.block_count += 1;
                    self.alloc.write_inode(inode_id, inode)?;
                    fresh
                }
                Err(err) => return Err(err),
            };

            if let Some(cow) = self.cow_hook() {
                if cow.needs_cow(l1) {
                    let replacement = cow.perform_cow(l1)?;
                    if replacement != l1 {
                        write_indirect_slot(self.io.as_ref(), dbl, l1_idx, replacement)?;
                        l1 = replacement;
                    }
                }
            }

            match read_indirect_slot(self.io.as_ref(), l1, l2_idx) {
                Ok(existing) => return Ok(existing),
                Err(FsError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }

            let block = self.alloc.alloc_block()?;
            if let Err(err) = write_indirect_slot(self.io.as_ref(), l1, l2_idx, block) {
                let _ = self.alloc.free_block(block);
                return Err(err);
            }
            inode.block_count += 1;
            self.alloc.write_inode(inode_id, inode)?;
            return Ok(block);
        }

        Err(FsError::FileTooLarge)
    }

    /// COW the inode-level indirect pointer (single or double) if shared.
    fn cow_indirect(
        &self,
        inode: &mut Inode,
        inode_id: InodeId,
        which: IndirectSlot,
    ) -> Result<BlockNo> {
        let current = match which {
            IndirectSlot::Single => inode.single_indirect,
            IndirectSlot::Double => inode.double_indirect,
        };
        let Some(cow) = self.cow_hook() else {
            return Ok(current);
        };
        if !cow.needs_cow(current) {
            return Ok(current);
        }
        let replacement = cow.perform_cow(current)?;
        if replacement != current {
            match which {
                IndirectSlot::Single => inode.single_indirect = replacement,
                IndirectSlot::Double => inode.double_indirect = replacement,
            }
            self.alloc.write_inode(inode_id, inode)?;
        }
        Ok(replacement)
    }

    /// COW the data block at `index` if shared, updating the owning pointer
    /// chain (direct slot, or indirect blocks cascading innermost to inode).
    fn cow_data_block_if_needed(
        &self,
        inode: &mut Inode,
        inode_id: InodeId,
        index: u32,
        block: BlockNo,
    ) -> Result<BlockNo> {
        let Some(cow) = self.cow_hook() else {
            return Ok(block);
        };
        if !cow.needs_cow(block) {
            return Ok(block);
        }

        let new_block = cow.perform_cow(block)?;
        trace!(
            target: "rsfs::dir",
            event = "cow_data_block",
            index,
            old = block.0,
            new = new_block.0
        );
        self.update_file_block_pointer(inode, inode_id, index, new_block)?;
        Ok(new_block)
    }

    /// Redirect the pointer slot owning file block `index` to `new_block`,
    /// COWing shared indirect blocks along the chain.
    fn update_file_block_pointer(
        &self,
        inode: &mut Inode,
        inode_id: InodeId,
        index: u32,
        new_block: BlockNo,
    ) -> Result<()> {
        if (index as usize) < NUM_DIRECT_BLOCKS {
            inode.direct_blocks[index as usize] = new_block;
            return self.alloc.write_inode(inode_id, inode);
        }

        if index < SINGLE_LIMIT {
            if !inode.single_indirect.is_valid() {
                return Err(FsError::InvalidParam("unmapped single indirect".into()));
            }
            let indirect = self.cow_indirect(inode, inode_id, IndirectSlot::Single)?;
            return write_indirect_slot(
                self.io.as_ref(),
                indirect,
                index - NUM_DIRECT_BLOCKS as u32,
                new_block,
            );
        }

        if index < DOUBLE_LIMIT {
            if !inode.double_indirect.is_valid() {
                return Err(FsError::InvalidParam("unmapped double indirect".into()));
            }
            let dbl = self.cow_indirect(inode, inode_id, IndirectSlot::Double)?;

            let rel = index - SINGLE_LIMIT;
            let l1_idx = rel / PTRS_PER_BLOCK as u32;
            let l2_idx = rel % PTRS_PER_BLOCK as u32;

            let mut l1 = read_indirect_slot(self.io.as_ref(), dbl, l1_idx)?;
            if let Some(cow) = self.cow_hook() {
                if cow.needs_cow(l1) {
                    let replacement = cow.perform_cow(l1)?;
                    if replacement != l1 {
                        write_indirect_slot(self.io.as_ref(), dbl, l1_idx, replacement)?;
                        l1 = replacement;
                    }
                }
            }
            return write_indirect_slot(self.io.as_ref(), l1, l2_idx, new_block);
        }

        Err(FsError::FileTooLarge)
    }

    /// COW `block` if the snapshot layer reports it shared, so an in-place
    /// pointer edit cannot leak into a snapshot's view. Returns the block to
    /// edit.
    fn cow_for_edit(&self, block: BlockNo) -> Result<BlockNo> {
        let Some(cow) = self.cow_hook() else {
            return Ok(block);
        };
        if !cow.needs_cow(block) {
            return Ok(block);
        }
        cow.perform_cow(block)
    }

    /// Free every file block with index ≥ `from_block`, releasing indirect
    /// blocks whose whole index range falls past the cut. Partially-cut
    /// indirect blocks are COWed before being edited; the caller persists
    /// the inode.
    fn free_file_blocks(&self, inode: &mut Inode, from_block: u32) -> Result<()> {
        // Direct region.
        for i in (from_block as usize).min(NUM_DIRECT_BLOCKS)..NUM_DIRECT_BLOCKS {
            if inode.direct_blocks[i].is_valid() {
                self.alloc.free_block(inode.direct_blocks[i])?;
                inode.direct_blocks[i] = BlockNo::INVALID;
                inode.block_count = inode.block_count.saturating_sub(1);
            }
        }

        // Single-indirect region: file indices 12..268.
        if inode.single_indirect.is_valid() && from_block < SINGLE_LIMIT {
            let start_slot = from_block.saturating_sub(NUM_DIRECT_BLOCKS as u32);
            if start_slot == 0 {
                // Whole region cut; the indirect block itself goes too.
                for ptr in self.read_pointer_block(inode.single_indirect)? {
                    if ptr.is_valid() {
                        self.alloc.free_block(ptr)?;
                        inode.block_count = inode.block_count.saturating_sub(1);
                    }
                }
                self.alloc.free_block(inode.single_indirect)?;
                inode.single_indirect = BlockNo::INVALID;
                inode.block_count = inode.block_count.saturating_sub(1);
            } else {
                inode.single_indirect = self.cow_for_edit(inode.single_indirect)?;
                self.free_pointer_tail(inode.single_indirect, start_slot, inode)?;
            }
        }

        // Double-indirect region: file indices 268.. .
        if inode.double_indirect.is_valid() && from_block < DOUBLE_LIMIT {
            let start_rel = from_block.saturating_sub(SINGLE_LIMIT);
            if start_rel == 0 {
                for l1 in self.read_pointer_block(inode.double_indirect)? {
                    if !l1.is_valid() {
                        continue;
                    }
                    for ptr in self.read_pointer_block(l1)? {
                        if ptr.is_valid() {
                            self.alloc.free_block(ptr)?;
                            inode.block_count = inode.block_count.saturating_sub(1);
                        }
                    }
                    self.alloc.free_block(l1)?;
                    inode.block_count = inode.block_count.saturating_sub(1);
                }
                self.alloc.free_block(inode.double_indirect)?;
                inode.double_indirect = BlockNo::INVALID;
                inode.block_count = inode.block_count.saturating_sub(1);
            } else {
                inode.double_indirect = self.cow_for_edit(inode.double_indirect)?;
                let dbl = inode.double_indirect;
                let mut l1_buf = [0u8; BLOCK_SIZE];
                self.io.read_block(dbl, &mut l1_buf)?;
                let mut l1_changed = false;

                for l1_idx in 0..PTRS_PER_BLOCK as u32 {
                    let l1_off = l1_idx as usize * 4;
                    let l2_block = BlockNo(u32::from_le_bytes([
                        l1_buf[l1_off],
                        l1_buf[l1_off + 1],
                        l1_buf[l1_off + 2],
                        l1_buf[l1_off + 3],
                    ]));
                    if !l2_block.is_valid() {
                        continue;
                    }
                    let range_start = l1_idx * PTRS_PER_BLOCK as u32;
                    let range_end = range_start + PTRS_PER_BLOCK as u32;
                    if range_end <= start_rel {
                        continue; // entirely kept
                    }

                    let slot_start = start_rel.saturating_sub(range_start);
                    if slot_start == 0 {
                        for ptr in self.read_pointer_block(l2_block)? {
                            if ptr.is_valid() {
                                self.alloc.free_block(ptr)?;
                                inode.block_count = inode.block_count.saturating_sub(1);
                            }
                        }
                        self.alloc.free_block(l2_block)?;
                        l1_buf[l1_off..l1_off + 4]
                            .copy_from_slice(&BlockNo::INVALID.0.to_le_bytes());
                        inode.block_count = inode.block_count.saturating_sub(1);
                        l1_changed = true;
                    } else {
                        let edit_block = self.cow_for_edit(l2_block)?;
                        if edit_block != l2_block {
                            l1_buf[l1_off..l1_off + 4]
                                .copy_from_slice(&edit_block.0.to_le_bytes());
                            l1_changed = true;
                        }
                        self.free_pointer_tail(edit_block, slot_start, inode)?;
                    }
                }

                if l1_changed {
                    self.io.write_block(dbl, &l1_buf)?;
                }
            }
        }

        Ok(())
    }

    /// All 256 pointer slots of an indirect block (absent slots included).
    fn read_pointer_block(&self, block: BlockNo) -> Result<Vec<BlockNo>> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.io.read_block(block, &mut buf)?;
        Ok((0..PTRS_PER_BLOCK)
            .map(|slot| {
                let off = slot * 4;
                BlockNo(u32::from_le_bytes([
                    buf[off],
                    buf[off + 1],
                    buf[off + 2],
                    buf[off + 3],
                ]))
            })
            .collect())
    }

    /// Free every valid pointer at slot ≥ `start_slot` inside `indirect`,
    /// writing the cleared slots back.
    fn free_pointer_tail(
        &self,
        indirect: BlockNo,
        start_slot: u32,
        inode: &mut Inode,
    ) -> Result<()> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.io.read_block(indirect, &mut buf)?;
        let mut changed = false;
        for slot in start_slot..PTRS_PER_BLOCK as u32 {
            let off = slot as usize * 4;
            let ptr = BlockNo(u32::from_le_bytes([
                buf[off],
                buf[off + 1],
                buf[off + 2],
                buf[off + 3],
            ]));
            if ptr.is_valid() {
                self.alloc.free_block(ptr)?;
                buf[off..off + 4].copy_from_slice(&BlockNo::INVALID.0.to_le_bytes());
                inode.block_count = inode.block_count.saturating_sub(1);
                changed = true;
            }
        }
        if changed {
            self.io.write_block(indirect, &buf)?;
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum IndirectSlot {
    Single,
    Double,
}

fn touch_modify(inode: &mut Inode) {
    let now = unix_now();
    inode.modify_time = now;
    inode.access_time = now;
}

fn validate_filename(name: &str) -> Result<()> {
    if name.len() > MAX_FILENAME_LEN {
        return Err(FsError::NameTooLong);
    }
    if !is_valid_filename(name) {
        return Err(FsError::InvalidPath(name.to_string()));
    }
    Ok(())
}
