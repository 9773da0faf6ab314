#![forbid(unsafe_code)]
//! The rsfs `FileSystem` facade.
//!
//! Binds the disk image, block cache, allocator, directory engine, and
//! snapshot manager into one mount lifecycle, and exposes the path-level
//! operation surface consumed by outer layers. Every public operation
//! serializes under one facade mutex; `walk` and `remove_recursive` instead
//! register with the active-operation counter that `unmount` quiesces on.

use parking_lot::{Condvar, Mutex};
use rsfs_alloc::Allocator;
use rsfs_block::{check_image, format_image, BlockIo, CachedDisk, DiskImage, FormatOptions};
use rsfs_dir::{normalize_path, split_path, Directory};
use rsfs_error::{FsError, Result};
use rsfs_snapshot::{SnapshotInfo, SnapshotManager};
use rsfs_types::{unix_now, CacheStats, DirEntry, FileStat, FileType, BLOCK_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub use rsfs_block::FormatSummary;
pub use rsfs_error as error;
pub use rsfs_snapshot::SnapshotStats;
pub use rsfs_types as types;

/// Mount-time configuration.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FsConfig {
    pub cache_capacity: u32,
    pub enable_cache: bool,
    pub write_through: bool,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 64,
            enable_cache: true,
            write_through: false,
        }
    }
}

/// Capacity and usage overview returned by `get_info`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FsInfo {
    pub mounted: bool,
    pub mount_path: String,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_inodes: u32,
    pub free_blocks: u32,
    pub used_blocks: u32,
    pub free_inodes: u32,
    pub used_inodes: u32,
    pub total_size: u64,
    pub free_size: u64,
    pub used_size: u64,
    pub snapshot_count: u32,
    pub max_snapshots: u32,
    pub cache_stats: CacheStats,
}

struct Mounted {
    disk: Arc<DiskImage>,
    cached: Option<Arc<CachedDisk>>,
    alloc: Arc<Allocator>,
    dir: Arc<Directory>,
    snap: Arc<SnapshotManager>,
    path: PathBuf,
}

/// One mountable filesystem instance.
pub struct FileSystem {
    inner: Mutex<Option<Mounted>>,
    unmounting: AtomicBool,
    active_ops: Mutex<usize>,
    quiesced: Condvar,
}

impl Default for FileSystem {
    fn default() -> Self {
        Self::new()
    }
}

impl FileSystem {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(None),
            unmounting: AtomicBool::new(false),
            active_ops: Mutex::new(0),
            quiesced: Condvar::new(),
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Create a fresh image at `path`, unmounting first if needed.
    pub fn format(
        &self,
        path: impl AsRef<Path>,
        total_blocks: u32,
        total_inodes: u32,
    ) -> Result<()> {
        let mounted = self.inner.lock().is_some();
        if mounted {
            self.unmount()?;
        }
        format_image(
            path,
            &FormatOptions {
                total_blocks,
                total_inodes,
                force: true,
            },
        )?;
        Ok(())
    }

    /// True iff `path` holds a validating image.
    pub fn check(path: impl AsRef<Path>) -> bool {
        check_image(path)
    }

    /// Open the image and wire up the component stack. On error no partial
    /// state is exposed.
    pub fn mount(&self, path: impl AsRef<Path>, config: FsConfig) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.is_some() {
            return Err(FsError::AlreadyExists("filesystem already mounted".into()));
        }
        let path = path.as_ref().to_path_buf();

        let disk = Arc::new(DiskImage::open(&path)?);
        let cached = config.enable_cache.then(|| {
            let cached = Arc::new(CachedDisk::new(disk.clone(), config.cache_capacity));
            cached.set_write_through(config.write_through);
            cached
        });
        let io: Arc<dyn BlockIo> = match &cached {
            Some(cached) => cached.clone(),
            None => disk.clone(),
        };

        let alloc = Arc::new(Allocator::new(io.clone()));
        alloc.load()?;
        alloc.touch_mount_time(unix_now())?;

        let dir = Arc::new(Directory::new(alloc.clone(), io.clone()));
        let snap = Arc::new(SnapshotManager::new(alloc.clone(), io, cached.clone()));
        snap.load()?;
        snap.rebuild_block_refcounts()?;
        dir.set_cow(snap.clone());

        info!(target: "rsfs::fs", event = "mounted", path = %path.display());
        *inner = Some(Mounted {
            disk,
            cached,
            alloc,
            dir,
            snap,
            path,
        });
        Ok(())
    }

    /// Quiesce in-flight operations, sync every layer, and tear the stack
    /// down in reverse construction order.
    pub fn unmount(&self) -> Result<()> {
        {
            let inner = self.inner.lock();
            if inner.is_none() {
                return Ok(());
            }
        }

        self.unmounting.store(true, Ordering::Release);
        {
            let mut ops = self.active_ops.lock();
            while *ops != 0 {
                self.quiesced.wait(&mut ops);
            }
        }

        let mut inner = self.inner.lock();
        let Some(mounted) = inner.take() else {
            self.unmounting.store(false, Ordering::Release);
            return Ok(());
        };

        let mut first_err: Option<FsError> = None;
        let mut note = |result: Result<()>| {
            if let Err(err) = result {
                warn!(target: "rsfs::fs", event = "unmount_sync_error", error = %err);
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        };

        note(mounted.snap.sync());
        note(mounted.dir.sync());
        note(mounted.alloc.sync());
        if let Some(cached) = &mounted.cached {
            note(cached.flush());
        }
        note(mounted.disk.sync());

        let Mounted {
            disk,
            cached,
            alloc,
            dir,
            snap,
            path,
        } = mounted;
        drop(snap);
        drop(dir);
        drop(alloc);
        drop(cached);
        match Arc::try_unwrap(disk) {
            Ok(disk) => note(disk.close()),
            Err(disk) => note(disk.sync()),
        }

        info!(target: "rsfs::fs", event = "unmounted", path = %path.display());
        self.unmounting.store(false, Ordering::Release);
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Durability barrier across every layer.
    pub fn sync(&self) -> Result<()> {
        let inner = self.inner.lock();
        let mounted = Self::require(&inner)?;

        mounted.snap.sync()?;
        mounted.dir.sync()?;
        mounted.alloc.sync()?;
        if let Some(cached) = &mounted.cached {
            cached.flush()?;
        }
        mounted.disk.sync()
    }

    #[must_use]
    pub fn is_mounted(&self) -> bool {
        self.inner.lock().is_some()
    }

    #[must_use]
    pub fn get_info(&self) -> FsInfo {
        let inner = self.inner.lock();
        let Some(mounted) = inner.as_ref() else {
            return FsInfo::default();
        };

        let sb = mounted.alloc.superblock();
        FsInfo {
            mounted: true,
            mount_path: mounted.path.display().to_string(),
            block_size: sb.block_size,
            total_blocks: sb.total_blocks,
            total_inodes: sb.total_inodes,
            free_blocks: sb.free_blocks,
            used_blocks: sb.used_blocks,
            free_inodes: sb.free_inodes,
            used_inodes: sb.used_inodes,
            total_size: u64::from(sb.data_block_count) * BLOCK_SIZE as u64,
            free_size: u64::from(sb.free_blocks) * BLOCK_SIZE as u64,
            used_size: u64::from(sb.used_blocks) * BLOCK_SIZE as u64,
            snapshot_count: mounted.snap.snapshot_count(),
            max_snapshots: mounted.snap.max_snapshots(),
            cache_stats: mounted
                .cached
                .as_ref()
                .map(|c| c.cache_stats())
                .unwrap_or_default(),
        }
    }

    fn require<'a>(inner: &'a Option<Mounted>) -> Result<&'a Mounted> {
        inner
            .as_ref()
            .ok_or_else(|| FsError::InvalidParam("filesystem not mounted".into()))
    }

    // ── Directory operations ────────────────────────────────────────────

    pub fn mkdir(&self, path: &str) -> Result<()> {
        let inner = self.inner.lock();
        Self::require(&inner)?.dir.mkdir(&normalize_path(path))?;
        Ok(())
    }

    pub fn rmdir(&self, path: &str) -> Result<()> {
        let inner = self.inner.lock();
        Self::require(&inner)?.dir.rmdir(&normalize_path(path))
    }

    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let inner = self.inner.lock();
        Self::require(&inner)?.dir.list(&normalize_path(path))
    }

    /// Create every missing intermediate directory along `path`.
    pub fn mkdirp(&self, path: &str) -> Result<()> {
        let inner = self.inner.lock();
        let mounted = Self::require(&inner)?;

        let normalized = normalize_path(path);
        if normalized == "/" {
            return Ok(());
        }

        let mut current = String::new();
        for component in split_path(&normalized) {
            current.push('/');
            current.push_str(&component);
            if mounted.dir.exists(&current) {
                if !mounted.dir.is_directory(&current) {
                    return Err(FsError::NotDirectory);
                }
            } else {
                mounted.dir.mkdir(&current)?;
            }
        }
        Ok(())
    }

    // ── File operations ─────────────────────────────────────────────────

    pub fn create(&self, path: &str) -> Result<()> {
        let inner = self.inner.lock();
        Self::require(&inner)?.dir.create_file(&normalize_path(path))?;
        Ok(())
    }

    pub fn unlink(&self, path: &str) -> Result<()> {
        let inner = self.inner.lock();
        Self::require(&inner)?.dir.remove_file(&normalize_path(path))
    }

    pub fn remove(&self, path: &str) -> Result<()> {
        let inner = self.inner.lock();
        Self::require(&inner)?.dir.remove(&normalize_path(path))
    }

    pub fn read_file(&self, path: &str, offset: u32, length: u32) -> Result<Vec<u8>> {
        let inner = self.inner.lock();
        Self::require(&inner)?
            .dir
            .read_file(&normalize_path(path), offset, length)
    }

    pub fn read_file_as_string(&self, path: &str) -> Result<String> {
        let bytes = self.read_file(path, 0, 0)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn write_file(&self, path: &str, data: &[u8], offset: u32) -> Result<u32> {
        let inner = self.inner.lock();
        Self::require(&inner)?
            .dir
            .write_file(&normalize_path(path), data, offset)
    }

    pub fn append_file(&self, path: &str, data: &[u8]) -> Result<u32> {
        let inner = self.inner.lock();
        Self::require(&inner)?
            .dir
            .append_file(&normalize_path(path), data)
    }

    pub fn truncate(&self, path: &str, size: u32) -> Result<()> {
        let inner = self.inner.lock();
        Self::require(&inner)?
            .dir
            .truncate(&normalize_path(path), size)
    }

    /// Copy a regular file, creating the destination if absent.
    pub fn copy_file(&self, src: &str, dst: &str) -> Result<()> {
        let inner = self.inner.lock();
        let mounted = Self::require(&inner)?;

        let src = normalize_path(src);
        let dst = normalize_path(dst);
        let data = mounted.dir.read_file(&src, 0, 0)?;
        if !mounted.dir.exists(&dst) {
            mounted.dir.create_file(&dst)?;
        }
        mounted.dir.write_file(&dst, &data, 0)?;
        Ok(())
    }

    /// Copy then unlink the source.
    pub fn move_file(&self, src: &str, dst: &str) -> Result<()> {
        self.copy_file(src, dst)?;
        self.unlink(src)
    }

    // ── Metadata ────────────────────────────────────────────────────────

    pub fn stat(&self, path: &str) -> Result<FileStat> {
        let inner = self.inner.lock();
        Self::require(&inner)?.dir.stat(&normalize_path(path))
    }

    #[must_use]
    pub fn exists(&self, path: &str) -> bool {
        let inner = self.inner.lock();
        match inner.as_ref() {
            Some(mounted) => mounted.dir.exists(&normalize_path(path)),
            None => false,
        }
    }

    #[must_use]
    pub fn is_dir(&self, path: &str) -> bool {
        let inner = self.inner.lock();
        match inner.as_ref() {
            Some(mounted) => mounted.dir.is_directory(&normalize_path(path)),
            None => false,
        }
    }

    #[must_use]
    pub fn is_file(&self, path: &str) -> bool {
        let inner = self.inner.lock();
        match inner.as_ref() {
            Some(mounted) => mounted.dir.is_file(&normalize_path(path)),
            None => false,
        }
    }

    pub fn get_file_size(&self, path: &str) -> Result<u32> {
        Ok(self.stat(path)?.size)
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    /// Snapshot the current tree under `name`, syncing beforehand so the
    /// clone sees a settled image.
    pub fn create_snapshot(&self, name: &str) -> Result<()> {
        let inner = self.inner.lock();
        let mounted = Self::require(&inner)?;

        mounted.dir.sync()?;
        mounted.alloc.sync()?;
        if let Some(cached) = &mounted.cached {
            cached.flush()?;
        }

        mounted.snap.create_snapshot(name)?;

        if mounted.alloc.check_consistency(false).is_err() {
            return mounted.snap.rebuild_block_refcounts();
        }
        Ok(())
    }

    /// Roll the live tree back to `name`, then resynchronize the allocator
    /// and refcount table.
    pub fn restore_snapshot(&self, name: &str) -> Result<()> {
        let inner = self.inner.lock();
        let mounted = Self::require(&inner)?;

        mounted.snap.restore_snapshot(name)?;
        mounted.alloc.reload()?;
        mounted.snap.rebuild_block_refcounts()
    }

    pub fn delete_snapshot(&self, name: &str) -> Result<()> {
        let inner = self.inner.lock();
        let mounted = Self::require(&inner)?;

        mounted.snap.delete_snapshot(name)?;

        if mounted.alloc.check_consistency(false).is_err() {
            return mounted.snap.rebuild_block_refcounts();
        }
        Ok(())
    }

    #[must_use]
    pub fn list_snapshots(&self) -> Vec<SnapshotInfo> {
        let inner = self.inner.lock();
        match inner.as_ref() {
            Some(mounted) => mounted.snap.list_snapshots(),
            None => Vec::new(),
        }
    }

    #[must_use]
    pub fn snapshot_exists(&self, name: &str) -> bool {
        let inner = self.inner.lock();
        match inner.as_ref() {
            Some(mounted) => mounted.snap.snapshot_exists(name),
            None => false,
        }
    }

    // ── Cache administration ────────────────────────────────────────────

    #[must_use]
    pub fn get_cache_stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        inner
            .as_ref()
            .and_then(|m| m.cached.as_ref())
            .map(|c| c.cache_stats())
            .unwrap_or_default()
    }

    pub fn reset_cache_stats(&self) {
        let inner = self.inner.lock();
        if let Some(cached) = inner.as_ref().and_then(|m| m.cached.as_ref()) {
            cached.reset_cache_stats();
        }
    }

    pub fn clear_cache(&self) -> Result<()> {
        let inner = self.inner.lock();
        let mounted = Self::require(&inner)?;
        match &mounted.cached {
            Some(cached) => cached.clear_cache(),
            None => Ok(()),
        }
    }

    pub fn set_cache_capacity(&self, capacity: u32) -> Result<()> {
        let inner = self.inner.lock();
        if let Some(cached) = inner.as_ref().and_then(|m| m.cached.as_ref()) {
            cached.set_cache_capacity(capacity)?;
        }
        Ok(())
    }

    pub fn set_cache_enabled(&self, enabled: bool) {
        let inner = self.inner.lock();
        if let Some(cached) = inner.as_ref().and_then(|m| m.cached.as_ref()) {
            cached.set_cache_enabled(enabled);
        }
    }

    // ── Traversal utilities ─────────────────────────────────────────────

    /// Depth-first walk from `path`. The callback sees each path and its
    /// stat; returning `false` prunes that subtree. Runs under the
    /// active-operation guard rather than the facade mutex so the callback
    /// can take its time.
    pub fn walk<F>(&self, path: &str, callback: &mut F) -> Result<()>
    where
        F: FnMut(&str, &FileStat) -> bool,
    {
        let (dir, _guard) = self.begin_op()?;
        self.walk_inner(&dir, &normalize_path(path), callback)
    }

    fn walk_inner<F>(&self, dir: &Arc<Directory>, path: &str, callback: &mut F) -> Result<()>
    where
        F: FnMut(&str, &FileStat) -> bool,
    {
        let st = dir.stat(path)?;
        if !callback(path, &st) {
            return Ok(());
        }

        if st.file_type == FileType::Directory {
            let mut children = Vec::new();
            for entry in dir.list(path)? {
                let name = entry.name();
                if name == "." || name == ".." {
                    continue;
                }
                children.push(if path == "/" {
                    format!("/{name}")
                } else {
                    format!("{path}/{name}")
                });
            }
            for child in children {
                self.walk_inner(dir, &child, callback)?;
            }
        }
        Ok(())
    }

    /// Remove a file, or a directory tree bottom-up. The root is refused.
    pub fn remove_recursive(&self, path: &str) -> Result<()> {
        let (dir, _guard) = self.begin_op()?;
        Self::remove_recursive_inner(&dir, &normalize_path(path))
    }

    fn remove_recursive_inner(dir: &Arc<Directory>, path: &str) -> Result<()> {
        if path == "/" {
            return Err(FsError::PermissionDenied);
        }
        if !dir.is_directory(path) {
            return dir.remove_file(path);
        }

        for entry in dir.list(path)? {
            let name = entry.name();
            if name == "." || name == ".." {
                continue;
            }
            let child = format!("{path}/{name}");
            Self::remove_recursive_inner(dir, &child)?;
        }
        dir.rmdir(path)
    }

    /// Total bytes held by regular files under `path`.
    pub fn get_dir_size(&self, path: &str) -> Result<u64> {
        let mut total = 0u64;
        self.walk(path, &mut |_path, st| {
            if st.file_type == FileType::Regular {
                total += u64::from(st.size);
            }
            true
        })?;
        Ok(total)
    }

    /// Allocator self-check plus reachability reconciliation against the
    /// live tree and every snapshot.
    pub fn check_consistency(&self, fix: bool) -> Result<()> {
        let inner = self.inner.lock();
        let mounted = Self::require(&inner)?;

        let mut has_error = mounted.alloc.check_consistency(fix).is_err();

        let mut used_inodes = HashSet::new();
        let mut used_blocks = HashSet::new();
        mounted.snap.collect_usage(&mut used_inodes, &mut used_blocks)?;
        if mounted
            .alloc
            .reconcile_usage(&used_inodes, &used_blocks, fix)
            .is_err()
        {
            has_error = true;
        }

        if has_error {
            Err(FsError::Internal("filesystem state inconsistent".into()))
        } else {
            Ok(())
        }
    }

    // ── Quiesce support ─────────────────────────────────────────────────

    fn begin_op(&self) -> Result<(Arc<Directory>, OpGuard<'_>)> {
        let inner = self.inner.lock();
        let mounted = Self::require(&inner)?;
        if self.unmounting.load(Ordering::Acquire) {
            return Err(FsError::InvalidParam("filesystem is unmounting".into()));
        }
        let dir = mounted.dir.clone();
        drop(inner);

        *self.active_ops.lock() += 1;
        Ok((dir, OpGuard { fs: self }))
    }

    fn end_op(&self) {
        let mut ops = self.active_ops.lock();
        *ops -= 1;
        if *ops == 0 {
            self.quiesced.notify_all();
        }
        debug!(target: "rsfs::fs", event = "op_done", active = *ops);
    }
}

struct OpGuard<'a> {
    fs: &'a FileSystem,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.fs.end_op();
    }
}

impl Drop for FileSystem {
    fn drop(&mut self) {
        let mounted = self.inner.lock().is_some();
        if mounted {
            let _ = self.unmount();
        }
    }
}
