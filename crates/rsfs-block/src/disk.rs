//! File-backed block device.
//!
//! The only component that touches the OS file. Uses positional I/O
//! (`FileExt`), serialized under one mutex; statistics live under a second
//! mutex so probes never contend with I/O.

use crate::BlockIo;
use parking_lot::Mutex;
use rsfs_error::{FsError, Result};
use rsfs_types::{BlockNo, Superblock, BLOCK_SIZE};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Raw device I/O counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStats {
    pub reads: u64,
    pub writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Fixed-size block-addressed storage over a single image file.
#[derive(Debug)]
pub struct DiskImage {
    file: File,
    path: PathBuf,
    total_blocks: u32,
    io_mutex: Mutex<()>,
    stats: Mutex<IoStats>,
}

impl DiskImage {
    /// Create a new image of `total_blocks` blocks, zero-filling the whole
    /// file before returning. An existing file at `path` is truncated.
    pub fn create(path: impl AsRef<Path>, total_blocks: u32) -> Result<Self> {
        if total_blocks == 0 {
            return Err(FsError::InvalidParam("total_blocks must be > 0".into()));
        }
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let zero = [0u8; BLOCK_SIZE];
        for block in 0..total_blocks {
            file.write_all_at(&zero, u64::from(block) * BLOCK_SIZE as u64)?;
        }
        file.sync_all()?;

        debug!(
            target: "rsfs::block",
            event = "image_created",
            path = %path.display(),
            total_blocks
        );
        Ok(Self {
            file,
            path,
            total_blocks,
            io_mutex: Mutex::new(()),
            stats: Mutex::new(IoStats::default()),
        })
    }

    /// Open an existing image, validating its superblock to learn the block
    /// count.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if !path.exists() {
            return Err(FsError::NotFound(path.display().to_string()));
        }
        let file = OpenOptions::new().read(true).write(true).open(&path)?;

        let len = file.metadata()?.len();
        if len < BLOCK_SIZE as u64 {
            return Err(FsError::InvalidParam(format!(
                "image too small: {len} bytes"
            )));
        }

        let mut block0 = [0u8; BLOCK_SIZE];
        file.read_exact_at(&mut block0, 0)?;
        let sb = Superblock::decode(&block0)
            .map_err(|e| FsError::InvalidParam(format!("bad superblock: {e}")))?;
        if !sb.validate() {
            return Err(FsError::InvalidParam("superblock failed validation".into()));
        }

        debug!(
            target: "rsfs::block",
            event = "image_opened",
            path = %path.display(),
            total_blocks = sb.total_blocks
        );
        Ok(Self {
            file,
            path,
            total_blocks: sb.total_blocks,
            io_mutex: Mutex::new(()),
            stats: Mutex::new(IoStats::default()),
        })
    }

    /// Sync and release the image.
    pub fn close(self) -> Result<()> {
        self.file.sync_all()?;
        debug!(target: "rsfs::block", event = "image_closed", path = %self.path.display());
        Ok(())
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn total_blocks(&self) -> u32 {
        self.total_blocks
    }

    fn check_block(&self, block: BlockNo) -> Result<()> {
        if block.0 >= self.total_blocks {
            return Err(FsError::InvalidParam(format!(
                "block {block} out of range (total {})",
                self.total_blocks
            )));
        }
        Ok(())
    }

    /// Read one block into `buf`.
    pub fn read_block(&self, block: BlockNo, buf: &mut [u8]) -> Result<()> {
        if buf.len() != BLOCK_SIZE {
            return Err(FsError::InvalidParam(format!(
                "read buffer is {} bytes, want {BLOCK_SIZE}",
                buf.len()
            )));
        }
        self.check_block(block)?;

        let _guard = self.io_mutex.lock();
        self.file.read_exact_at(buf, block.byte_offset())?;
        let mut stats = self.stats.lock();
        stats.reads += 1;
        stats.bytes_read += BLOCK_SIZE as u64;
        Ok(())
    }

    /// Write one block from `data`.
    pub fn write_block(&self, block: BlockNo, data: &[u8]) -> Result<()> {
        if data.len() != BLOCK_SIZE {
            return Err(FsError::InvalidParam(format!(
                "write buffer is {} bytes, want {BLOCK_SIZE}",
                data.len()
            )));
        }
        self.check_block(block)?;

        let _guard = self.io_mutex.lock();
        self.file.write_all_at(data, block.byte_offset())?;
        let mut stats = self.stats.lock();
        stats.writes += 1;
        stats.bytes_written += BLOCK_SIZE as u64;
        Ok(())
    }

    /// Read `count` consecutive blocks into `buf`.
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

    /// Write `count` consecutive blocks from `buf`.
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

    /// Overwrite one block with zeros.
    pub fn zero_block(&self, block: BlockNo) -> Result<()> {
        trace!(target: "rsfs::block", event = "zero_block", block = block.0);
        self.write_block(block, &[0u8; BLOCK_SIZE])
    }

    /// Overwrite a block range with zeros.
    pub fn zero_blocks(&self, start: BlockNo, count: u32) -> Result<()> {
        for i in 0..count {
            self.zero_block(BlockNo(start.0 + i))?;
        }
        Ok(())
    }

    /// Push everything to stable storage.
    pub fn sync(&self) -> Result<()> {
        let _guard = self.io_mutex.lock();
        self.file.sync_all()?;
        Ok(())
    }

    /// Read and validate block 0.
    pub fn load_superblock(&self) -> Result<Superblock> {
        let mut buf = [0u8; BLOCK_SIZE];
        self.read_block(BlockNo(0), &mut buf)?;
        let sb = Superblock::decode(&buf)
            .map_err(|e| FsError::InvalidParam(format!("bad superblock: {e}")))?;
        if !sb.validate() {
            return Err(FsError::InvalidParam("superblock failed validation".into()));
        }
        Ok(sb)
    }

    /// Validate and write block 0.
    pub fn save_superblock(&self, sb: &Superblock) -> Result<()> {
        if !sb.validate() {
            return Err(FsError::InvalidParam("refusing to save invalid superblock".into()));
        }
        self.write_block(BlockNo(0), &sb.encode())
    }

    #[must_use]
    pub fn io_stats(&self) -> IoStats {
        *self.stats.lock()
    }

    pub fn reset_io_stats(&self) {
        *self.stats.lock() = IoStats::default();
    }
}

impl BlockIo for DiskImage {
    fn read_block(&self, block: BlockNo, buf: &mut [u8]) -> Result<()> {
        Self::read_block(self, block, buf)
    }

    fn write_block(&self, block: BlockNo, data: &[u8]) -> Result<()> {
        Self::write_block(self, block, data)
    }

    fn block_count(&self) -> u32 {
        self.total_blocks
    }

    fn flush(&self) -> Result<()> {
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn image_path(dir: &TempDir) -> std::path::PathBuf {
        dir.path().join("disk.img")
    }

    #[test]
    fn create_zero_fills() {
        let dir = TempDir::new().expect("tempdir");
        let disk = DiskImage::create(image_path(&dir), 128).expect("create");

        let mut buf = [0xAAu8; BLOCK_SIZE];
        disk.read_block(BlockNo(127), &mut buf).expect("read");
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(disk.total_blocks(), 128);
    }

    #[test]
    fn block_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let disk = DiskImage::create(image_path(&dir), 128).expect("create");

        let data: Vec<u8> = (0..BLOCK_SIZE).map(|i| (i % 251) as u8).collect();
        disk.write_block(BlockNo(5), &data).expect("write");

        let mut out = [0u8; BLOCK_SIZE];
        disk.read_block(BlockNo(5), &mut out).expect("read");
        assert_eq!(&out[..], &data[..]);
    }

    #[test]
    fn out_of_range_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let disk = DiskImage::create(image_path(&dir), 128).expect("create");

        let mut buf = [0u8; BLOCK_SIZE];
        assert!(matches!(
            disk.read_block(BlockNo(128), &mut buf),
            Err(FsError::InvalidParam(_))
        ));
        assert!(matches!(
            disk.write_block(BlockNo(200), &buf),
            Err(FsError::InvalidParam(_))
        ));
    }

    #[test]
    fn short_buffer_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let disk = DiskImage::create(image_path(&dir), 128).expect("create");
        let mut small = [0u8; 10];
        assert!(disk.read_block(BlockNo(0), &mut small).is_err());
        assert!(disk.write_block(BlockNo(0), &small).is_err());
    }

    #[test]
    fn range_round_trip() {
        let dir = TempDir::new().expect("tempdir");
        let disk = DiskImage::create(image_path(&dir), 128).expect("create");

        let data: Vec<u8> = (0..3 * BLOCK_SIZE).map(|i| (i % 256) as u8).collect();
        disk.write_blocks(BlockNo(10), 3, &data).expect("write");

        let mut out = vec![0u8; 3 * BLOCK_SIZE];
        disk.read_blocks(BlockNo(10), 3, &mut out).expect("read");
        assert_eq!(out, data);
    }

    #[test]
    fn zero_block_clears() {
        let dir = TempDir::new().expect("tempdir");
        let disk = DiskImage::create(image_path(&dir), 128).expect("create");

        disk.write_block(BlockNo(3), &[0xFFu8; BLOCK_SIZE]).expect("write");
        disk.zero_block(BlockNo(3)).expect("zero");

        let mut out = [0xAAu8; BLOCK_SIZE];
        disk.read_block(BlockNo(3), &mut out).expect("read");
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn superblock_save_load() {
        let dir = TempDir::new().expect("tempdir");
        let disk = DiskImage::create(image_path(&dir), 256).expect("create");

        let mut sb = Superblock::new(256, 64);
        sb.create_time = 1_700_000_000;
        disk.save_superblock(&sb).expect("save");

        let loaded = disk.load_superblock().expect("load");
        assert_eq!(loaded, sb);
    }

    #[test]
    fn open_rejects_garbage() {
        let dir = TempDir::new().expect("tempdir");
        let path = image_path(&dir);
        {
            let disk = DiskImage::create(&path, 128).expect("create");
            // No superblock written; block 0 is all zeros.
            drop(disk);
        }
        assert!(DiskImage::open(&path).is_err());
    }

    #[test]
    fn open_missing_is_not_found() {
        let dir = TempDir::new().expect("tempdir");
        assert!(matches!(
            DiskImage::open(dir.path().join("nope.img")),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn io_stats_track_operations() {
        let dir = TempDir::new().expect("tempdir");
        let disk = DiskImage::create(image_path(&dir), 128).expect("create");
        disk.reset_io_stats();

        let mut buf = [0u8; BLOCK_SIZE];
        disk.read_block(BlockNo(0), &mut buf).expect("read");
        disk.write_block(BlockNo(1), &buf).expect("write");
        disk.write_block(BlockNo(2), &buf).expect("write");

        let stats = disk.io_stats();
        assert_eq!(stats.reads, 1);
        assert_eq!(stats.writes, 2);
        assert_eq!(stats.bytes_read, BLOCK_SIZE as u64);
        assert_eq!(stats.bytes_written, 2 * BLOCK_SIZE as u64);
    }
}
