//! Image formatting.
//!
//! Lays down the superblock, both bitmaps, the inode table, and a root
//! directory whose first data block holds `.` and `..`.

use crate::DiskImage;
use rsfs_error::{FsError, Result};
use rsfs_types::{
    bitmap_set, unix_now, BlockNo, DirEntry, FileType, Inode, InodeId, Superblock, BLOCK_SIZE,
    DIRENTRIES_PER_BLOCK, DIRENTRY_SIZE, INODE_SIZE, MIN_TOTAL_BLOCKS, MIN_TOTAL_INODES,
};
use std::path::Path;
use tracing::debug;

/// Parameters for `format_image`.
#[derive(Debug, Clone, Copy)]
pub struct FormatOptions {
    pub total_blocks: u32,
    pub total_inodes: u32,
    /// Overwrite an existing image instead of failing.
    pub force: bool,
}

impl Default for FormatOptions {
    fn default() -> Self {
        Self {
            total_blocks: 16384,
            total_inodes: 1024,
            force: false,
        }
    }
}

/// Layout summary returned by a successful format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatSummary {
    pub total_blocks: u32,
    pub total_inodes: u32,
    pub data_block_start: BlockNo,
    /// Data blocks available after the root directory block.
    pub free_data_blocks: u32,
}

/// Create and initialize a fresh filesystem image at `path`.
pub fn format_image(path: impl AsRef<Path>, options: &FormatOptions) -> Result<FormatSummary> {
    let path = path.as_ref();

    if options.total_blocks < MIN_TOTAL_BLOCKS {
        return Err(FsError::InvalidParam(format!(
            "total_blocks must be at least {MIN_TOTAL_BLOCKS}"
        )));
    }
    if options.total_inodes < MIN_TOTAL_INODES {
        return Err(FsError::InvalidParam(format!(
            "total_inodes must be at least {MIN_TOTAL_INODES}"
        )));
    }
    if !options.force && path.exists() {
        return Err(FsError::AlreadyExists(path.display().to_string()));
    }

    let disk = DiskImage::create(path, options.total_blocks)?;
    let now = unix_now();

    let mut sb = Superblock::new(options.total_blocks, options.total_inodes);
    sb.create_time = now;
    sb.mount_time = now;
    sb.write_time = now;

    // Inode bitmap: inode 0 (root) allocated.
    let mut inode_bitmap = vec![0u8; sb.inode_bitmap_blocks as usize * BLOCK_SIZE];
    bitmap_set(&mut inode_bitmap, InodeId::ROOT.0);
    disk.write_blocks(sb.inode_bitmap_start, sb.inode_bitmap_blocks, &inode_bitmap)?;

    // Block bitmap: data block 0 (root directory contents) allocated.
    let mut block_bitmap = vec![0u8; sb.block_bitmap_blocks as usize * BLOCK_SIZE];
    bitmap_set(&mut block_bitmap, 0);
    disk.write_blocks(sb.block_bitmap_start, sb.block_bitmap_blocks, &block_bitmap)?;

    // Root inode in the first inode-table block.
    let mut root = Inode::new(FileType::Directory);
    root.size = 2 * DIRENTRY_SIZE as u32;
    root.link_count = 2;
    root.block_count = 1;
    root.direct_blocks[0] = sb.data_block_start;
    root.create_time = now;
    root.modify_time = now;
    root.access_time = now;

    let mut table_block = [0u8; BLOCK_SIZE];
    root.encode_into(&mut table_block[..INODE_SIZE]);
    disk.write_block(sb.inode_table_start, &table_block)?;

    // Root directory contents: `.` and `..` both point at the root.
    let mut dir_block = [0u8; BLOCK_SIZE];
    let dot = DirEntry::new(InodeId::ROOT, ".", FileType::Directory);
    let dotdot = DirEntry::new(InodeId::ROOT, "..", FileType::Directory);
    dot.encode_into(&mut dir_block[..DIRENTRY_SIZE]);
    dotdot.encode_into(&mut dir_block[DIRENTRY_SIZE..2 * DIRENTRY_SIZE]);
    for slot in 2..DIRENTRIES_PER_BLOCK {
        let off = slot * DIRENTRY_SIZE;
        DirEntry::invalid().encode_into(&mut dir_block[off..off + DIRENTRY_SIZE]);
    }
    disk.write_block(sb.data_block_start, &dir_block)?;

    // Final counters: one inode and one data block in use.
    sb.used_inodes = 1;
    sb.free_inodes = options.total_inodes - 1;
    sb.used_blocks = 1;
    sb.free_blocks = sb.data_block_count - 1;
    disk.save_superblock(&sb)?;
    disk.sync()?;

    debug!(
        target: "rsfs::block",
        event = "formatted",
        path = %path.display(),
        total_blocks = options.total_blocks,
        total_inodes = options.total_inodes,
        data_block_start = sb.data_block_start.0
    );

    let summary = FormatSummary {
        total_blocks: options.total_blocks,
        total_inodes: options.total_inodes,
        data_block_start: sb.data_block_start,
        free_data_blocks: sb.free_blocks,
    };
    disk.close()?;
    Ok(summary)
}

/// True iff `path` holds an image whose magic and version validate.
#[must_use]
pub fn check_image(path: impl AsRef<Path>) -> bool {
    let Ok(disk) = DiskImage::open(path) else {
        return false;
    };
    disk.load_superblock().map(|sb| sb.validate()).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsfs_types::bitmap_get;
    use tempfile::TempDir;

    #[test]
    fn format_layout_and_counters() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("fs.img");

        let summary = format_image(
            &path,
            &FormatOptions {
                total_blocks: 2048,
                total_inodes: 128,
                force: false,
            },
        )
        .expect("format");

        let disk = DiskImage::open(&path).expect("open");
        let sb = disk.load_superblock().expect("superblock");

        assert_eq!(sb.total_blocks, 2048);
        assert_eq!(sb.total_inodes, 128);
        assert_eq!(sb.used_inodes, 1);
        assert_eq!(sb.free_inodes, 127);
        assert_eq!(sb.used_blocks, 1);
        assert_eq!(sb.free_blocks, sb.data_block_count - 1);
        assert_eq!(sb.root_inode, InodeId::ROOT);
        assert_eq!(summary.free_data_blocks, sb.free_blocks);
        assert_eq!(summary.data_block_start, sb.data_block_start);
    }

    #[test]
    fn format_seeds_root_directory() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("fs.img");
        format_image(
            &path,
            &FormatOptions {
                total_blocks: 512,
                total_inodes: 64,
                force: false,
            },
        )
        .expect("format");

        let disk = DiskImage::open(&path).expect("open");
        let sb = disk.load_superblock().expect("superblock");

        // Root inode.
        let mut table = [0u8; BLOCK_SIZE];
        disk.read_block(sb.inode_table_start, &mut table).expect("read table");
        let root = Inode::decode(&table[..INODE_SIZE]).expect("decode inode");
        assert!(root.is_directory());
        assert_eq!(root.link_count, 2);
        assert_eq!(root.size, 128);
        assert_eq!(root.block_count, 1);
        assert_eq!(root.direct_blocks[0], sb.data_block_start);

        // Root directory entries.
        let mut data = [0u8; BLOCK_SIZE];
        disk.read_block(sb.data_block_start, &mut data).expect("read dir");
        let dot = DirEntry::decode(&data[..DIRENTRY_SIZE]).expect("dot");
        let dotdot = DirEntry::decode(&data[DIRENTRY_SIZE..2 * DIRENTRY_SIZE]).expect("dotdot");
        assert_eq!(dot.name(), ".");
        assert_eq!(dot.inode, InodeId::ROOT);
        assert_eq!(dotdot.name(), "..");
        assert_eq!(dotdot.inode, InodeId::ROOT);
        let third = DirEntry::decode(&data[2 * DIRENTRY_SIZE..3 * DIRENTRY_SIZE]).expect("slot");
        assert!(!third.is_valid());

        // Bitmaps mark exactly the root's resources.
        let mut inode_bm = [0u8; BLOCK_SIZE];
        disk.read_block(sb.inode_bitmap_start, &mut inode_bm).expect("read bm");
        assert!(bitmap_get(&inode_bm, 0));
        assert!(!bitmap_get(&inode_bm, 1));
    }

    #[test]
    fn format_rejects_tiny_geometry() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("fs.img");
        assert!(format_image(
            &path,
            &FormatOptions {
                total_blocks: 99,
                total_inodes: 64,
                force: false,
            }
        )
        .is_err());
        assert!(format_image(
            &path,
            &FormatOptions {
                total_blocks: 512,
                total_inodes: 15,
                force: false,
            }
        )
        .is_err());
    }

    #[test]
    fn format_refuses_overwrite_without_force() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("fs.img");
        let opts = FormatOptions {
            total_blocks: 512,
            total_inodes: 64,
            force: false,
        };
        format_image(&path, &opts).expect("first format");
        assert!(matches!(
            format_image(&path, &opts),
            Err(FsError::AlreadyExists(_))
        ));

        let forced = FormatOptions { force: true, ..opts };
        format_image(&path, &forced).expect("forced format");
    }

    #[test]
    fn check_image_validates_magic() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("fs.img");
        assert!(!check_image(&path));

        format_image(
            &path,
            &FormatOptions {
                total_blocks: 512,
                total_inodes: 64,
                force: false,
            },
        )
        .expect("format");
        assert!(check_image(&path));
    }
}
