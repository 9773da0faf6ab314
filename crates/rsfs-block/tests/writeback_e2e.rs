//! Write-back durability visibility: dirty pages live only in the cache
//! until an explicit flush pushes them to the image.

use rsfs_block::{format_image, CachedDisk, DiskImage, FormatOptions};
use rsfs_types::{BlockNo, BLOCK_SIZE};
use std::sync::Arc;
use tempfile::TempDir;

fn formatted_image(dir: &TempDir) -> std::path::PathBuf {
    let path = dir.path().join("wb.img");
    format_image(
        &path,
        &FormatOptions {
            total_blocks: 512,
            total_inodes: 64,
            force: false,
        },
    )
    .expect("format");
    path
}

#[test]
fn write_back_is_invisible_until_flush() {
    let dir = TempDir::new().expect("tempdir");
    let path = formatted_image(&dir);

    let cached = CachedDisk::new(Arc::new(DiskImage::open(&path).expect("open")), 16);
    let observer = DiskImage::open(&path).expect("open observer");

    let block = BlockNo(100);
    let data = vec![0xC3u8; BLOCK_SIZE];
    cached.write_block(block, &data).expect("write");

    // A second handle on the same image still sees the old (zero) content.
    let mut raw = vec![0xFFu8; BLOCK_SIZE];
    observer.read_block(block, &mut raw).expect("read");
    assert!(raw.iter().all(|&b| b == 0));

    cached.flush().expect("flush");
    observer.read_block(block, &mut raw).expect("read");
    assert_eq!(raw, data);
}

#[test]
fn flush_leaves_no_dirty_entries() {
    let dir = TempDir::new().expect("tempdir");
    let path = formatted_image(&dir);
    let cached = CachedDisk::new(Arc::new(DiskImage::open(&path).expect("open")), 16);

    for i in 0..8 {
        cached
            .write_block(BlockNo(200 + i), &vec![i as u8; BLOCK_SIZE])
            .expect("write");
    }
    assert!(!cached.cache().dirty_blocks().is_empty());

    cached.flush().expect("flush");
    assert!(cached.cache().dirty_blocks().is_empty());

    // Disk content equals cache content for every written block.
    for i in 0..8 {
        let mut raw = vec![0u8; BLOCK_SIZE];
        cached
            .disk()
            .read_block(BlockNo(200 + i), &mut raw)
            .expect("read");
        assert!(raw.iter().all(|&b| b == i as u8));
    }
}

#[test]
fn capacity_pressure_drops_unflushed_pages() {
    let dir = TempDir::new().expect("tempdir");
    let path = formatted_image(&dir);
    // Two-block cache: the third dirty write evicts the first, silently
    // discarding its unflushed content.
    let cached = CachedDisk::new(Arc::new(DiskImage::open(&path).expect("open")), 2);

    cached
        .write_block(BlockNo(300), &vec![1u8; BLOCK_SIZE])
        .expect("write");
    cached
        .write_block(BlockNo(301), &vec![2u8; BLOCK_SIZE])
        .expect("write");
    cached
        .write_block(BlockNo(302), &vec![3u8; BLOCK_SIZE])
        .expect("write");

    cached.flush().expect("flush");

    let mut raw = vec![0u8; BLOCK_SIZE];
    // Block 300 was evicted before the flush; its write never reached disk.
    cached.disk().read_block(BlockNo(300), &mut raw).expect("read");
    assert!(raw.iter().all(|&b| b == 0));
    // The survivors landed.
    cached.disk().read_block(BlockNo(301), &mut raw).expect("read");
    assert!(raw.iter().all(|&b| b == 2));
    cached.disk().read_block(BlockNo(302), &mut raw).expect("read");
    assert!(raw.iter().all(|&b| b == 3));
}

#[test]
fn write_through_mode_needs_no_flush() {
    let dir = TempDir::new().expect("tempdir");
    let path = formatted_image(&dir);
    let cached = CachedDisk::new(Arc::new(DiskImage::open(&path).expect("open")), 16);
    cached.set_write_through(true);

    let observer = DiskImage::open(&path).expect("open observer");
    let data = vec![0x5Eu8; BLOCK_SIZE];
    cached.write_block(BlockNo(400), &data).expect("write");

    let mut raw = vec![0u8; BLOCK_SIZE];
    observer.read_block(BlockNo(400), &mut raw).expect("read");
    assert_eq!(raw, data);
}
