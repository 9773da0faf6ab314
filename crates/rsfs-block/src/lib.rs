#![forbid(unsafe_code)]
//! Block I/O layer for rsfs.
//!
//! Provides the narrow `BlockIo` endpoint capability with its two
//! implementations (`DiskImage` raw device, `CachedDisk` write-back LRU
//! cache), plus the `format`/`check` compound operations that lay down a
//! fresh image.

mod cache;
mod disk;
mod format;

pub use cache::{BlockCache, CachedDisk};
pub use disk::{DiskImage, IoStats};
pub use format::{check_image, format_image, FormatOptions, FormatSummary};

use rsfs_error::Result;
use rsfs_types::BlockNo;

/// Block-addressed I/O endpoint.
///
/// The allocator, directory engine, and snapshot manager hold one of these,
/// decided at mount time: the raw `DiskImage` or a `CachedDisk` layered over
/// it. Buffers are always exactly one block.
pub trait BlockIo: Send + Sync {
    /// Read block `block` into `buf` (`buf.len() == BLOCK_SIZE`).
    fn read_block(&self, block: BlockNo, buf: &mut [u8]) -> Result<()>;

    /// Write `data` (`data.len() == BLOCK_SIZE`) to block `block`, honoring
    /// the endpoint's configured write policy.
    fn write_block(&self, block: BlockNo, data: &[u8]) -> Result<()>;

    /// Total number of addressable blocks.
    fn block_count(&self) -> u32;

    /// Durability barrier: push every accepted write to stable storage.
    fn flush(&self) -> Result<()>;
}
