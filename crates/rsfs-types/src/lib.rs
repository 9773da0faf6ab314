#![forbid(unsafe_code)]
//! Core types and on-disk structures for rsfs.
//!
//! Defines the fixed geometry constants, the `BlockNo`/`InodeId` newtypes,
//! and the little-endian codecs for every on-disk record (`Superblock`,
//! `Inode`, `DirEntry`, `SnapshotMeta`). All structures are packed
//! little-endian and fit exactly one 1024-byte block or a fixed submultiple.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

// ── Geometry constants ──────────────────────────────────────────────────────

/// Fixed block size in bytes.
pub const BLOCK_SIZE: usize = 1024;
/// Superblock magic: spells "RSFS".
pub const MAGIC_NUMBER: u32 = 0x5346_5352;
/// On-disk format version.
pub const FS_VERSION: u32 = 1;

/// Direct block pointers per inode.
pub const NUM_DIRECT_BLOCKS: usize = 12;
/// Block pointers per indirect block (1024 / 4).
pub const PTRS_PER_BLOCK: usize = BLOCK_SIZE / 4;
/// Inodes per inode-table block (1024 / 128).
pub const INODES_PER_BLOCK: usize = BLOCK_SIZE / INODE_SIZE;
/// Directory entries per block (1024 / 64).
pub const DIRENTRIES_PER_BLOCK: usize = BLOCK_SIZE / DIRENTRY_SIZE;

/// Size of one on-disk inode record.
pub const INODE_SIZE: usize = 128;
/// Size of one on-disk directory entry.
pub const DIRENTRY_SIZE: usize = 64;
/// Size of one on-disk snapshot metadata record.
pub const SNAPSHOT_META_SIZE: usize = 64;

/// Maximum file name length in bytes.
pub const MAX_FILENAME_LEN: usize = 56;
/// Maximum snapshot name length, including the NUL terminator slot.
pub const MAX_SNAPSHOT_NAME_LEN: usize = 32;
/// Snapshot records that fit in the list block after its 8-byte header.
pub const MAX_SNAPSHOTS: usize = (BLOCK_SIZE - 8) / SNAPSHOT_META_SIZE;

/// Superblock state flag: filesystem initialized and clean.
pub const FS_STATE_CLEAN: u32 = 0x0001;

/// Minimum image size accepted by `format`.
pub const MIN_TOTAL_BLOCKS: u32 = 100;
/// Minimum inode count accepted by `format`.
pub const MIN_TOTAL_INODES: u32 = 16;

// ── Identifiers ─────────────────────────────────────────────────────────────

/// Absolute block number on the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNo(pub u32);

impl BlockNo {
    /// Sentinel for an absent block pointer.
    pub const INVALID: Self = Self(0xFFFF_FFFF);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// Byte offset of this block on the image.
    #[must_use]
    pub fn byte_offset(self) -> u64 {
        u64::from(self.0) * BLOCK_SIZE as u64
    }
}

/// Inode identifier (index into the inode table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeId(pub u32);

impl InodeId {
    /// Sentinel for an absent inode reference.
    pub const INVALID: Self = Self(0xFFFF_FFFF);
    /// The root directory, allocated by `format` and never freed.
    pub const ROOT: Self = Self(0);

    #[must_use]
    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for BlockNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── File types ──────────────────────────────────────────────────────────────

/// On-disk inode/dir-entry type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileType {
    Free = 0,
    Regular = 1,
    Directory = 2,
    /// Reserved; never produced by the current implementation.
    Symlink = 3,
}

impl FileType {
    /// Decode a raw type byte; unknown values decode to `Free`.
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            1 => Self::Regular,
            2 => Self::Directory,
            3 => Self::Symlink,
            _ => Self::Free,
        }
    }
}

// ── Codec errors ────────────────────────────────────────────────────────────

/// Error decoding an on-disk structure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], CodecError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(CodecError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };
    if end > data.len() {
        return Err(CodecError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, CodecError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, CodecError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, CodecError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(i64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

// ── Bitmap operations ───────────────────────────────────────────────────────

/// Get bit `idx` from a bitmap byte slice. Out-of-range reads as set
/// (never allocatable).
#[must_use]
pub fn bitmap_get(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx >= bitmap.len() {
        return true;
    }
    (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Set bit `idx` in a bitmap byte slice.
pub fn bitmap_set(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] |= 1 << bit_idx;
    }
}

/// Clear bit `idx` in a bitmap byte slice.
pub fn bitmap_clear(bitmap: &mut [u8], idx: u32) {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    if byte_idx < bitmap.len() {
        bitmap[byte_idx] &= !(1 << (bit_idx));
    }
}

/// Count set bits among the first `count` bits.
#[must_use]
pub fn bitmap_count_used(bitmap: &[u8], count: u32) -> u32 {
    let mut used = 0u32;
    for idx in 0..count {
        if bitmap_get(bitmap, idx) {
            used += 1;
        }
    }
    used
}

/// Count clear bits among the first `count` bits.
#[must_use]
pub fn bitmap_count_free(bitmap: &[u8], count: u32) -> u32 {
    count - bitmap_count_used(bitmap, count)
}

/// Index of the lowest clear bit among the first `count` bits.
///
/// First-fit gives deterministic allocation order.
#[must_use]
pub fn bitmap_find_first_free(bitmap: &[u8], count: u32) -> Option<u32> {
    (0..count).find(|&idx| !bitmap_get(bitmap, idx))
}

// ── Superblock (block 0) ────────────────────────────────────────────────────

/// Filesystem metadata stored in block 0.
///
/// The counters (`free_*`/`used_*`) are derived from the bitmaps, which are
/// the ground truth; `Allocator` keeps them in sync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub magic: u32,
    pub version: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub total_inodes: u32,

    pub inode_bitmap_start: BlockNo,
    pub inode_bitmap_blocks: u32,
    pub block_bitmap_start: BlockNo,
    pub block_bitmap_blocks: u32,
    pub inode_table_start: BlockNo,

    pub free_blocks: u32,
    pub free_inodes: u32,
    pub used_blocks: u32,
    pub used_inodes: u32,

    pub data_block_start: BlockNo,
    pub data_block_count: u32,

    pub snapshot_count: u32,
    /// Block holding the snapshot list; 0 = none allocated yet.
    pub snapshot_list_block: BlockNo,

    pub create_time: i64,
    pub mount_time: i64,
    pub write_time: i64,

    pub state: u32,
    pub root_inode: InodeId,
}

impl Superblock {
    /// Compute the on-disk layout for the given geometry.
    ///
    /// Counters start at zero; `format` adjusts them after seeding the root
    /// directory.
    #[must_use]
    pub fn new(total_blocks: u32, total_inodes: u32) -> Self {
        let bits_per_block = (BLOCK_SIZE * 8) as u32;
        let inode_bitmap_start = BlockNo(1);
        let inode_bitmap_blocks = total_inodes.div_ceil(bits_per_block);
        let block_bitmap_start = BlockNo(inode_bitmap_start.0 + inode_bitmap_blocks);
        let block_bitmap_blocks = total_blocks.div_ceil(bits_per_block);
        let inode_table_start = BlockNo(block_bitmap_start.0 + block_bitmap_blocks);
        let inode_table_blocks = total_inodes.div_ceil(INODES_PER_BLOCK as u32);
        let data_block_start = BlockNo(inode_table_start.0 + inode_table_blocks);
        let data_block_count = total_blocks - data_block_start.0;

        Self {
            magic: MAGIC_NUMBER,
            version: FS_VERSION,
            block_size: BLOCK_SIZE as u32,
            total_blocks,
            total_inodes,
            inode_bitmap_start,
            inode_bitmap_blocks,
            block_bitmap_start,
            block_bitmap_blocks,
            inode_table_start,
            free_blocks: data_block_count,
            free_inodes: total_inodes,
            used_blocks: 0,
            used_inodes: 0,
            data_block_start,
            data_block_count,
            snapshot_count: 0,
            snapshot_list_block: BlockNo(0),
            create_time: 0,
            mount_time: 0,
            write_time: 0,
            state: FS_STATE_CLEAN,
            root_inode: InodeId::ROOT,
        }
    }

    /// Whether magic, version, and geometry look like an rsfs image.
    #[must_use]
    pub fn validate(&self) -> bool {
        self.magic == MAGIC_NUMBER
            && self.version <= FS_VERSION
            && self.block_size == BLOCK_SIZE as u32
            && self.total_blocks != 0
            && self.total_inodes != 0
    }

    /// Serialize into a full block image.
    #[must_use]
    pub fn encode(&self) -> [u8; BLOCK_SIZE] {
        let mut buf = [0u8; BLOCK_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.block_size.to_le_bytes());
        buf[12..16].copy_from_slice(&self.total_blocks.to_le_bytes());
        buf[16..20].copy_from_slice(&self.total_inodes.to_le_bytes());
        // 20..28: per-group geometry, reserved.
        buf[28..32].copy_from_slice(&self.inode_bitmap_start.0.to_le_bytes());
        buf[32..36].copy_from_slice(&self.inode_bitmap_blocks.to_le_bytes());
        buf[36..40].copy_from_slice(&self.block_bitmap_start.0.to_le_bytes());
        buf[40..44].copy_from_slice(&self.block_bitmap_blocks.to_le_bytes());
        buf[44..48].copy_from_slice(&self.inode_table_start.0.to_le_bytes());
        buf[48..52].copy_from_slice(&self.free_blocks.to_le_bytes());
        buf[52..56].copy_from_slice(&self.free_inodes.to_le_bytes());
        buf[56..60].copy_from_slice(&self.used_blocks.to_le_bytes());
        buf[60..64].copy_from_slice(&self.used_inodes.to_le_bytes());
        buf[64..68].copy_from_slice(&self.data_block_start.0.to_le_bytes());
        buf[68..72].copy_from_slice(&self.data_block_count.to_le_bytes());
        buf[72..76].copy_from_slice(&self.snapshot_count.to_le_bytes());
        buf[76..80].copy_from_slice(&self.snapshot_list_block.0.to_le_bytes());
        buf[80..88].copy_from_slice(&self.create_time.to_le_bytes());
        buf[88..96].copy_from_slice(&self.mount_time.to_le_bytes());
        buf[96..104].copy_from_slice(&self.write_time.to_le_bytes());
        buf[104..108].copy_from_slice(&self.state.to_le_bytes());
        buf[108..112].copy_from_slice(&self.root_inode.0.to_le_bytes());
        buf
    }

    /// Parse from a block image, checking the magic.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        let magic = read_le_u32(data, 0)?;
        if magic != MAGIC_NUMBER {
            return Err(CodecError::InvalidMagic {
                expected: MAGIC_NUMBER,
                actual: magic,
            });
        }
        Ok(Self {
            magic,
            version: read_le_u32(data, 4)?,
            block_size: read_le_u32(data, 8)?,
            total_blocks: read_le_u32(data, 12)?,
            total_inodes: read_le_u32(data, 16)?,
            inode_bitmap_start: BlockNo(read_le_u32(data, 28)?),
            inode_bitmap_blocks: read_le_u32(data, 32)?,
            block_bitmap_start: BlockNo(read_le_u32(data, 36)?),
            block_bitmap_blocks: read_le_u32(data, 40)?,
            inode_table_start: BlockNo(read_le_u32(data, 44)?),
            free_blocks: read_le_u32(data, 48)?,
            free_inodes: read_le_u32(data, 52)?,
            used_blocks: read_le_u32(data, 56)?,
            used_inodes: read_le_u32(data, 60)?,
            data_block_start: BlockNo(read_le_u32(data, 64)?),
            data_block_count: read_le_u32(data, 68)?,
            snapshot_count: read_le_u32(data, 72)?,
            snapshot_list_block: BlockNo(read_le_u32(data, 76)?),
            create_time: read_le_i64(data, 80)?,
            mount_time: read_le_i64(data, 88)?,
            write_time: read_le_i64(data, 96)?,
            state: read_le_u32(data, 104)?,
            root_inode: InodeId(read_le_u32(data, 108)?),
        })
    }
}

// ── Inode (128 bytes, 8 per block) ──────────────────────────────────────────

/// One file or directory record in the inode table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inode {
    pub file_type: FileType,
    pub permissions: u8,
    pub flags: u16,
    pub size: u32,
    pub link_count: u16,
    /// Reserved for inode-level sharing; always 1 on live inodes.
    pub ref_count: u16,
    pub create_time: i64,
    pub modify_time: i64,
    pub access_time: i64,
    pub direct_blocks: [BlockNo; NUM_DIRECT_BLOCKS],
    pub single_indirect: BlockNo,
    pub double_indirect: BlockNo,
    /// Allocated blocks reachable from this inode (data + indirect).
    pub block_count: u32,
    /// Reserved; written as zero.
    pub checksum: u32,
}

impl Inode {
    /// Fresh inode of the given type with all pointers absent.
    #[must_use]
    pub fn new(file_type: FileType) -> Self {
        Self {
            file_type,
            permissions: 0x07,
            flags: 0,
            size: 0,
            link_count: 1,
            ref_count: 1,
            create_time: 0,
            modify_time: 0,
            access_time: 0,
            direct_blocks: [BlockNo::INVALID; NUM_DIRECT_BLOCKS],
            single_indirect: BlockNo::INVALID,
            double_indirect: BlockNo::INVALID,
            block_count: 0,
            checksum: 0,
        }
    }

    /// A freed slot: `Free` type, no links, pointers absent.
    #[must_use]
    pub fn cleared() -> Self {
        let mut inode = Self::new(FileType::Free);
        inode.permissions = 0;
        inode.link_count = 0;
        inode.ref_count = 0;
        inode
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.file_type != FileType::Free
    }

    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.file_type == FileType::Directory
    }

    #[must_use]
    pub fn is_regular_file(&self) -> bool {
        self.file_type == FileType::Regular
    }

    /// Maximum addressable blocks: direct + single + double indirect.
    #[must_use]
    pub const fn max_blocks() -> u32 {
        (NUM_DIRECT_BLOCKS + PTRS_PER_BLOCK + PTRS_PER_BLOCK * PTRS_PER_BLOCK) as u32
    }

    /// Maximum file size in bytes (67,383,808).
    #[must_use]
    pub const fn max_file_size() -> u64 {
        Self::max_blocks() as u64 * BLOCK_SIZE as u64
    }

    /// Serialize into a 128-byte inode-table slot.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= INODE_SIZE);
        buf[..INODE_SIZE].fill(0);
        buf[0] = self.file_type as u8;
        buf[1] = self.permissions;
        buf[2..4].copy_from_slice(&self.flags.to_le_bytes());
        buf[4..8].copy_from_slice(&self.size.to_le_bytes());
        buf[8..10].copy_from_slice(&self.link_count.to_le_bytes());
        buf[10..12].copy_from_slice(&self.ref_count.to_le_bytes());
        buf[12..20].copy_from_slice(&self.create_time.to_le_bytes());
        buf[20..28].copy_from_slice(&self.modify_time.to_le_bytes());
        buf[28..36].copy_from_slice(&self.access_time.to_le_bytes());
        for (i, block) in self.direct_blocks.iter().enumerate() {
            let off = 36 + i * 4;
            buf[off..off + 4].copy_from_slice(&block.0.to_le_bytes());
        }
        buf[84..88].copy_from_slice(&self.single_indirect.0.to_le_bytes());
        buf[88..92].copy_from_slice(&self.double_indirect.0.to_le_bytes());
        buf[92..96].copy_from_slice(&self.block_count.to_le_bytes());
        buf[96..100].copy_from_slice(&self.checksum.to_le_bytes());
    }

    /// Parse from a 128-byte inode-table slot.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        ensure_slice(data, 0, INODE_SIZE)?;
        let mut direct_blocks = [BlockNo::INVALID; NUM_DIRECT_BLOCKS];
        for (i, slot) in direct_blocks.iter_mut().enumerate() {
            *slot = BlockNo(read_le_u32(data, 36 + i * 4)?);
        }
        Ok(Self {
            file_type: FileType::from_raw(data[0]),
            permissions: data[1],
            flags: read_le_u16(data, 2)?,
            size: read_le_u32(data, 4)?,
            link_count: read_le_u16(data, 8)?,
            ref_count: read_le_u16(data, 10)?,
            create_time: read_le_i64(data, 12)?,
            modify_time: read_le_i64(data, 20)?,
            access_time: read_le_i64(data, 28)?,
            direct_blocks,
            single_indirect: BlockNo(read_le_u32(data, 84)?),
            double_indirect: BlockNo(read_le_u32(data, 88)?),
            block_count: read_le_u32(data, 92)?,
            checksum: read_le_u32(data, 96)?,
        })
    }
}

// ── DirEntry (64 bytes, 16 per block) ───────────────────────────────────────

/// One name → inode binding inside a directory block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub inode: InodeId,
    pub name_len: u8,
    pub file_type: FileType,
    pub rec_len: u16,
    pub name: [u8; MAX_FILENAME_LEN],
}

impl DirEntry {
    /// Build a valid entry. `name` is truncated to `MAX_FILENAME_LEN` bytes;
    /// callers validate length beforehand.
    #[must_use]
    pub fn new(inode: InodeId, name: &str, file_type: FileType) -> Self {
        let bytes = name.as_bytes();
        let len = bytes.len().min(MAX_FILENAME_LEN);
        let mut buf = [0u8; MAX_FILENAME_LEN];
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            inode,
            name_len: len as u8,
            file_type,
            rec_len: DIRENTRY_SIZE as u16,
            name: buf,
        }
    }

    /// An empty (invalid) slot.
    #[must_use]
    pub fn invalid() -> Self {
        Self {
            inode: InodeId::INVALID,
            name_len: 0,
            file_type: FileType::Free,
            rec_len: 0,
            name: [0u8; MAX_FILENAME_LEN],
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.inode != InodeId::INVALID
    }

    /// Entry name as a string (lossy for non-UTF-8 bytes).
    #[must_use]
    pub fn name(&self) -> String {
        let len = (self.name_len as usize).min(MAX_FILENAME_LEN);
        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }

    /// Serialize into a 64-byte directory slot.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= DIRENTRY_SIZE);
        buf[..DIRENTRY_SIZE].fill(0);
        buf[0..4].copy_from_slice(&self.inode.0.to_le_bytes());
        buf[4] = self.name_len;
        buf[5] = self.file_type as u8;
        buf[6..8].copy_from_slice(&self.rec_len.to_le_bytes());
        buf[8..8 + MAX_FILENAME_LEN].copy_from_slice(&self.name);
    }

    /// Parse from a 64-byte directory slot.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        ensure_slice(data, 0, DIRENTRY_SIZE)?;
        let mut name = [0u8; MAX_FILENAME_LEN];
        name.copy_from_slice(&data[8..8 + MAX_FILENAME_LEN]);
        Ok(Self {
            inode: InodeId(read_le_u32(data, 0)?),
            name_len: data[4],
            file_type: FileType::from_raw(data[5]),
            rec_len: read_le_u16(data, 6)?,
            name,
        })
    }
}

// ── SnapshotMeta (64 bytes, 15 per list block) ──────────────────────────────

/// Snapshot metadata flag: record is live.
pub const SNAPSHOT_FLAG_VALID: u32 = 0x0001;

/// One snapshot record in the snapshot list block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub name: [u8; MAX_SNAPSHOT_NAME_LEN],
    pub create_time: i64,
    pub root_inode: InodeId,
    pub block_count: u32,
    pub flags: u32,
}

impl SnapshotMeta {
    #[must_use]
    pub fn new(name: &str, create_time: i64, root_inode: InodeId, block_count: u32) -> Self {
        let bytes = name.as_bytes();
        let len = bytes.len().min(MAX_SNAPSHOT_NAME_LEN - 1);
        let mut buf = [0u8; MAX_SNAPSHOT_NAME_LEN];
        buf[..len].copy_from_slice(&bytes[..len]);
        Self {
            name: buf,
            create_time,
            root_inode,
            block_count,
            flags: SNAPSHOT_FLAG_VALID,
        }
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.flags & SNAPSHOT_FLAG_VALID != 0
    }

    /// Snapshot name up to the first NUL.
    #[must_use]
    pub fn name(&self) -> String {
        let end = self
            .name
            .iter()
            .position(|b| *b == 0)
            .unwrap_or(MAX_SNAPSHOT_NAME_LEN);
        String::from_utf8_lossy(&self.name[..end]).into_owned()
    }

    /// Serialize into a 64-byte list slot.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= SNAPSHOT_META_SIZE);
        buf[..SNAPSHOT_META_SIZE].fill(0);
        buf[0..MAX_SNAPSHOT_NAME_LEN].copy_from_slice(&self.name);
        buf[32..40].copy_from_slice(&self.create_time.to_le_bytes());
        buf[40..44].copy_from_slice(&self.root_inode.0.to_le_bytes());
        buf[44..48].copy_from_slice(&self.block_count.to_le_bytes());
        buf[48..52].copy_from_slice(&self.flags.to_le_bytes());
    }

    /// Parse from a 64-byte list slot.
    pub fn decode(data: &[u8]) -> Result<Self, CodecError> {
        ensure_slice(data, 0, SNAPSHOT_META_SIZE)?;
        let mut name = [0u8; MAX_SNAPSHOT_NAME_LEN];
        name.copy_from_slice(&data[0..MAX_SNAPSHOT_NAME_LEN]);
        Ok(Self {
            name,
            create_time: read_le_i64(data, 32)?,
            root_inode: InodeId(read_le_u32(data, 40)?),
            block_count: read_le_u32(data, 44)?,
            flags: read_le_u32(data, 48)?,
        })
    }
}

// ── Public info types ───────────────────────────────────────────────────────

/// Metadata snapshot for one path, as returned by `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub inode: InodeId,
    pub file_type: FileType,
    pub size: u32,
    pub link_count: u16,
    pub create_time: i64,
    pub modify_time: i64,
    pub access_time: i64,
    pub blocks: u32,
}

/// Block cache counters; `hit_rate` is derived at sampling time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub capacity: u32,
    pub current_size: u32,
    pub hit_rate: f64,
}

/// Seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn geometry_constants() {
        assert_eq!(PTRS_PER_BLOCK, 256);
        assert_eq!(INODES_PER_BLOCK, 8);
        assert_eq!(DIRENTRIES_PER_BLOCK, 16);
        assert_eq!(MAX_SNAPSHOTS, 15);
        assert_eq!(Inode::max_blocks(), 12 + 256 + 65536);
        assert_eq!(Inode::max_file_size(), 67_383_808);
    }

    #[test]
    fn read_helpers() {
        let bytes = [0x34u8, 0x12, 0x78, 0x56, 0xEF, 0xCD, 0xAB, 0x90];
        assert_eq!(read_le_u16(&bytes, 0).expect("u16"), 0x1234);
        assert_eq!(read_le_u32(&bytes, 0).expect("u32"), 0x5678_1234);
        assert!(read_le_u32(&bytes, 6).is_err());
    }

    #[test]
    fn bitmap_get_set_clear() {
        let mut bm = vec![0u8; 4];
        assert!(!bitmap_get(&bm, 0));
        bitmap_set(&mut bm, 0);
        assert!(bitmap_get(&bm, 0));
        bitmap_clear(&mut bm, 0);
        assert!(!bitmap_get(&bm, 0));

        bitmap_set(&mut bm, 7);
        assert_eq!(bm[0], 0x80);
        bitmap_set(&mut bm, 8);
        assert_eq!(bm[1], 0x01);
    }

    #[test]
    fn bitmap_out_of_range_reads_as_set() {
        let bm = vec![0u8; 1];
        assert!(bitmap_get(&bm, 8));
    }

    #[test]
    fn bitmap_counts_and_first_fit() {
        let mut bm = vec![0u8; 2];
        assert_eq!(bitmap_count_free(&bm, 16), 16);
        bitmap_set(&mut bm, 0);
        bitmap_set(&mut bm, 1);
        bitmap_set(&mut bm, 5);
        assert_eq!(bitmap_count_used(&bm, 16), 3);
        assert_eq!(bitmap_find_first_free(&bm, 16), Some(2));

        for i in 0..16 {
            bitmap_set(&mut bm, i);
        }
        assert_eq!(bitmap_find_first_free(&bm, 16), None);
    }

    #[test]
    fn superblock_layout_math() {
        let sb = Superblock::new(2048, 128);
        assert_eq!(sb.inode_bitmap_start, BlockNo(1));
        assert_eq!(sb.inode_bitmap_blocks, 1);
        assert_eq!(sb.block_bitmap_start, BlockNo(2));
        assert_eq!(sb.block_bitmap_blocks, 1);
        assert_eq!(sb.inode_table_start, BlockNo(3));
        // 128 inodes / 8 per block = 16 table blocks.
        assert_eq!(sb.data_block_start, BlockNo(19));
        assert_eq!(sb.data_block_count, 2048 - 19);
        assert_eq!(sb.free_blocks, sb.data_block_count);
        assert!(sb.validate());
    }

    #[test]
    fn superblock_round_trip() {
        let mut sb = Superblock::new(16384, 1024);
        sb.create_time = 1_700_000_000;
        sb.snapshot_count = 3;
        sb.snapshot_list_block = BlockNo(42);
        sb.used_blocks = 7;
        sb.free_blocks = sb.data_block_count - 7;

        let encoded = sb.encode();
        let decoded = Superblock::decode(&encoded).expect("decode");
        assert_eq!(decoded, sb);
    }

    #[test]
    fn superblock_rejects_bad_magic() {
        let mut encoded = Superblock::new(2048, 128).encode();
        encoded[0] = 0;
        assert!(matches!(
            Superblock::decode(&encoded),
            Err(CodecError::InvalidMagic { .. })
        ));
    }

    #[test]
    fn inode_round_trip() {
        let mut inode = Inode::new(FileType::Regular);
        inode.size = 4096;
        inode.link_count = 1;
        inode.create_time = 1_700_000_000;
        inode.direct_blocks[0] = BlockNo(19);
        inode.direct_blocks[11] = BlockNo(30);
        inode.single_indirect = BlockNo(31);
        inode.block_count = 14;

        let mut buf = [0u8; INODE_SIZE];
        inode.encode_into(&mut buf);
        let decoded = Inode::decode(&buf).expect("decode");
        assert_eq!(decoded, inode);
    }

    #[test]
    fn fresh_inode_has_absent_pointers() {
        let inode = Inode::new(FileType::Directory);
        assert!(inode.direct_blocks.iter().all(|b| !b.is_valid()));
        assert!(!inode.single_indirect.is_valid());
        assert!(!inode.double_indirect.is_valid());
        assert_eq!(inode.ref_count, 1);

        let cleared = Inode::cleared();
        assert!(!cleared.is_valid());
        assert_eq!(cleared.link_count, 0);
    }

    #[test]
    fn dir_entry_round_trip() {
        let entry = DirEntry::new(InodeId(7), "papers", FileType::Directory);
        assert_eq!(entry.name(), "papers");
        assert_eq!(entry.name_len, 6);
        assert!(entry.is_valid());

        let mut buf = [0u8; DIRENTRY_SIZE];
        entry.encode_into(&mut buf);
        let decoded = DirEntry::decode(&buf).expect("decode");
        assert_eq!(decoded, entry);

        assert!(!DirEntry::invalid().is_valid());
    }

    #[test]
    fn snapshot_meta_round_trip() {
        let meta = SnapshotMeta::new("v1-before-review", 1_700_000_000, InodeId(9), 12);
        assert!(meta.is_valid());
        assert_eq!(meta.name(), "v1-before-review");

        let mut buf = [0u8; SNAPSHOT_META_SIZE];
        meta.encode_into(&mut buf);
        let decoded = SnapshotMeta::decode(&buf).expect("decode");
        assert_eq!(decoded, meta);
    }

    #[test]
    fn snapshot_meta_name_truncated() {
        let long = "x".repeat(40);
        let meta = SnapshotMeta::new(&long, 0, InodeId(1), 0);
        assert_eq!(meta.name().len(), MAX_SNAPSHOT_NAME_LEN - 1);
    }

    #[test]
    fn file_type_raw_round_trip() {
        for ft in [
            FileType::Free,
            FileType::Regular,
            FileType::Directory,
            FileType::Symlink,
        ] {
            assert_eq!(FileType::from_raw(ft as u8), ft);
        }
        assert_eq!(FileType::from_raw(0xFF), FileType::Free);
    }
}
