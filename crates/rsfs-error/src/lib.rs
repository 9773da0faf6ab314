#![forbid(unsafe_code)]
//! Error types for rsfs.
//!
//! Defines `FsError` and a `Result<T>` alias used throughout the workspace.
//! Includes errno mappings for transport layers that translate core errors
//! into protocol responses.

use thiserror::Error;

/// Unified error type for all rsfs operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal invariant broken: {0}")]
    Internal(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("name too long")]
    NameTooLong,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory")]
    NotDirectory,

    #[error("is a directory")]
    IsDirectory,

    #[error("directory not empty")]
    NotEmpty,

    #[error("no space left on device")]
    NoSpace,

    #[error("no inode available")]
    NoInode,

    #[error("file too large")]
    FileTooLarge,

    #[error("permission denied")]
    PermissionDenied,

    #[error("snapshot not found: {0}")]
    SnapshotNotFound(String),

    #[error("snapshot exists: {0}")]
    SnapshotExists(String),

    #[error("max snapshots reached")]
    MaxSnapshots,
}

impl FsError {
    /// Convert this error into a POSIX errno for transport replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Internal(_) => libc::EIO,
            Self::InvalidParam(_) | Self::InvalidPath(_) => libc::EINVAL,
            Self::NameTooLong => libc::ENAMETOOLONG,
            Self::NotFound(_) | Self::SnapshotNotFound(_) => libc::ENOENT,
            Self::AlreadyExists(_) | Self::SnapshotExists(_) => libc::EEXIST,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::NotEmpty => libc::ENOTEMPTY,
            Self::NoSpace | Self::MaxSnapshots => libc::ENOSPC,
            Self::NoInode => libc::ENFILE,
            Self::FileTooLarge => libc::EFBIG,
            Self::PermissionDenied => libc::EACCES,
        }
    }

    /// Stable short code for logs and wire encodings.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "E_IO",
            Self::Internal(_) => "E_INTERNAL",
            Self::InvalidParam(_) => "E_INVALID_PARAM",
            Self::InvalidPath(_) => "E_INVALID_PATH",
            Self::NameTooLong => "E_NAME_TOO_LONG",
            Self::NotFound(_) => "E_NOT_FOUND",
            Self::AlreadyExists(_) => "E_ALREADY_EXISTS",
            Self::NotDirectory => "E_NOT_DIR",
            Self::IsDirectory => "E_IS_DIR",
            Self::NotEmpty => "E_NOT_EMPTY",
            Self::NoSpace => "E_NO_SPACE",
            Self::NoInode => "E_NO_INODE",
            Self::FileTooLarge => "E_FILE_TOO_LARGE",
            Self::PermissionDenied => "E_PERMISSION",
            Self::SnapshotNotFound(_) => "E_SNAPSHOT_NOT_FOUND",
            Self::SnapshotExists(_) => "E_SNAPSHOT_EXISTS",
            Self::MaxSnapshots => "E_MAX_SNAPSHOTS",
        }
    }
}

/// Result alias using `FsError`.
pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(FsError::NotFound("x".into()).to_errno(), libc::ENOENT);
        assert_eq!(FsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(FsError::NotDirectory.to_errno(), libc::ENOTDIR);
        assert_eq!(FsError::NameTooLong.to_errno(), libc::ENAMETOOLONG);
        assert_eq!(FsError::FileTooLarge.to_errno(), libc::EFBIG);
    }

    #[test]
    fn stable_codes() {
        assert_eq!(FsError::MaxSnapshots.code(), "E_MAX_SNAPSHOTS");
        assert_eq!(FsError::PermissionDenied.code(), "E_PERMISSION");
        assert_eq!(FsError::IsDirectory.code(), "E_IS_DIR");
    }
}
