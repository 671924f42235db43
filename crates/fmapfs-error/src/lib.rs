#![forbid(unsafe_code)]
//! Error types for fmapfs.
//!
//! # Error Taxonomy
//!
//! fmapfs uses a three-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Bytes | `ParseError` | `fmapfs-types` | Short reads and bad fields while decoding raw bytes |
//! | Mount | `FmapParseError` | `fmapfs-ondisk` | Fatal FMAP violations; nothing is mounted |
//! | Runtime | `FmapfsError` | `fmapfs-error` (this crate) | Per-operation failures for FUSE and CLI consumers |
//!
//! Decoder failures (`DecodeError` in `fmapfs-core`) never reach this layer:
//! they only suppress one area's optional subtree and are logged.
//!
//! ## FUSE errno Mapping
//!
//! Every `FmapfsError` variant maps to exactly one POSIX errno via
//! [`FmapfsError::to_errno`]. The mapping is exhaustive (no wildcard arms) so
//! adding a new variant is a compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS error, else `EIO` |
//! | `Format` | `EINVAL` |
//! | `InvalidArgument` | `EINVAL` |
//! | `FileTooBig` | `EFBIG` |
//! | `NotFound` | `ENOENT` |
//! | `NotDirectory` | `ENOTDIR` |
//! | `IsDirectory` | `EISDIR` |
//! | `Unsupported` | `EOPNOTSUPP` |
//! | `ReadOnly` | `EROFS` |
//!
//! ## Design Constraints
//!
//! - `fmapfs-error` MUST NOT depend on `fmapfs-types` or `fmapfs-ondisk`.
//! - All string payloads are owned so errors can cross thread boundaries.

use thiserror::Error;

/// Unified runtime error type for fmapfs operations.
#[derive(Debug, Error)]
pub enum FmapfsError {
    /// Operating system I/O error while loading or persisting the image.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The image is not a usable FMAP image.
    #[error("invalid image format: {0}")]
    Format(String),

    /// A write payload or request argument was rejected.
    ///
    /// Used for malformed `version` text, an over-long `name` or `hwid`, and
    /// unrecognized flag values. Nothing is written when this is returned.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A write or truncate would change the size of a fixed-size file.
    ///
    /// For an oversized write that starts inside the file, the in-bounds
    /// prefix has already been committed when this is returned.
    #[error("file too big: {detail}")]
    FileTooBig { detail: String },

    /// Path component or node id does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A directory operation was attempted on a file.
    #[error("not a directory")]
    NotDirectory,

    /// A file operation was attempted on a directory.
    #[error("is a directory")]
    IsDirectory,

    /// Structural mutation (create, mkdir, unlink, rmdir, rename).
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// The backing image was opened read-only and a persist was attempted.
    #[error("read-only image")]
    ReadOnly,
}

impl FmapfsError {
    /// Convert this error into a POSIX errno suitable for FUSE replies.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Format(_) | Self::InvalidArgument(_) => libc::EINVAL,
            Self::FileTooBig { .. } => libc::EFBIG,
            Self::NotFound(_) => libc::ENOENT,
            Self::NotDirectory => libc::ENOTDIR,
            Self::IsDirectory => libc::EISDIR,
            Self::Unsupported(_) => libc::EOPNOTSUPP,
            Self::ReadOnly => libc::EROFS,
        }
    }
}

/// Result alias using `FmapfsError`.
pub type Result<T> = std::result::Result<T, FmapfsError>;
