#![forbid(unsafe_code)]
//! Shared types for fmapfs.
//!
//! Byte-level readers used by the on-disk parsers, the `ParseError` they
//! return, NUL-padded string helpers, and the `NodeId` newtype that
//! identifies entries of the virtual tree (and doubles as the FUSE inode
//! number).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifier of a node in the virtual tree.
///
/// Node ids are dense arena indices offset by one, so the root directory is
/// `1`, matching the FUSE root inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    pub const ROOT: Self = Self(1);

    /// Arena slot for this id, or `None` for the reserved id `0`.
    #[must_use]
    pub fn to_index(self) -> Option<usize> {
        let slot = self.0.checked_sub(1)?;
        usize::try_from(slot).ok()
    }

    /// Id for an arena slot.
    #[must_use]
    pub fn from_index(index: usize) -> Self {
        Self(u64::try_from(index).map_or(u64::MAX, |i| i.saturating_add(1)))
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A byte range inside the backing image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub offset: u64,
    pub len: u64,
}

impl ByteRange {
    #[must_use]
    pub const fn new(offset: u64, len: u64) -> Self {
        Self { offset, len }
    }

    /// Exclusive end of the range, `None` on overflow.
    #[must_use]
    pub fn end(self) -> Option<u64> {
        self.offset.checked_add(self.len)
    }

    /// Whether the whole range lies within `[0, limit)`.
    #[must_use]
    pub fn fits_within(self, limit: u64) -> bool {
        self.end().is_some_and(|end| end <= limit)
    }

    /// Sub-range at `rel_offset` relative to this range's start.
    ///
    /// Returns `None` if the sub-range would leave this range.
    #[must_use]
    pub fn subrange(self, rel_offset: u64, len: u64) -> Option<Self> {
        let sub = Self::new(rel_offset, len);
        if !sub.fits_within(self.len) {
            return None;
        }
        Some(Self::new(self.offset.checked_add(rel_offset)?, len))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}+{:#x}", self.offset, self.len)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_u8(data: &[u8], offset: usize) -> Result<u8, ParseError> {
    let bytes = ensure_slice(data, offset, 1)?;
    Ok(bytes[0])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

/// The prefix of `bytes` before the first NUL (all of it if there is none).
#[must_use]
pub fn nul_terminated(bytes: &[u8]) -> &[u8] {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    &bytes[..end]
}

/// Decode a NUL-padded fixed-width string field (lossy UTF-8).
///
/// Unlike a trim, interior whitespace and trailing spaces are preserved:
/// area names are used verbatim as directory names.
#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    String::from_utf8_lossy(nul_terminated(bytes)).into_owned()
}

/// Copy `src` into `dst` and fill the remainder with NUL bytes.
///
/// Returns `false` (leaving `dst` untouched) if `src` does not fit.
#[must_use]
pub fn fill_nul_padded(dst: &mut [u8], src: &[u8]) -> bool {
    if src.len() > dst.len() {
        return false;
    }
    let (head, tail) = dst.split_at_mut(src.len());
    head.copy_from_slice(src);
    tail.fill(0);
    true
}

/// Strip at most one trailing `\n` from a text payload.
#[must_use]
pub fn chomp_newline(bytes: &[u8]) -> &[u8] {
    bytes.strip_suffix(b"\n").unwrap_or(bytes)
}

/// Widen a `usize` to `u64` (saturating on exotic targets).
#[must_use]
pub fn usize_to_u64(value: usize) -> u64 {
    u64::try_from(value).unwrap_or(u64::MAX)
}
