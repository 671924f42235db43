#![forbid(unsafe_code)]
//! Leaf file views over the backing store.
//!
//! A view owns no bytes. It holds a clone of the [`BackingStore`] handle and
//! the absolute location of the field it exposes, so two views over
//! overlapping ranges always agree on content.

use fmapfs_block::{BackingStore, StoreWriteGuard};
use fmapfs_error::{FmapfsError, Result};
use fmapfs_types::{ByteRange, chomp_newline, fill_nul_padded, nul_terminated, usize_to_u64};
use std::fmt;

/// Content of one regular file in the virtual tree.
pub trait FileView: fmt::Debug + Send + Sync {
    /// Current file size in bytes.
    fn size(&self) -> Result<u64>;

    /// Read up to `len` bytes at `offset`. Short (or empty) past the end.
    fn read(&self, offset: u64, len: u32) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes accepted.
    fn write(&self, offset: u64, data: &[u8]) -> Result<u32>;
}

/// The part of `content` a read at `offset` for `len` bytes returns.
fn clamp_read(content: &[u8], offset: u64, len: u32) -> Vec<u8> {
    let Ok(start) = usize::try_from(offset) else {
        return Vec::new();
    };
    if start >= content.len() {
        return Vec::new();
    }
    let want = usize::try_from(len).unwrap_or(usize::MAX);
    let end = start.saturating_add(want).min(content.len());
    content[start..end].to_vec()
}

fn payload_len(data: &[u8]) -> Result<u32> {
    u32::try_from(data.len())
        .map_err(|_| FmapfsError::InvalidArgument(format!("write of {} bytes", data.len())))
}

/// Fixed-size byte range of the image (`raw` files, GBB key blobs).
#[derive(Debug, Clone)]
pub struct RawView {
    store: BackingStore,
    range: ByteRange,
}

impl RawView {
    #[must_use]
    pub fn new(store: BackingStore, range: ByteRange) -> Self {
        Self { store, range }
    }

    #[must_use]
    pub fn range(&self) -> ByteRange {
        self.range
    }
}

impl FileView for RawView {
    fn size(&self) -> Result<u64> {
        Ok(self.range.len)
    }

    fn read(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        if offset >= self.range.len {
            return Ok(Vec::new());
        }
        let n = u64::from(len).min(self.range.len - offset);
        let Some(sub) = self.range.subrange(offset, n) else {
            return Ok(Vec::new());
        };
        self.store.read_range(sub)
    }

    /// Writes never resize the view.
    ///
    /// A write that starts inside the view but runs past its end commits the
    /// in-bounds prefix and then fails with `FileTooBig`; both happen under
    /// one exclusive lock.
    fn write(&self, offset: u64, data: &[u8]) -> Result<u32> {
        let accepted = payload_len(data)?;
        let size = self.range.len;
        let too_big = || FmapfsError::FileTooBig {
            detail: format!(
                "write of {} bytes at offset {offset} exceeds size {size}",
                data.len()
            ),
        };

        let mut guard = self.store.lock_mut();
        if let Some(sub) = self.range.subrange(offset, u64::from(accepted)) {
            guard.write_at(sub.offset, data)?;
            return Ok(accepted);
        }
        if offset < size {
            let keep = usize::try_from(size - offset).map_err(|_| too_big())?;
            guard.write_at(self.range.offset + offset, &data[..keep])?;
        }
        Err(too_big())
    }
}

/// NUL-terminated string stored in a fixed-capacity field.
///
/// Reads render the bytes before the first NUL followed by `"\n"`. Writes
/// strip one trailing newline and NUL-pad the rest of the field.
#[derive(Debug, Clone)]
pub struct CStringView {
    store: BackingStore,
    field: ByteRange,
    label: &'static str,
}

impl CStringView {
    #[must_use]
    pub fn new(store: BackingStore, field: ByteRange, label: &'static str) -> Self {
        Self {
            store,
            field,
            label,
        }
    }

    fn render(&self) -> Result<Vec<u8>> {
        let raw = self.store.read_range(self.field)?;
        let mut text = nul_terminated(&raw).to_vec();
        text.push(b'\n');
        Ok(text)
    }
}

impl FileView for CStringView {
    fn size(&self) -> Result<u64> {
        Ok(usize_to_u64(self.render()?.len()))
    }

    fn read(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        Ok(clamp_read(&self.render()?, offset, len))
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<u32> {
        let accepted = payload_len(data)?;
        if data.is_empty() {
            return Ok(0);
        }
        let text = chomp_newline(data);
        let capacity = self.field.len;
        let too_long = || {
            FmapfsError::InvalidArgument(format!(
                "{}: {} bytes at offset {offset} exceed capacity {capacity}",
                self.label,
                text.len()
            ))
        };
        // Everything from `offset` to the end of the field is rewritten.
        let tail_len = capacity
            .checked_sub(offset)
            .and_then(|n| usize::try_from(n).ok())
            .ok_or_else(too_long)?;
        let mut tail = vec![0_u8; tail_len];
        if !fill_nul_padded(&mut tail, text) {
            return Err(too_long());
        }

        self.store
            .lock_mut()
            .write_at(self.field.offset + offset, &tail)?;
        Ok(accepted)
    }
}

/// `"<major>.<minor>\n"` over the two FMAP version bytes.
#[derive(Debug, Clone)]
pub struct VersionView {
    store: BackingStore,
    major_at: u64,
    minor_at: u64,
}

impl VersionView {
    #[must_use]
    pub fn new(store: BackingStore, major_at: u64, minor_at: u64) -> Self {
        Self {
            store,
            major_at,
            minor_at,
        }
    }

    fn render(&self) -> Result<Vec<u8>> {
        let major = self.store.read_range(ByteRange::new(self.major_at, 1))?;
        let minor = self.store.read_range(ByteRange::new(self.minor_at, 1))?;
        Ok(format!("{}.{}\n", major[0], minor[0]).into_bytes())
    }
}

/// Parse `"X.Y"` with both components in `0..=255`.
fn parse_version(text: &[u8]) -> Option<(u8, u8)> {
    let text = std::str::from_utf8(text).ok()?;
    let (major, minor) = text.split_once('.')?;
    let component = |s: &str| {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        s.parse::<u8>().ok()
    };
    Some((component(major)?, component(minor)?))
}

impl FileView for VersionView {
    fn size(&self) -> Result<u64> {
        Ok(usize_to_u64(self.render()?.len()))
    }

    fn read(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        Ok(clamp_read(&self.render()?, offset, len))
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<u32> {
        let accepted = payload_len(data)?;
        if data.is_empty() {
            return Ok(0);
        }
        if offset != 0 {
            return Err(FmapfsError::InvalidArgument(format!(
                "version must be written whole, got offset {offset}"
            )));
        }
        let text = chomp_newline(data);
        let (major, minor) = parse_version(text).ok_or_else(|| {
            FmapfsError::InvalidArgument(format!(
                "version: expected \"X.Y\", got {:?}",
                String::from_utf8_lossy(text)
            ))
        })?;

        let mut guard = self.store.lock_mut();
        guard.write_at(self.major_at, &[major])?;
        guard.write_at(self.minor_at, &[minor])?;
        Ok(accepted)
    }
}

/// One bit of a little-endian `u32` flags word, rendered as `"0\n"`/`"1\n"`.
#[derive(Debug, Clone)]
pub struct FlagBitView {
    store: BackingStore,
    word_at: u64,
    bit: u32,
}

impl FlagBitView {
    #[must_use]
    pub fn new(store: BackingStore, word_at: u64, bit: u32) -> Self {
        Self {
            store,
            word_at,
            bit,
        }
    }

    fn word_range(&self) -> ByteRange {
        ByteRange::new(self.word_at, 4)
    }

    fn load(bytes: &[u8]) -> u32 {
        let mut word = [0_u8; 4];
        word.copy_from_slice(&bytes[..4]);
        u32::from_le_bytes(word)
    }

    fn is_set(&self) -> Result<bool> {
        let bytes = self.store.read_range(self.word_range())?;
        Ok(Self::load(&bytes) & (1 << self.bit) != 0)
    }

    fn update(&self, guard: &mut StoreWriteGuard<'_>, set: bool) -> Result<()> {
        let word = Self::load(guard.read_range(self.word_range())?);
        let word = if set {
            word | (1 << self.bit)
        } else {
            word & !(1 << self.bit)
        };
        guard.write_at(self.word_at, &word.to_le_bytes())
    }
}

impl FileView for FlagBitView {
    fn size(&self) -> Result<u64> {
        Ok(2)
    }

    fn read(&self, offset: u64, len: u32) -> Result<Vec<u8>> {
        let text: &[u8] = if self.is_set()? { b"1\n" } else { b"0\n" };
        Ok(clamp_read(text, offset, len))
    }

    fn write(&self, offset: u64, data: &[u8]) -> Result<u32> {
        let accepted = payload_len(data)?;
        if offset != 0 {
            return Err(FmapfsError::InvalidArgument(format!(
                "flag must be written at offset 0, got {offset}"
            )));
        }
        let set = match data.first().map(u8::to_ascii_lowercase) {
            Some(b'1' | b'y' | b't') => true,
            Some(b'0' | b'n' | b'f') => false,
            _ => {
                return Err(FmapfsError::InvalidArgument(format!(
                    "flag value {:?}",
                    String::from_utf8_lossy(data)
                )));
            }
        };
        let mut guard = self.store.lock_mut();
        self.update(&mut guard, set)?;
        Ok(accepted)
    }
}
