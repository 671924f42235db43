#![forbid(unsafe_code)]
//! Backing store for fmapfs.
//!
//! The whole firmware image lives in one [`BackingStore`]: a single owned
//! buffer behind a reader/writer lock. Every virtual file holds only an
//! offset/length view plus a clone of the store handle, so overlapping views
//! alias the same bytes and a write through one is visible through all.
//!
//! [`ImageFile`] loads the buffer from disk and writes it back on persist.

use fmapfs_error::{FmapfsError, Result};
use fmapfs_types::{ByteRange, usize_to_u64};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info};

struct StoreInner {
    bytes: RwLock<Vec<u8>>,
    dirty: AtomicBool,
}

/// Shared, fixed-length, mutable image buffer.
///
/// Cloning the handle is cheap and never copies the bytes.
#[derive(Clone)]
pub struct BackingStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for BackingStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackingStore")
            .field("len", &self.len())
            .field("dirty", &self.is_dirty())
            .finish()
    }
}

impl BackingStore {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                bytes: RwLock::new(bytes),
                dirty: AtomicBool::new(false),
            }),
        }
    }

    /// Image length in bytes. Fixed for the store's lifetime.
    #[must_use]
    pub fn len(&self) -> u64 {
        usize_to_u64(self.inner.bytes.read().len())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.bytes.read().is_empty()
    }

    /// Whether any write happened since construction or the last persist.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.inner.dirty.load(Ordering::Acquire)
    }

    /// Run `f` over the whole image under a shared lock.
    pub fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.inner.bytes.read())
    }

    /// Copy `range` out of the image.
    pub fn read_range(&self, range: ByteRange) -> Result<Vec<u8>> {
        self.with_bytes(|bytes| slice_range(bytes, range).map(<[u8]>::to_vec))
    }

    /// Copy of the whole image.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.inner.bytes.read().clone()
    }

    /// Take the exclusive lock for a sequence of mutations.
    ///
    /// All writes of one filesystem operation go through a single guard so
    /// they cannot interleave with another writer.
    #[must_use]
    pub fn lock_mut(&self) -> StoreWriteGuard<'_> {
        StoreWriteGuard {
            bytes: self.inner.bytes.write(),
            dirty: &self.inner.dirty,
        }
    }

    /// Write `data` at absolute `offset`.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.lock_mut().write_at(offset, data)
    }

    /// Hand the image to `sink` if dirty, clearing the flag on success.
    ///
    /// Writers are excluded for the duration, so no write can slip between
    /// the copy-out and the flag reset. Returns whether `sink` ran.
    pub fn persist_with(&self, sink: impl FnOnce(&[u8]) -> Result<()>) -> Result<bool> {
        let bytes = self.inner.bytes.read();
        if !self.inner.dirty.load(Ordering::Acquire) {
            return Ok(false);
        }
        sink(&bytes)?;
        self.inner.dirty.store(false, Ordering::Release);
        Ok(true)
    }
}

/// Exclusive access to the image bytes.
pub struct StoreWriteGuard<'a> {
    bytes: RwLockWriteGuard<'a, Vec<u8>>,
    dirty: &'a AtomicBool,
}

impl StoreWriteGuard<'_> {
    /// Read `range` while holding the exclusive lock.
    pub fn read_range(&self, range: ByteRange) -> Result<&[u8]> {
        slice_range(&self.bytes, range)
    }

    /// Overwrite bytes starting at absolute `offset`. The image never grows.
    pub fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let range = ByteRange::new(offset, usize_to_u64(data.len()));
        let image_len = usize_to_u64(self.bytes.len());
        if !range.fits_within(image_len) {
            return Err(FmapfsError::Format(format!(
                "write out of bounds: range={range} image_len={image_len}"
            )));
        }
        if data.is_empty() {
            return Ok(());
        }
        let start = usize::try_from(offset)
            .map_err(|_| FmapfsError::Format("write offset overflows usize".to_owned()))?;
        self.bytes[start..start + data.len()].copy_from_slice(data);
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }
}

fn slice_range(bytes: &[u8], range: ByteRange) -> Result<&[u8]> {
    let image_len = usize_to_u64(bytes.len());
    if !range.fits_within(image_len) {
        return Err(FmapfsError::Format(format!(
            "read out of bounds: range={range} image_len={image_len}"
        )));
    }
    let start = usize::try_from(range.offset)
        .map_err(|_| FmapfsError::Format("read offset overflows usize".to_owned()))?;
    let len = usize::try_from(range.len)
        .map_err(|_| FmapfsError::Format("read length overflows usize".to_owned()))?;
    Ok(&bytes[start..start + len])
}

/// Firmware image file on disk.
///
/// Opened read-write when permitted, otherwise read-only; a read-only image
/// can still be mounted and edited in memory but cannot be persisted.
/// Uses positional I/O (`FileExt`), so no shared seek position is involved.
#[derive(Debug, Clone)]
pub struct ImageFile {
    file: Arc<File>,
    path: PathBuf,
    len: u64,
    writable: bool,
}

impl ImageFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path)
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        debug!(path = %path.display(), len, writable, "opened image file");
        Ok(Self {
            file: Arc::new(file),
            path: path.to_owned(),
            len,
            writable,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn len_bytes(&self) -> u64 {
        self.len
    }

    #[must_use]
    pub fn is_writable(&self) -> bool {
        self.writable
    }

    /// Read the whole file into memory.
    pub fn load(&self) -> Result<Vec<u8>> {
        let len = usize::try_from(self.len)
            .map_err(|_| FmapfsError::Format("image length does not fit usize".to_owned()))?;
        let mut buf = vec![0_u8; len];
        self.file.read_exact_at(&mut buf, 0)?;
        Ok(buf)
    }

    /// Load the file into a fresh [`BackingStore`].
    pub fn load_store(&self) -> Result<BackingStore> {
        Ok(BackingStore::new(self.load()?))
    }

    /// Write `store` back to the file if it has unsaved edits.
    ///
    /// Returns whether anything was written.
    pub fn persist(&self, store: &BackingStore) -> Result<bool> {
        if !store.is_dirty() {
            return Ok(false);
        }
        if !self.writable {
            return Err(FmapfsError::ReadOnly);
        }
        if store.len() != self.len {
            return Err(FmapfsError::Format(format!(
                "store length {} does not match image file length {}",
                store.len(),
                self.len
            )));
        }
        let written = store.persist_with(|bytes| {
            self.file.write_all_at(bytes, 0)?;
            self.file.sync_all()?;
            Ok(())
        })?;
        if written {
            info!(path = %self.path.display(), len = self.len, "image persisted");
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn clones_alias_the_same_bytes() {
        let store = BackingStore::new(vec![0_u8; 16]);
        let alias = store.clone();
        store.write_at(4, b"abcd").expect("in-bounds write");
        assert_eq!(
            alias.read_range(ByteRange::new(2, 8)).expect("in-bounds read"),
            b"\0\0abcd\0\0"
        );
        assert!(alias.is_dirty());
    }

    #[test]
    fn out_of_bounds_access_is_rejected() {
        let store = BackingStore::new(vec![0_u8; 16]);
        assert!(store.write_at(15, b"ab").is_err());
        assert!(store.read_range(ByteRange::new(8, 9)).is_err());
        assert!(store.read_range(ByteRange::new(u64::MAX, 2)).is_err());
        assert!(!store.is_dirty());
        assert_eq!(store.len(), 16);
    }

    #[test]
    fn empty_write_does_not_mark_dirty() {
        let store = BackingStore::new(vec![7_u8; 4]);
        store.write_at(4, &[]).expect("empty write at end");
        assert!(!store.is_dirty());
    }

    #[test]
    fn persist_with_skips_clean_store_and_resets_flag() {
        let store = BackingStore::new(vec![0_u8; 4]);
        assert!(!store.persist_with(|_| panic!("clean store must not persist")).expect("ok"));

        store.write_at(0, &[1]).expect("write");
        let mut seen = Vec::new();
        assert!(
            store
                .persist_with(|bytes| {
                    seen.extend_from_slice(bytes);
                    Ok(())
                })
                .expect("persist")
        );
        assert_eq!(seen, [1, 0, 0, 0]);
        assert!(!store.is_dirty());
    }

    #[test]
    fn failed_sink_keeps_store_dirty() {
        let store = BackingStore::new(vec![0_u8; 4]);
        store.write_at(0, &[1]).expect("write");
        let result = store.persist_with(|_| Err(FmapfsError::ReadOnly));
        assert!(matches!(result, Err(FmapfsError::ReadOnly)));
        assert!(store.is_dirty());
    }

    #[test]
    fn image_file_round_trip() {
        let mut tmp = tempfile::NamedTempFile::new().expect("tempfile");
        tmp.write_all(&[0xAA_u8; 64]).expect("seed image");
        tmp.flush().expect("flush");

        let image = ImageFile::open(tmp.path()).expect("open image");
        assert!(image.is_writable());
        assert_eq!(image.len_bytes(), 64);
        let store = image.load_store().expect("load");
        assert!(!image.persist(&store).expect("clean persist"));

        store.write_at(8, b"EDIT").expect("write");
        assert!(image.persist(&store).expect("dirty persist"));

        let on_disk = std::fs::read(tmp.path()).expect("reread");
        assert_eq!(&on_disk[8..12], b"EDIT");
        assert_eq!(on_disk.len(), 64);
    }

    #[test]
    fn missing_image_file_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ImageFile::open(dir.path().join("missing.bin")).expect_err("missing file");
        assert!(matches!(err, FmapfsError::Io(_)));
    }
}
