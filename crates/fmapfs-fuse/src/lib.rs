#![forbid(unsafe_code)]
//! FUSE adapter for fmapfs.
//!
//! Kernel requests arrive through `fuser` and are forwarded to a [`FsOps`]
//! implementation from `fmapfs-core`. Failures are mapped to errno values with
//! [`FmapfsError::to_errno()`].

use fmapfs_core::{DirEntry, FileType as NodeFileType, FsOps, NodeAttr};
use fmapfs_error::FmapfsError;
use fmapfs_types::NodeId;
use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyWrite, Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::os::raw::c_int;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// TTL for cached attributes and entries.
///
/// Text views change size when written, so the kernel must not cache.
const ATTR_TTL: Duration = Duration::ZERO;

const BLOCK_SIZE: u32 = 512;

// ── Error type ──────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum FuseError {
    #[error("invalid mountpoint: {0}")]
    InvalidMountpoint(String),
    #[error("mount I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── FUSE error context ─────────────────────────────────────────────────────

/// Structured error context for FUSE operation failures.
///
/// Captures the operation name, inode, optional offset, and the underlying
/// error so every error reply is traced the same way.
pub struct FuseErrorContext<'a> {
    pub error: &'a FmapfsError,
    pub operation: &'static str,
    pub ino: u64,
    pub offset: Option<u64>,
}

impl FuseErrorContext<'_> {
    /// Log this error context via tracing and return the errno for the reply.
    pub fn log_and_errno(&self) -> c_int {
        let errno = self.error.to_errno();
        // ENOENT on lookup is normal; keep it out of the warn stream.
        if errno == libc::ENOENT {
            trace!(
                op = self.operation,
                ino = self.ino,
                errno,
                error = %self.error,
                "FUSE op returned ENOENT"
            );
        } else {
            warn!(
                op = self.operation,
                ino = self.ino,
                offset = self.offset,
                errno,
                error = %self.error,
                "FUSE op failed"
            );
        }
        errno
    }
}

// ── Type conversions ────────────────────────────────────────────────────────

fn to_fuser_file_type(ft: NodeFileType) -> FileType {
    match ft {
        NodeFileType::RegularFile => FileType::RegularFile,
        NodeFileType::Directory => FileType::Directory,
    }
}

fn to_file_attr(attr: &NodeAttr, owner: Owner) -> FileAttr {
    FileAttr {
        ino: attr.ino.0,
        size: attr.size,
        blocks: attr.size.div_ceil(u64::from(BLOCK_SIZE)),
        atime: attr.mtime,
        mtime: attr.mtime,
        ctime: attr.mtime,
        crtime: attr.mtime,
        kind: to_fuser_file_type(attr.kind),
        perm: attr.perm,
        nlink: attr.nlink,
        uid: owner.uid,
        gid: owner.gid,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

// ── Mount options ───────────────────────────────────────────────────────────

/// Owner reported for every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Owner {
    pub uid: u32,
    pub gid: u32,
}

impl Owner {
    /// Owner of an existing path, usually the mountpoint.
    pub fn of_path(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self {
            uid: meta.uid(),
            gid: meta.gid(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct MountOptions {
    pub read_only: bool,
    pub allow_other: bool,
    pub auto_unmount: bool,
    /// Reported owner; taken from the mountpoint when `None`.
    pub owner: Option<Owner>,
}

// ── Cache-line padding ──────────────────────────────────────────────────────

/// Pad a value to 64 bytes to avoid false sharing between hot counters
/// updated on different CPU cores.
#[repr(C, align(64))]
pub struct CacheLinePadded<T>(pub T);

impl<T: std::fmt::Debug> std::fmt::Debug for CacheLinePadded<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

// ── Atomic metrics ──────────────────────────────────────────────────────────

/// Lock-free per-mount request counters.
#[repr(C)]
pub struct AtomicMetrics {
    pub requests_total: CacheLinePadded<AtomicU64>,
    pub requests_ok: CacheLinePadded<AtomicU64>,
    pub requests_err: CacheLinePadded<AtomicU64>,
    pub bytes_read: CacheLinePadded<AtomicU64>,
    pub bytes_written: CacheLinePadded<AtomicU64>,
}

impl AtomicMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            requests_total: CacheLinePadded(AtomicU64::new(0)),
            requests_ok: CacheLinePadded(AtomicU64::new(0)),
            requests_err: CacheLinePadded(AtomicU64::new(0)),
            bytes_read: CacheLinePadded(AtomicU64::new(0)),
            bytes_written: CacheLinePadded(AtomicU64::new(0)),
        }
    }

    fn record<T>(&self, result: &fmapfs_error::Result<T>) {
        self.requests_total.0.fetch_add(1, Ordering::Relaxed);
        let counter = if result.is_ok() {
            &self.requests_ok
        } else {
            &self.requests_err
        };
        counter.0.fetch_add(1, Ordering::Relaxed);
    }

    fn record_bytes_read(&self, n: usize) {
        self.bytes_read
            .0
            .fetch_add(u64::try_from(n).unwrap_or(u64::MAX), Ordering::Relaxed);
    }

    fn record_bytes_written(&self, n: u32) {
        self.bytes_written
            .0
            .fetch_add(u64::from(n), Ordering::Relaxed);
    }

    /// Snapshot of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests_total: self.requests_total.0.load(Ordering::Relaxed),
            requests_ok: self.requests_ok.0.load(Ordering::Relaxed),
            requests_err: self.requests_err.0.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.0.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.0.load(Ordering::Relaxed),
        }
    }
}

impl Default for AtomicMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AtomicMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.snapshot(), f)
    }
}

/// Point-in-time snapshot of metrics (all plain `u64`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub requests_total: u64,
    pub requests_ok: u64,
    pub requests_err: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

// ── Shared FUSE inner state ─────────────────────────────────────────────────

struct FuseInner {
    ops: Arc<dyn FsOps>,
    metrics: AtomicMetrics,
    read_only: bool,
    owner: Owner,
}

impl std::fmt::Debug for FuseInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuseInner")
            .field("metrics", &self.metrics)
            .field("read_only", &self.read_only)
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

/// One line of a directory listing as sent to the kernel.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ListingEntry {
    ino: u64,
    cookie: i64,
    kind: FileType,
    name: String,
}

// ── FUSE filesystem adapter ─────────────────────────────────────────────────

/// FUSE adapter that delegates all operations to a [`FsOps`] implementation.
#[derive(Debug)]
pub struct FmapFuse {
    inner: Arc<FuseInner>,
}

// Compile-time assertion: FmapFuse must be Send + Sync.
const _: () = {
    const fn assert_send_sync<T: Send + Sync>() {}
    let _ = assert_send_sync::<FmapFuse>;
};

impl FmapFuse {
    #[must_use]
    pub fn new(ops: Arc<dyn FsOps>, options: &MountOptions) -> Self {
        let owner = options.owner.unwrap_or_default();
        info!(read_only = options.read_only, uid = owner.uid, gid = owner.gid, "FmapFuse initialized");
        Self {
            inner: Arc::new(FuseInner {
                ops,
                metrics: AtomicMetrics::new(),
                read_only: options.read_only,
                owner,
            }),
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &AtomicMetrics {
        &self.inner.metrics
    }

    fn ops(&self) -> &dyn FsOps {
        self.inner.ops.as_ref()
    }

    fn tracked<T>(&self, result: fmapfs_error::Result<T>) -> fmapfs_error::Result<T> {
        self.inner.metrics.record(&result);
        result
    }

    fn attr(&self, attr: &NodeAttr) -> FileAttr {
        to_file_attr(attr, self.inner.owner)
    }

    /// Listing of `ino` after kernel cookie `offset`, with `.` and `..`
    /// occupying cookies 1 and 2.
    fn listing(&self, ino: u64, offset: u64) -> fmapfs_error::Result<Vec<ListingEntry>> {
        let mut out = Vec::new();
        let cookie = |n: u64| i64::try_from(n).unwrap_or(i64::MAX);
        let children = self.ops().readdir(NodeId(ino), offset.saturating_sub(2))?;
        for (n, name) in [(1, "."), (2, "..")] {
            if offset < n {
                out.push(ListingEntry {
                    ino,
                    cookie: cookie(n),
                    kind: FileType::Directory,
                    name: name.to_owned(),
                });
            }
        }
        out.extend(children.into_iter().map(|entry: DirEntry| ListingEntry {
            ino: entry.ino.0,
            cookie: cookie(entry.offset.saturating_add(2)),
            kind: to_fuser_file_type(entry.kind),
            name: entry.name,
        }));
        Ok(out)
    }

    /// `setattr` only understands size changes; the rest is accepted and
    /// ignored so tools that touch timestamps keep working.
    fn apply_setattr(&self, ino: u64, size: Option<u64>) -> fmapfs_error::Result<NodeAttr> {
        match size {
            Some(size) => self.ops().truncate(NodeId(ino), size),
            None => self.ops().getattr(NodeId(ino)),
        }
    }

    fn reply_error_attr(ctx: &FuseErrorContext<'_>, reply: ReplyAttr) {
        reply.error(ctx.log_and_errno());
    }

    fn reply_error_entry(ctx: &FuseErrorContext<'_>, reply: ReplyEntry) {
        reply.error(ctx.log_and_errno());
    }

    fn reply_error_data(ctx: &FuseErrorContext<'_>, reply: ReplyData) {
        reply.error(ctx.log_and_errno());
    }

    fn reply_error_dir(ctx: &FuseErrorContext<'_>, reply: ReplyDirectory) {
        reply.error(ctx.log_and_errno());
    }

    fn reply_error_empty(ctx: &FuseErrorContext<'_>, reply: ReplyEmpty) {
        reply.error(ctx.log_and_errno());
    }

    fn reply_error_write(ctx: &FuseErrorContext<'_>, reply: ReplyWrite) {
        reply.error(ctx.log_and_errno());
    }

    fn reply_error_create(ctx: &FuseErrorContext<'_>, reply: ReplyCreate) {
        reply.error(ctx.log_and_errno());
    }

    fn flush_ops(&self, operation: &'static str, ino: u64, reply: ReplyEmpty) {
        match self.tracked(self.ops().flush()) {
            Ok(()) => reply.ok(),
            Err(e) => Self::reply_error_empty(
                &FuseErrorContext {
                    error: &e,
                    operation,
                    ino,
                    offset: None,
                },
                reply,
            ),
        }
    }
}

impl Filesystem for FmapFuse {
    fn init(&mut self, _req: &Request<'_>, config: &mut KernelConfig) -> Result<(), c_int> {
        // Let the kernel pass O_TRUNC through open instead of a separate
        // truncate to 0, so `echo > file` works on fixed-size views.
        if let Err(unsupported) = config.add_capabilities(fuser::consts::FUSE_ATOMIC_O_TRUNC) {
            warn!(
                unsupported = format_args!("{unsupported:#x}"),
                "kernel lacks atomic O_TRUNC; shell redirection will fail"
            );
        }
        Ok(())
    }

    fn destroy(&mut self) {
        if let Err(e) = self.ops().flush() {
            warn!(error = %e, "final persist failed");
        }
        let snap = self.inner.metrics.snapshot();
        info!(
            requests_total = snap.requests_total,
            requests_err = snap.requests_err,
            bytes_read = snap.bytes_read,
            bytes_written = snap.bytes_written,
            "FUSE session ended"
        );
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.tracked(self.ops().getattr(NodeId(ino))) {
            Ok(attr) => reply.attr(&ATTR_TTL, &self.attr(&attr)),
            Err(e) => {
                Self::reply_error_attr(
                    &FuseErrorContext {
                        error: &e,
                        operation: "getattr",
                        ino,
                        offset: None,
                    },
                    reply,
                );
            }
        }
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        match self.tracked(self.ops().lookup(NodeId(parent), name)) {
            Ok(attr) => reply.entry(&ATTR_TTL, &self.attr(&attr), 0),
            Err(e) => {
                Self::reply_error_entry(
                    &FuseErrorContext {
                        error: &e,
                        operation: "lookup",
                        ino: parent,
                        offset: None,
                    },
                    reply,
                );
            }
        }
    }

    fn open(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        // Stateless open. O_TRUNC is ignored: files cannot shrink. Direct I/O
        // keeps overlapping views coherent.
        reply.opened(0, fuser::consts::FOPEN_DIRECT_IO);
    }

    fn opendir(&mut self, _req: &Request<'_>, _ino: u64, _flags: i32, reply: ReplyOpen) {
        reply.opened(0, 0);
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        // Clamp negative offsets to 0 (shouldn't happen in practice).
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.tracked(self.ops().read(NodeId(ino), byte_offset, size)) {
            Ok(data) => {
                self.inner.metrics.record_bytes_read(data.len());
                reply.data(&data);
            }
            Err(e) => {
                Self::reply_error_data(
                    &FuseErrorContext {
                        error: &e,
                        operation: "read",
                        ino,
                        offset: Some(byte_offset),
                    },
                    reply,
                );
            }
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let fs_offset = u64::try_from(offset).unwrap_or(0);
        match self.tracked(self.listing(ino, fs_offset)) {
            Ok(entries) => {
                for entry in &entries {
                    if reply.add(entry.ino, entry.cookie, entry.kind, &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(e) => {
                Self::reply_error_dir(
                    &FuseErrorContext {
                        error: &e,
                        operation: "readdir",
                        ino,
                        offset: Some(fs_offset),
                    },
                    reply,
                );
            }
        }
    }

    // ── Write operations ─────────────────────────────────────────────────

    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _mode: Option<u32>,
        _uid: Option<u32>,
        _gid: Option<u32>,
        size: Option<u64>,
        _atime: Option<TimeOrNow>,
        _mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        if self.inner.read_only && size.is_some() {
            reply.error(libc::EROFS);
            return;
        }
        match self.tracked(self.apply_setattr(ino, size)) {
            Ok(attr) => reply.attr(&ATTR_TTL, &self.attr(&attr)),
            Err(e) => {
                Self::reply_error_attr(
                    &FuseErrorContext {
                        error: &e,
                        operation: "setattr",
                        ino,
                        offset: size,
                    },
                    reply,
                );
            }
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        if self.inner.read_only {
            reply.error(libc::EROFS);
            return;
        }
        let byte_offset = u64::try_from(offset).unwrap_or(0);
        match self.tracked(self.ops().write(NodeId(ino), byte_offset, data)) {
            Ok(written) => {
                self.inner.metrics.record_bytes_written(written);
                reply.written(written);
            }
            Err(e) => {
                Self::reply_error_write(
                    &FuseErrorContext {
                        error: &e,
                        operation: "write",
                        ino,
                        offset: Some(byte_offset),
                    },
                    reply,
                );
            }
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        if self.inner.read_only {
            reply.ok();
            return;
        }
        self.flush_ops("flush", ino, reply);
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _datasync: bool, reply: ReplyEmpty) {
        if self.inner.read_only {
            reply.ok();
            return;
        }
        self.flush_ops("fsync", ino, reply);
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        _flags: i32,
        reply: ReplyCreate,
    ) {
        match self.tracked(self.ops().create(NodeId(parent), name)) {
            Ok(attr) => reply.created(&ATTR_TTL, &self.attr(&attr), 0, 0, 0),
            Err(e) => {
                Self::reply_error_create(
                    &FuseErrorContext {
                        error: &e,
                        operation: "create",
                        ino: parent,
                        offset: None,
                    },
                    reply,
                );
            }
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        match self.tracked(self.ops().mkdir(NodeId(parent), name)) {
            Ok(attr) => reply.entry(&ATTR_TTL, &self.attr(&attr), 0),
            Err(e) => {
                Self::reply_error_entry(
                    &FuseErrorContext {
                        error: &e,
                        operation: "mkdir",
                        ino: parent,
                        offset: None,
                    },
                    reply,
                );
            }
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.tracked(self.ops().unlink(NodeId(parent), name)) {
            Ok(()) => reply.ok(),
            Err(e) => {
                Self::reply_error_empty(
                    &FuseErrorContext {
                        error: &e,
                        operation: "unlink",
                        ino: parent,
                        offset: None,
                    },
                    reply,
                );
            }
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.tracked(self.ops().rmdir(NodeId(parent), name)) {
            Ok(()) => reply.ok(),
            Err(e) => {
                Self::reply_error_empty(
                    &FuseErrorContext {
                        error: &e,
                        operation: "rmdir",
                        ino: parent,
                        offset: None,
                    },
                    reply,
                );
            }
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        match self.tracked(
            self.ops()
                .rename(NodeId(parent), name, NodeId(newparent), newname),
        ) {
            Ok(()) => reply.ok(),
            Err(e) => {
                Self::reply_error_empty(
                    &FuseErrorContext {
                        error: &e,
                        operation: "rename",
                        ino: parent,
                        offset: None,
                    },
                    reply,
                );
            }
        }
    }
}

// ── Mount entrypoint ────────────────────────────────────────────────────────

fn build_mount_options(options: &MountOptions) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::FSName("fmapfs".to_owned()),
        MountOption::Subtype("fmapfs".to_owned()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ];

    if options.read_only {
        opts.push(MountOption::RO);
    }
    if options.allow_other {
        opts.push(MountOption::AllowOther);
    }
    if options.auto_unmount {
        opts.push(MountOption::AutoUnmount);
    }

    opts
}

fn check_mountpoint(mountpoint: &Path) -> Result<(), FuseError> {
    if mountpoint.as_os_str().is_empty() {
        return Err(FuseError::InvalidMountpoint(
            "mountpoint cannot be empty".to_owned(),
        ));
    }
    if !mountpoint.is_dir() {
        return Err(FuseError::InvalidMountpoint(format!(
            "not a directory: {}",
            mountpoint.display()
        )));
    }
    Ok(())
}

/// Mount `ops` at `mountpoint` and serve requests until unmounted.
pub fn mount(
    ops: Arc<dyn FsOps>,
    mountpoint: impl AsRef<Path>,
    options: &MountOptions,
) -> Result<(), FuseError> {
    let mountpoint = mountpoint.as_ref();
    check_mountpoint(mountpoint)?;
    let mut options = options.clone();
    if options.owner.is_none() {
        options.owner = Some(Owner::of_path(mountpoint)?);
    }
    let fuse_opts = build_mount_options(&options);
    debug!(mountpoint = %mountpoint.display(), ?fuse_opts, "mounting");
    let fs = FmapFuse::new(ops, &options);
    fuser::mount2(fs, mountpoint, &fuse_opts)?;
    info!(mountpoint = %mountpoint.display(), "unmounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fmapfs_core::FmapFs;
    use fmapfs_ondisk::{Area, AreaFlags, FMAP_NAME_LEN, Fmap, FmapHeader};

    fn name_field(name: &str) -> [u8; FMAP_NAME_LEN] {
        let mut field = [0_u8; FMAP_NAME_LEN];
        field[..name.len()].copy_from_slice(name.as_bytes());
        field
    }

    fn sample_fs() -> Arc<FmapFs> {
        let fmap = Fmap {
            header: FmapHeader {
                location: 0x100,
                signature: *b"__FMAP__",
                ver_major: 1,
                ver_minor: 1,
                base: 0,
                image_size: 0x400,
                name: name_field("FMAP"),
                nareas: 2,
            },
            areas: vec![
                Area {
                    offset: 0x200,
                    size: 0x20,
                    name: name_field("RO_VPD"),
                    flags: AreaFlags(AreaFlags::RO),
                },
                Area {
                    offset: 0x220,
                    size: 0x20,
                    name: name_field("RW_VPD"),
                    flags: AreaFlags(0),
                },
            ],
        };
        let mut image = vec![0_u8; 0x400];
        let table = fmap.encode();
        image[0x100..0x100 + table.len()].copy_from_slice(&table);
        Arc::new(FmapFs::from_bytes(image).expect("sample mounts"))
    }

    fn fuse() -> (Arc<FmapFs>, FmapFuse) {
        let fs = sample_fs();
        let fuse = FmapFuse::new(fs.clone(), &MountOptions::default());
        (fs, fuse)
    }

    #[test]
    fn node_attr_to_file_attr_conversion() {
        let attr = NodeAttr {
            ino: NodeId(42),
            kind: NodeFileType::RegularFile,
            size: 1025,
            perm: 0o644,
            nlink: 1,
            mtime: SystemTime::UNIX_EPOCH,
        };
        let fattr = to_file_attr(&attr, Owner { uid: 1000, gid: 100 });
        assert_eq!(fattr.ino, 42);
        assert_eq!(fattr.size, 1025);
        assert_eq!(fattr.blocks, 3);
        assert_eq!(fattr.kind, FileType::RegularFile);
        assert_eq!(fattr.perm, 0o644);
        assert_eq!((fattr.uid, fattr.gid), (1000, 100));
        assert_eq!(fattr.blksize, BLOCK_SIZE);
        assert_eq!(fattr.flags, 0);
    }

    #[test]
    fn build_mount_options_follows_flags() {
        let opts = build_mount_options(&MountOptions::default());
        assert_eq!(opts.len(), 4);
        assert!(!opts.contains(&MountOption::RO));

        let opts = build_mount_options(&MountOptions {
            read_only: true,
            allow_other: true,
            auto_unmount: true,
            owner: None,
        });
        assert!(opts.contains(&MountOption::RO));
        assert!(opts.contains(&MountOption::AllowOther));
        assert!(opts.contains(&MountOption::AutoUnmount));
    }

    #[test]
    fn mount_rejects_bad_mountpoints() {
        let err = mount(sample_fs(), "", &MountOptions::default()).expect_err("empty");
        assert!(err.to_string().contains("empty"));

        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("nope");
        let err = mount(sample_fs(), &missing, &MountOptions::default()).expect_err("missing");
        assert!(matches!(err, FuseError::InvalidMountpoint(_)));
    }

    #[test]
    fn owner_of_path_reads_metadata() {
        let dir = tempfile::tempdir().expect("tempdir");
        let owner = Owner::of_path(dir.path()).expect("metadata");
        let meta = std::fs::metadata(dir.path()).expect("metadata");
        assert_eq!(owner.uid, meta.uid());
    }

    #[test]
    fn listing_starts_with_dot_entries() {
        let (_, fuse) = fuse();
        let names: Vec<String> = fuse
            .listing(NodeId::ROOT.0, 0)
            .expect("listing")
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, [".", "..", "areas", "name", "raw", "version"]);
    }

    #[test]
    fn listing_resumes_from_cookie() {
        let (fs, fuse) = fuse();
        let areas = fs.lookup_path("/areas").expect("areas").ino.0;
        let all = fuse.listing(areas, 0).expect("listing");
        assert_eq!(all.len(), 4);
        let cookies: Vec<i64> = all.iter().map(|e| e.cookie).collect();
        assert_eq!(cookies, [1, 2, 3, 4]);

        let rest = fuse.listing(areas, 1).expect("listing");
        assert_eq!(rest, all[1..]);
        let rest = fuse.listing(areas, 3).expect("listing");
        assert_eq!(rest, all[3..]);
        assert!(fuse.listing(areas, 4).expect("listing").is_empty());
    }

    #[test]
    fn listing_a_file_is_enotdir() {
        let (fs, fuse) = fuse();
        let raw = fs.lookup_path("/raw").expect("raw").ino.0;
        let err = fuse.listing(raw, 0).expect_err("file");
        assert_eq!(err.to_errno(), libc::ENOTDIR);
    }

    #[test]
    fn setattr_size_goes_through_truncate() {
        let (fs, fuse) = fuse();
        let raw = fs.lookup_path("/areas/RW_VPD/raw").expect("raw").ino.0;
        assert_eq!(fuse.apply_setattr(raw, Some(0x20)).expect("same size").size, 0x20);
        assert_eq!(
            fuse.apply_setattr(raw, Some(0x21)).expect_err("grow").to_errno(),
            libc::EFBIG
        );
        assert_eq!(fuse.apply_setattr(raw, None).expect("no-op").size, 0x20);
    }

    #[test]
    fn metrics_count_outcomes() {
        let (_, fuse) = fuse();
        let ok = fuse.tracked(fuse.ops().getattr(NodeId::ROOT));
        assert!(ok.is_ok());
        let err = fuse.tracked(fuse.ops().getattr(NodeId(999)));
        assert!(err.is_err());
        fuse.metrics().record_bytes_written(7);
        let snap = fuse.metrics().snapshot();
        assert_eq!(snap.requests_total, 2);
        assert_eq!(snap.requests_ok, 1);
        assert_eq!(snap.requests_err, 1);
        assert_eq!(snap.bytes_written, 7);
    }

    #[test]
    fn error_context_maps_errno() {
        let err = FmapfsError::Unsupported("mkdir");
        let ctx = FuseErrorContext {
            error: &err,
            operation: "mkdir",
            ino: 1,
            offset: None,
        };
        assert_eq!(ctx.log_and_errno(), libc::EOPNOTSUPP);
    }
}
