#![forbid(unsafe_code)]
//! fmapfs core: the virtual tree over an FMAP image and the filesystem
//! operations the FUSE adapter dispatches to.
//!
//! [`FmapFs`] parses an image, builds an immutable [`Tree`] of views over a
//! shared [`BackingStore`], and implements [`FsOps`] against it. The FUSE
//! layer (`fmapfs-fuse`) only translates between kernel requests and this
//! trait, so everything here is testable without a mount.

pub mod builder;
pub mod decode;
pub mod gbb;
pub mod tree;
pub mod view;

pub use builder::build_tree;
pub use decode::{AreaContext, AreaDecoder, DecodeError, DecoderRegistry, Subtree};
pub use gbb::GbbDecoder;
pub use tree::{Node, NodeKind, Tree, TreeBuilder};
pub use view::{CStringView, FileView, FlagBitView, RawView, VersionView};

use fmapfs_block::{BackingStore, ImageFile};
use fmapfs_error::{FmapfsError, Result};
use fmapfs_ondisk::{Fmap, FmapParseError, parse_fmap};
use fmapfs_types::NodeId;
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::Path;
use std::time::SystemTime;
use thiserror::Error;
use tracing::{debug, info};

/// File type of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FileType {
    RegularFile,
    Directory,
}

/// Attributes returned by [`FsOps::getattr`] and [`FsOps::lookup`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAttr {
    pub ino: NodeId,
    pub kind: FileType,
    /// Current size in bytes; `0` for directories.
    pub size: u64,
    /// Permission bits (lower 12 bits of mode).
    pub perm: u16,
    pub nlink: u32,
    /// Mount time. The tree has no per-node timestamps.
    pub mtime: SystemTime,
}

/// One entry from a directory listing.
///
/// `offset` is the cookie to pass back to [`FsOps::readdir`] to resume after
/// this entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub ino: NodeId,
    pub offset: u64,
    pub kind: FileType,
    pub name: String,
}

/// Filesystem operations over the virtual tree.
///
/// All methods take `&self`; implementations are shared across FUSE worker
/// threads.
pub trait FsOps: Send + Sync {
    /// Attributes of `ino`. `NotFound` for unknown ids.
    fn getattr(&self, ino: NodeId) -> Result<NodeAttr>;

    /// Attributes of the child `name` of directory `parent`.
    ///
    /// Returns `NotDirectory` if `parent` is a file and `NotFound` if the
    /// name does not exist.
    fn lookup(&self, parent: NodeId, name: &OsStr) -> Result<NodeAttr>;

    /// Directory entries after cookie `offset` (0 for the first call).
    ///
    /// An empty result marks the end of the directory.
    fn readdir(&self, ino: NodeId, offset: u64) -> Result<Vec<DirEntry>>;

    /// Up to `size` bytes at `offset`. Empty at or past the end of file.
    fn read(&self, ino: NodeId, offset: u64, size: u32) -> Result<Vec<u8>>;

    /// Write `data` at `offset`, returning the number of bytes accepted.
    fn write(&self, ino: NodeId, offset: u64, data: &[u8]) -> Result<u32>;

    /// Resize `ino`. Only the current size is accepted.
    fn truncate(&self, ino: NodeId, size: u64) -> Result<NodeAttr>;

    /// Make completed writes durable. Default is a no-op.
    fn flush(&self) -> Result<()> {
        Ok(())
    }

    fn create(&self, _parent: NodeId, _name: &OsStr) -> Result<NodeAttr> {
        Err(FmapfsError::Unsupported("create"))
    }

    fn mkdir(&self, _parent: NodeId, _name: &OsStr) -> Result<NodeAttr> {
        Err(FmapfsError::Unsupported("mkdir"))
    }

    fn unlink(&self, _parent: NodeId, _name: &OsStr) -> Result<()> {
        Err(FmapfsError::Unsupported("unlink"))
    }

    fn rmdir(&self, _parent: NodeId, _name: &OsStr) -> Result<()> {
        Err(FmapfsError::Unsupported("rmdir"))
    }

    fn rename(
        &self,
        _parent: NodeId,
        _name: &OsStr,
        _new_parent: NodeId,
        _new_name: &OsStr,
    ) -> Result<()> {
        Err(FmapfsError::Unsupported("rename"))
    }
}

/// Why an image could not be mounted.
#[derive(Debug, Error)]
pub enum MountError {
    /// The image file could not be opened or read.
    #[error("cannot read image: {0}")]
    Image(#[source] FmapfsError),
    /// The bytes are not a usable FMAP image.
    #[error("invalid FMAP image: {0}")]
    Parse(#[from] FmapParseError),
    #[error("cannot build tree: {0}")]
    Build(#[source] FmapfsError),
}

const DIR_PERM: u16 = 0o755;
const FILE_PERM: u16 = 0o644;

/// A mounted FMAP image.
#[derive(Debug)]
pub struct FmapFs {
    fmap: Fmap,
    store: BackingStore,
    tree: Tree,
    image: Option<ImageFile>,
    mounted_at: SystemTime,
}

impl FmapFs {
    /// Open and parse the image at `path` with the built-in decoders.
    pub fn open(path: impl AsRef<Path>) -> std::result::Result<Self, MountError> {
        Self::open_with_decoders(path, &DecoderRegistry::default())
    }

    pub fn open_with_decoders(
        path: impl AsRef<Path>,
        decoders: &DecoderRegistry,
    ) -> std::result::Result<Self, MountError> {
        let image = ImageFile::open(path).map_err(MountError::Image)?;
        let store = image.load_store().map_err(MountError::Image)?;
        let mut fs = Self::from_store(store, decoders)?;
        info!(
            path = %image.path().display(),
            len = image.len_bytes(),
            writable = image.is_writable(),
            areas = fs.fmap.areas.len(),
            "image mounted"
        );
        fs.image = Some(image);
        Ok(fs)
    }

    /// Mount an in-memory image. Edits are never persisted.
    pub fn from_bytes(bytes: Vec<u8>) -> std::result::Result<Self, MountError> {
        Self::from_store(BackingStore::new(bytes), &DecoderRegistry::default())
    }

    pub fn from_store(
        store: BackingStore,
        decoders: &DecoderRegistry,
    ) -> std::result::Result<Self, MountError> {
        let fmap = store.with_bytes(parse_fmap)?;
        let tree = build_tree(&fmap, &store, decoders).map_err(MountError::Build)?;
        debug!(nodes = tree.len(), "tree built");
        Ok(Self {
            fmap,
            store,
            tree,
            image: None,
            mounted_at: SystemTime::now(),
        })
    }

    #[must_use]
    pub fn fmap(&self) -> &Fmap {
        &self.fmap
    }

    #[must_use]
    pub fn store(&self) -> &BackingStore {
        &self.store
    }

    #[must_use]
    pub fn tree(&self) -> &Tree {
        &self.tree
    }

    #[must_use]
    pub fn image(&self) -> Option<&ImageFile> {
        self.image.as_ref()
    }

    /// Resolve a slash-separated path from the root.
    pub fn lookup_path(&self, path: &str) -> Result<NodeAttr> {
        let id = self.tree.lookup_path(path)?;
        self.getattr(id)
    }

    /// Read a whole file by path.
    pub fn read_path(&self, path: &str) -> Result<Vec<u8>> {
        let attr = self.lookup_path(path)?;
        let len = u32::try_from(attr.size).unwrap_or(u32::MAX);
        self.read(attr.ino, 0, len)
    }

    pub fn write_path(&self, path: &str, offset: u64, data: &[u8]) -> Result<u32> {
        let id = self.tree.lookup_path(path)?;
        self.write(id, offset, data)
    }

    /// Write the store back to the image file if it has unsaved edits.
    ///
    /// Returns whether anything was written. In-memory mounts never write.
    pub fn persist(&self) -> Result<bool> {
        match &self.image {
            Some(image) => image.persist(&self.store),
            None => Ok(false),
        }
    }

    fn attr(&self, ino: NodeId, node: &Node) -> Result<NodeAttr> {
        let (kind, size, perm, nlink) = match &node.kind {
            NodeKind::Directory(children) => {
                let subdirs = children
                    .values()
                    .filter(|child| self.tree.get(**child).is_ok_and(Node::is_dir))
                    .count();
                let nlink = u32::try_from(subdirs + 2).unwrap_or(u32::MAX);
                (FileType::Directory, 0, DIR_PERM, nlink)
            }
            NodeKind::File(view) => (FileType::RegularFile, view.size()?, FILE_PERM, 1),
        };
        Ok(NodeAttr {
            ino,
            kind,
            size,
            perm,
            nlink,
            mtime: self.mounted_at,
        })
    }
}

impl FsOps for FmapFs {
    fn getattr(&self, ino: NodeId) -> Result<NodeAttr> {
        let node = self.tree.get(ino)?;
        self.attr(ino, node)
    }

    fn lookup(&self, parent: NodeId, name: &OsStr) -> Result<NodeAttr> {
        let name = name
            .to_str()
            .ok_or_else(|| FmapfsError::NotFound(name.to_string_lossy().into_owned()))?;
        let id = self.tree.lookup_child(parent, name)?;
        self.getattr(id)
    }

    fn readdir(&self, ino: NodeId, offset: u64) -> Result<Vec<DirEntry>> {
        let children = self.tree.get(ino)?.children()?;
        let skip = usize::try_from(offset).unwrap_or(usize::MAX);
        children
            .iter()
            .enumerate()
            .skip(skip)
            .map(|(idx, (name, &child))| {
                let kind = if self.tree.get(child)?.is_dir() {
                    FileType::Directory
                } else {
                    FileType::RegularFile
                };
                Ok(DirEntry {
                    ino: child,
                    offset: fmapfs_types::usize_to_u64(idx + 1),
                    kind,
                    name: name.clone(),
                })
            })
            .collect()
    }

    fn read(&self, ino: NodeId, offset: u64, size: u32) -> Result<Vec<u8>> {
        self.tree.get(ino)?.file()?.read(offset, size)
    }

    fn write(&self, ino: NodeId, offset: u64, data: &[u8]) -> Result<u32> {
        let written = self.tree.get(ino)?.file()?.write(offset, data)?;
        debug!(ino = ino.0, offset, len = data.len(), written, "write");
        Ok(written)
    }

    fn truncate(&self, ino: NodeId, size: u64) -> Result<NodeAttr> {
        let node = self.tree.get(ino)?;
        let current = node.file()?.size()?;
        if size > current {
            return Err(FmapfsError::FileTooBig {
                detail: format!("cannot grow {} from {current} to {size} bytes", node.name),
            });
        }
        if size < current {
            return Err(FmapfsError::InvalidArgument(format!(
                "cannot shrink {} from {current} to {size} bytes",
                node.name
            )));
        }
        self.attr(ino, node)
    }

    fn flush(&self) -> Result<()> {
        self.persist().map(|_| ())
    }
}
