#![forbid(unsafe_code)]
//! Pluggable area decoders.
//!
//! A decoder looks at the bytes of one FMAP area and, if it recognizes the
//! content, contributes a named subtree of extra views. Recognition is by
//! content only; the area name is informational.

use crate::gbb::GbbDecoder;
use crate::view::FileView;
use fmapfs_block::BackingStore;
use fmapfs_types::{ByteRange, ParseError};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Why a decoder declined an area it had recognized.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unsupported version {major}.{minor}")]
    UnsupportedVersion { major: u16, minor: u16 },
    #[error("{size} bytes available for a {needed}-byte header")]
    HeaderTooSmall { size: u64, needed: u64 },
    #[error("field {field} ({offset:#x}+{size:#x}) exceeds area of {area_len} bytes")]
    FieldOutOfRange {
        field: &'static str,
        offset: u64,
        size: u64,
        area_len: u64,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
}

/// Views a decoder attaches under an area directory.
#[derive(Debug)]
pub enum Subtree {
    Dir(BTreeMap<String, Subtree>),
    File(Arc<dyn FileView>),
}

impl Subtree {
    #[must_use]
    pub fn dir() -> Self {
        Self::Dir(BTreeMap::new())
    }

    /// Add a file entry. No-op on a `File` subtree.
    #[must_use]
    pub fn with_file(self, name: &str, view: Arc<dyn FileView>) -> Self {
        self.with_entry(name, Self::File(view))
    }

    #[must_use]
    pub fn with_dir(self, name: &str, dir: Subtree) -> Self {
        self.with_entry(name, dir)
    }

    fn with_entry(mut self, name: &str, entry: Subtree) -> Self {
        if let Self::Dir(entries) = &mut self {
            entries.insert(name.to_owned(), entry);
        }
        self
    }
}

/// What a decoder gets to look at.
#[derive(Debug, Clone, Copy)]
pub struct AreaContext<'a> {
    pub name: &'a str,
    /// Absolute location of the area in the image.
    pub range: ByteRange,
    /// Area bytes as of mount time.
    pub bytes: &'a [u8],
    pub store: &'a BackingStore,
}

pub trait AreaDecoder: Send + Sync {
    /// Directory name the subtree is attached under.
    fn subtree_name(&self) -> &'static str;

    /// Content sniff. Cheap; must not fail.
    fn recognizes(&self, area: &[u8]) -> bool;

    /// Build the subtree for a recognized area.
    fn decode(&self, ctx: &AreaContext<'_>) -> Result<Subtree, DecodeError>;
}

/// Ordered set of decoders consulted for every area.
pub struct DecoderRegistry {
    decoders: Vec<Box<dyn AreaDecoder>>,
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.decoders.iter().map(|d| d.subtree_name()).collect();
        f.debug_struct("DecoderRegistry")
            .field("decoders", &names)
            .finish()
    }
}

impl Default for DecoderRegistry {
    /// The built-in decoders (currently GBB only).
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(GbbDecoder));
        registry
    }
}

impl DecoderRegistry {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            decoders: Vec::new(),
        }
    }

    pub fn register(&mut self, decoder: Box<dyn AreaDecoder>) {
        self.decoders.push(decoder);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }

    /// Run every matching decoder over one area.
    ///
    /// Declines are logged and skipped; they never fail the mount.
    #[must_use]
    pub fn decode_area(&self, ctx: &AreaContext<'_>) -> Vec<(&'static str, Subtree)> {
        let mut attached = Vec::new();
        for decoder in &self.decoders {
            if !decoder.recognizes(ctx.bytes) {
                continue;
            }
            let subtree_name = decoder.subtree_name();
            match decoder.decode(ctx) {
                Ok(subtree) => {
                    info!(area = ctx.name, decoder = subtree_name, "area decoded");
                    attached.push((subtree_name, subtree));
                }
                Err(err) => {
                    warn!(
                        area = ctx.name,
                        decoder = subtree_name,
                        error = %err,
                        "decoder declined area"
                    );
                }
            }
        }
        attached
    }
}
