#![forbid(unsafe_code)]
//! On-disk format parsing for FMAP firmware images.
//!
//! Pure parsing crate with no I/O. Locates and parses the
//! Flashmap header and area table, and the Google Binary Block header that
//! some areas carry.

pub mod fmap;
pub mod gbb;

pub use fmap::{
    Area, AreaFlags, FMAP_AREA_SIZE, FMAP_HEADER_SIZE, FMAP_NAME_LEN, FMAP_NAME_OFFSET,
    FMAP_SIGNATURE, FMAP_VER_MAJOR_OFFSET, FMAP_VER_MINOR_OFFSET, Fmap, FmapHeader,
    FmapParseError, find_signature, parse_fmap,
};
pub use gbb::{
    GBB_FLAG_BITS, GBB_FLAGS_OFFSET, GBB_HEADER_SIZE, GBB_SIGNATURE, GbbFieldLocator, GbbHeader,
};
