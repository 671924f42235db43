#![forbid(unsafe_code)]
//! GBB area decoder.
//!
//! Exposes the fields of a Google Binary Block as `gbb-data/`:
//!
//! ```text
//! gbb-data/
//!   hwid            NUL-terminated string, fixed capacity
//!   root-key        raw
//!   bmpfv           raw
//!   recovery-key    raw
//!   hwid-digest     raw, 32 bytes, version 1.2 and later
//!   flags/<name>    one "0"/"1" file per known flag bit
//! ```

use crate::decode::{AreaContext, AreaDecoder, DecodeError, Subtree};
use crate::view::{CStringView, FlagBitView, RawView};
use fmapfs_ondisk::{GBB_FLAG_BITS, GBB_FLAGS_OFFSET, GBB_HEADER_SIZE, GbbHeader};
use fmapfs_types::{ByteRange, usize_to_u64};
use std::sync::Arc;
use tracing::debug;

const SUPPORTED_MAJOR: u16 = 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct GbbDecoder;

impl GbbDecoder {
    fn field(
        area: ByteRange,
        name: &'static str,
        rel: ByteRange,
    ) -> Result<ByteRange, DecodeError> {
        area.subrange(rel.offset, rel.len)
            .ok_or(DecodeError::FieldOutOfRange {
                field: name,
                offset: rel.offset,
                size: rel.len,
                area_len: area.len,
            })
    }
}

impl AreaDecoder for GbbDecoder {
    fn subtree_name(&self) -> &'static str {
        "gbb-data"
    }

    fn recognizes(&self, area: &[u8]) -> bool {
        GbbHeader::has_signature(area)
    }

    fn decode(&self, ctx: &AreaContext<'_>) -> Result<Subtree, DecodeError> {
        let needed = usize_to_u64(GBB_HEADER_SIZE);
        if ctx.range.len < needed {
            return Err(DecodeError::HeaderTooSmall {
                size: ctx.range.len,
                needed,
            });
        }
        let header = GbbHeader::parse(ctx.bytes)?;
        if header.major_version != SUPPORTED_MAJOR {
            return Err(DecodeError::UnsupportedVersion {
                major: header.major_version,
                minor: header.minor_version,
            });
        }
        let header_size = u64::from(header.header_size);
        if header_size < needed {
            return Err(DecodeError::HeaderTooSmall {
                size: header_size,
                needed,
            });
        }
        if header_size > ctx.range.len {
            return Err(DecodeError::FieldOutOfRange {
                field: "header_size",
                offset: 0,
                size: header_size,
                area_len: ctx.range.len,
            });
        }

        // Validate every locator before building any view.
        let mut fields = Vec::with_capacity(4);
        for (name, locator) in header.locators() {
            fields.push((name, Self::field(ctx.range, name, locator.range())?));
        }
        debug!(
            area = ctx.name,
            major = header.major_version,
            minor = header.minor_version,
            flags = format_args!("{:#x}", header.flags),
            "GBB header accepted"
        );

        let store = ctx.store;
        let mut subtree = Subtree::dir();
        for (name, range) in fields {
            subtree = if name == "hwid" {
                subtree.with_file(name, Arc::new(CStringView::new(store.clone(), range, name)))
            } else {
                subtree.with_file(name, Arc::new(RawView::new(store.clone(), range)))
            };
        }
        if header.has_hwid_digest() {
            let digest = Self::field(ctx.range, "hwid-digest", GbbHeader::hwid_digest_range())?;
            subtree = subtree.with_file("hwid-digest", Arc::new(RawView::new(store.clone(), digest)));
        }

        let word_at = ctx.range.offset + usize_to_u64(GBB_FLAGS_OFFSET);
        let flags = GBB_FLAG_BITS
            .iter()
            .fold(Subtree::dir(), |dir, &(bit, name)| {
                dir.with_file(name, Arc::new(FlagBitView::new(store.clone(), word_at, bit)))
            });
        Ok(subtree.with_dir("flags", flags))
    }
}
