#![forbid(unsafe_code)]

use fmapfs_types::{
    ByteRange, ParseError, read_fixed, read_le_u16, read_le_u32, read_le_u64, read_u8,
    trim_nul_padded,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// FMAP signature: `"__FMAP__"`.
pub const FMAP_SIGNATURE: &[u8; 8] = b"__FMAP__";
/// Width of the header and area name fields.
pub const FMAP_NAME_LEN: usize = 32;
/// Size of the FMAP header on disk (signature through nareas).
pub const FMAP_HEADER_SIZE: usize = 56;
/// Size of one area record on disk.
pub const FMAP_AREA_SIZE: usize = 42;

/// Offset of `ver_major` within the header.
pub const FMAP_VER_MAJOR_OFFSET: usize = 0x08;
/// Offset of `ver_minor` within the header.
pub const FMAP_VER_MINOR_OFFSET: usize = 0x09;
const FMAP_BASE_OFFSET: usize = 0x0A;
const FMAP_SIZE_OFFSET: usize = 0x12;
/// Offset of the 32-byte `name` field within the header.
pub const FMAP_NAME_OFFSET: usize = 0x16;
const FMAP_NAREAS_OFFSET: usize = 0x36;

const AREA_OFFSET_OFFSET: usize = 0x00;
const AREA_SIZE_OFFSET: usize = 0x04;
const AREA_NAME_OFFSET: usize = 0x08;
const AREA_FLAGS_OFFSET: usize = 0x28;

/// Fatal FMAP parse failures. Any of these aborts the mount.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FmapParseError {
    #[error("no FMAP signature found in {image_len}-byte image")]
    NoSignature { image_len: usize },
    #[error("FMAP {what} truncated: need {needed} bytes at offset {offset:#x}, image is {image_len} bytes")]
    Truncated {
        what: &'static str,
        needed: usize,
        offset: usize,
        image_len: usize,
    },
    #[error("FMAP declares image size {declared:#x} but image is only {actual:#x} bytes")]
    ImageTooSmall { declared: u32, actual: usize },
    #[error(
        "FMAP area #{index} {name:?} ({offset:#x}+{size:#x}) exceeds image bounds ({limit:#x})"
    )]
    AreaOutOfBounds {
        index: usize,
        name: String,
        offset: u32,
        size: u32,
        limit: u64,
    },
}

/// Area flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AreaFlags(pub u16);

impl AreaFlags {
    pub const STATIC: u16 = 1 << 0;
    pub const COMPRESSED: u16 = 1 << 1;
    pub const RO: u16 = 1 << 2;
    pub const PRESERVE: u16 = 1 << 3;

    const NAMES: [(u16, &'static str); 4] = [
        (Self::STATIC, "static"),
        (Self::COMPRESSED, "compressed"),
        (Self::RO, "ro"),
        (Self::PRESERVE, "preserve"),
    ];

    #[must_use]
    pub fn contains(self, bit: u16) -> bool {
        self.0 & bit == bit
    }

    /// Names of the known bits that are set, in bit order.
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(bit, _)| self.contains(*bit))
            .map(|(_, name)| *name)
            .collect()
    }
}

/// Parsed FMAP header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FmapHeader {
    /// Byte offset of the signature within the image.
    pub location: usize,
    pub signature: [u8; 8],
    pub ver_major: u8,
    pub ver_minor: u8,
    pub base: u64,
    /// Declared size of the firmware image in bytes.
    pub image_size: u32,
    pub name: [u8; FMAP_NAME_LEN],
    pub nareas: u16,
}

impl FmapHeader {
    /// Parse the header found at `location` in `image`.
    pub fn parse_at(image: &[u8], location: usize) -> Result<Self, ParseError> {
        let region = fmapfs_types::ensure_slice(image, location, FMAP_HEADER_SIZE)?;
        Ok(Self {
            location,
            signature: read_fixed::<8>(region, 0)?,
            ver_major: read_u8(region, FMAP_VER_MAJOR_OFFSET)?,
            ver_minor: read_u8(region, FMAP_VER_MINOR_OFFSET)?,
            base: read_le_u64(region, FMAP_BASE_OFFSET)?,
            image_size: read_le_u32(region, FMAP_SIZE_OFFSET)?,
            name: read_fixed::<FMAP_NAME_LEN>(region, FMAP_NAME_OFFSET)?,
            nareas: read_le_u16(region, FMAP_NAREAS_OFFSET)?,
        })
    }

    #[must_use]
    pub fn name_str(&self) -> String {
        trim_nul_padded(&self.name)
    }

    /// Absolute image range of the header's name field.
    #[must_use]
    pub fn name_range(&self) -> ByteRange {
        ByteRange::new(
            fmapfs_types::usize_to_u64(self.location + FMAP_NAME_OFFSET),
            fmapfs_types::usize_to_u64(FMAP_NAME_LEN),
        )
    }

    /// Absolute image offsets of the major and minor version bytes.
    #[must_use]
    pub fn version_offsets(&self) -> (u64, u64) {
        (
            fmapfs_types::usize_to_u64(self.location + FMAP_VER_MAJOR_OFFSET),
            fmapfs_types::usize_to_u64(self.location + FMAP_VER_MINOR_OFFSET),
        )
    }

    /// Serialize back into the on-disk layout.
    #[must_use]
    pub fn encode(&self) -> [u8; FMAP_HEADER_SIZE] {
        let mut out = [0_u8; FMAP_HEADER_SIZE];
        out[..8].copy_from_slice(&self.signature);
        out[FMAP_VER_MAJOR_OFFSET] = self.ver_major;
        out[FMAP_VER_MINOR_OFFSET] = self.ver_minor;
        out[FMAP_BASE_OFFSET..FMAP_SIZE_OFFSET].copy_from_slice(&self.base.to_le_bytes());
        out[FMAP_SIZE_OFFSET..FMAP_NAME_OFFSET].copy_from_slice(&self.image_size.to_le_bytes());
        out[FMAP_NAME_OFFSET..FMAP_NAREAS_OFFSET].copy_from_slice(&self.name);
        out[FMAP_NAREAS_OFFSET..].copy_from_slice(&self.nareas.to_le_bytes());
        out
    }
}

/// One named region of the image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Area {
    pub offset: u32,
    pub size: u32,
    pub name: [u8; FMAP_NAME_LEN],
    pub flags: AreaFlags,
}

impl Area {
    pub fn parse(record: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            offset: read_le_u32(record, AREA_OFFSET_OFFSET)?,
            size: read_le_u32(record, AREA_SIZE_OFFSET)?,
            name: read_fixed::<FMAP_NAME_LEN>(record, AREA_NAME_OFFSET)?,
            flags: AreaFlags(read_le_u16(record, AREA_FLAGS_OFFSET)?),
        })
    }

    /// Area name trimmed at the first NUL.
    #[must_use]
    pub fn name_str(&self) -> String {
        trim_nul_padded(&self.name)
    }

    #[must_use]
    pub fn range(&self) -> ByteRange {
        ByteRange::new(u64::from(self.offset), u64::from(self.size))
    }

    #[must_use]
    pub fn encode(&self) -> [u8; FMAP_AREA_SIZE] {
        let mut out = [0_u8; FMAP_AREA_SIZE];
        out[AREA_OFFSET_OFFSET..AREA_SIZE_OFFSET].copy_from_slice(&self.offset.to_le_bytes());
        out[AREA_SIZE_OFFSET..AREA_NAME_OFFSET].copy_from_slice(&self.size.to_le_bytes());
        out[AREA_NAME_OFFSET..AREA_FLAGS_OFFSET].copy_from_slice(&self.name);
        out[AREA_FLAGS_OFFSET..].copy_from_slice(&self.flags.0.to_le_bytes());
        out
    }
}

/// A parsed FMAP: header plus areas in on-disk order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fmap {
    pub header: FmapHeader,
    pub areas: Vec<Area>,
}

impl Fmap {
    /// Total on-disk size of the header and area table.
    #[must_use]
    pub fn table_len(&self) -> usize {
        FMAP_HEADER_SIZE + self.areas.len() * FMAP_AREA_SIZE
    }

    /// Serialize header and area table back into their on-disk layout.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.table_len());
        out.extend_from_slice(&self.header.encode());
        for area in &self.areas {
            out.extend_from_slice(&area.encode());
        }
        out
    }
}

/// Offset of the first FMAP signature in `image`, scanning upward from 0.
#[must_use]
pub fn find_signature(image: &[u8]) -> Option<usize> {
    memchr::memmem::find(image, FMAP_SIGNATURE)
}

/// Locate, parse, and bounds-check the FMAP in `image`.
pub fn parse_fmap(image: &[u8]) -> Result<Fmap, FmapParseError> {
    let image_len = image.len();
    let location = find_signature(image).ok_or(FmapParseError::NoSignature { image_len })?;
    debug!(location = format_args!("{location:#x}"), "FMAP signature found");

    let header =
        FmapHeader::parse_at(image, location).map_err(|_| FmapParseError::Truncated {
            what: "header",
            needed: FMAP_HEADER_SIZE,
            offset: location,
            image_len,
        })?;
    debug!(
        version = format_args!("{}.{}", header.ver_major, header.ver_minor),
        base = format_args!("{:#018x}", header.base),
        image_size = format_args!("{:#010x}", header.image_size),
        name = %header.name_str(),
        nareas = header.nareas,
        "FMAP header"
    );

    if usize::try_from(header.image_size).map_or(true, |declared| declared > image_len) {
        return Err(FmapParseError::ImageTooSmall {
            declared: header.image_size,
            actual: image_len,
        });
    }

    let table_offset = location + FMAP_HEADER_SIZE;
    let table_len = usize::from(header.nareas) * FMAP_AREA_SIZE;
    let table = fmapfs_types::ensure_slice(image, table_offset, table_len).map_err(|_| {
        FmapParseError::Truncated {
            what: "area table",
            needed: table_len,
            offset: table_offset,
            image_len,
        }
    })?;

    let limit = u64::from(header.image_size).min(fmapfs_types::usize_to_u64(image_len));
    let mut areas = Vec::with_capacity(usize::from(header.nareas));
    for (index, record) in table.chunks_exact(FMAP_AREA_SIZE).enumerate() {
        let area = Area::parse(record).map_err(|_| FmapParseError::Truncated {
            what: "area record",
            needed: FMAP_AREA_SIZE,
            offset: table_offset + index * FMAP_AREA_SIZE,
            image_len,
        })?;
        debug!(
            index,
            name = %area.name_str(),
            offset = format_args!("{:#010x}", area.offset),
            size = format_args!("{:#010x}", area.size),
            flags = format_args!("{:#x}", area.flags.0),
            "FMAP area"
        );
        if !area.range().fits_within(limit) {
            return Err(FmapParseError::AreaOutOfBounds {
                index,
                name: area.name_str(),
                offset: area.offset,
                size: area.size,
                limit,
            });
        }
        areas.push(area);
    }

    Ok(Fmap { header, areas })
}
