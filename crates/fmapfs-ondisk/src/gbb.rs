#![forbid(unsafe_code)]
//! Google Binary Block (GBB) header.
//!
//! The GBB lives inside one FMAP area and carries the hardware ID, the root
//! and recovery keys, the bitmap firmware volume, and a word of boot flags.
//! All locator offsets are relative to the start of the GBB area.

use fmapfs_types::{ByteRange, ParseError, ensure_slice, read_fixed, read_le_u16, read_le_u32};
use serde::{Deserialize, Serialize};

/// GBB signature: `"$GBB"`.
pub const GBB_SIGNATURE: &[u8; 4] = b"$GBB";
/// Size of the GBB header on disk.
pub const GBB_HEADER_SIZE: usize = 128;
/// Offset of the little-endian `flags` word within the header.
pub const GBB_FLAGS_OFFSET: usize = 0x0C;

const GBB_MAJOR_OFFSET: usize = 0x04;
const GBB_MINOR_OFFSET: usize = 0x06;
const GBB_HEADER_SIZE_OFFSET: usize = 0x08;
const GBB_HWID_OFFSET: usize = 0x10;
const GBB_ROOTKEY_OFFSET: usize = 0x18;
const GBB_BMPFV_OFFSET: usize = 0x20;
const GBB_RECOVERY_KEY_OFFSET: usize = 0x28;
const GBB_HWID_DIGEST_OFFSET: usize = 0x30;
const GBB_HWID_DIGEST_LEN: usize = 32;

/// Known GBB flag bits and the file name each is exposed under.
pub const GBB_FLAG_BITS: [(u32, &str); 16] = [
    (0, "dev-screen-short-delay"),
    (1, "load-option-roms"),
    (2, "enable-alternate-os"),
    (3, "force-dev-mode"),
    (4, "force-dev-boot-usb"),
    (5, "disable-fw-rollback-check"),
    (6, "enter-triggers-tonorm"),
    (7, "force-dev-boot-altfw"),
    (8, "running-faft"),
    (9, "disable-ec-software-sync"),
    (10, "default-boot-altfw"),
    (11, "disable-auxfw-software-sync"),
    (12, "disable-shutdown-on-lid-close"),
    (14, "force-manual-recovery"),
    (15, "disable-fwmp"),
    (16, "enable-udc"),
];

/// `(offset, size)` of one GBB field, relative to the GBB area start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GbbFieldLocator {
    pub offset: u32,
    pub size: u32,
}

impl GbbFieldLocator {
    fn parse(header: &[u8], at: usize) -> Result<Self, ParseError> {
        Ok(Self {
            offset: read_le_u32(header, at)?,
            size: read_le_u32(header, at + 4)?,
        })
    }

    /// Range relative to the GBB area.
    #[must_use]
    pub fn range(self) -> ByteRange {
        ByteRange::new(u64::from(self.offset), u64::from(self.size))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GbbHeader {
    pub major_version: u16,
    pub minor_version: u16,
    pub header_size: u32,
    pub flags: u32,
    pub hwid: GbbFieldLocator,
    pub rootkey: GbbFieldLocator,
    pub bmpfv: GbbFieldLocator,
    pub recovery_key: GbbFieldLocator,
    pub hwid_digest: [u8; GBB_HWID_DIGEST_LEN],
}

impl GbbHeader {
    /// Whether `area` starts with the GBB signature.
    #[must_use]
    pub fn has_signature(area: &[u8]) -> bool {
        area.starts_with(GBB_SIGNATURE)
    }

    /// Parse the header at the start of a GBB area.
    ///
    /// Only structure is checked here (length and signature); version and
    /// locator ranges are policy for the caller.
    pub fn parse(area: &[u8]) -> Result<Self, ParseError> {
        let header = ensure_slice(area, 0, GBB_HEADER_SIZE)?;
        let signature = read_fixed::<4>(header, 0)?;
        if &signature != GBB_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(u32::from_le_bytes(*GBB_SIGNATURE)),
                actual: u64::from(u32::from_le_bytes(signature)),
            });
        }

        Ok(Self {
            major_version: read_le_u16(header, GBB_MAJOR_OFFSET)?,
            minor_version: read_le_u16(header, GBB_MINOR_OFFSET)?,
            header_size: read_le_u32(header, GBB_HEADER_SIZE_OFFSET)?,
            flags: read_le_u32(header, GBB_FLAGS_OFFSET)?,
            hwid: GbbFieldLocator::parse(header, GBB_HWID_OFFSET)?,
            rootkey: GbbFieldLocator::parse(header, GBB_ROOTKEY_OFFSET)?,
            bmpfv: GbbFieldLocator::parse(header, GBB_BMPFV_OFFSET)?,
            recovery_key: GbbFieldLocator::parse(header, GBB_RECOVERY_KEY_OFFSET)?,
            hwid_digest: read_fixed::<GBB_HWID_DIGEST_LEN>(header, GBB_HWID_DIGEST_OFFSET)?,
        })
    }

    /// The HWID digest field was added in version 1.2.
    #[must_use]
    pub fn has_hwid_digest(&self) -> bool {
        self.major_version > 1 || self.minor_version >= 2
    }

    /// Range of the HWID digest relative to the GBB area.
    #[must_use]
    pub fn hwid_digest_range() -> ByteRange {
        ByteRange::new(
            fmapfs_types::usize_to_u64(GBB_HWID_DIGEST_OFFSET),
            fmapfs_types::usize_to_u64(GBB_HWID_DIGEST_LEN),
        )
    }

    /// The locators in header order, with their exposed file names.
    #[must_use]
    pub fn locators(&self) -> [(&'static str, GbbFieldLocator); 4] {
        [
            ("hwid", self.hwid),
            ("root-key", self.rootkey),
            ("bmpfv", self.bmpfv),
            ("recovery-key", self.recovery_key),
        ]
    }
}
