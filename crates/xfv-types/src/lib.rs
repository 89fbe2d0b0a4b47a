#![forbid(unsafe_code)]
//! Parse-layer primitives shared by every xfv crate.
//!
//! Nothing in here performs I/O. The helpers read fixed-width fields out of
//! byte slices at explicit offsets, and the decoders turn packed on-disk
//! values (inode numbers, UUIDs, magic tags) into something a human or a
//! caller can use.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// "XFSB"
pub const XFS_SB_MAGIC: u32 = 0x5846_5342;
/// "XAGI"
pub const XFS_AGI_MAGIC: u32 = 0x5841_4749;

/// Decoded span of the primary superblock, including the metadir extension.
pub const XFS_SB_SIZE: usize = 288;
/// Decoded span of an AGI header.
pub const XFS_AGI_SIZE: usize = 344;
/// How many bytes are read from the start of a device to decode the superblock.
pub const XFS_SB_READ_LEN: usize = 4096;

pub const XFS_AGI_UNLINKED_BUCKETS: usize = 64;
pub const XFS_LABEL_MAX: usize = 12;

/// Empty AG-relative inode pointer (unused unlinked bucket, unused `dirino`).
pub const NULLAGINO: u32 = 0xFFFF_FFFF;

pub const XFS_MIN_BLOCKSIZE: u32 = 512;
pub const XFS_MAX_BLOCKSIZE: u32 = 65536;
pub const XFS_MIN_SECTORSIZE: u32 = 512;
pub const XFS_MAX_SECTORSIZE: u32 = 32768;

/// Bit width of the in-block slot of a fixed-layout inode number.
pub const INO_SLOT_BITS: u32 = 9;
/// Bit width of the AG-relative block of a fixed-layout inode number.
pub const INO_BLOCK_BITS: u32 = 23;
/// Bit position of the allocation-group number.
pub const INO_AG_SHIFT: u32 = 32;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error(
        "invalid magic: expected {expected:#x} ({}), got {actual:#x} ({})",
        magic_as_text(*.expected),
        magic_as_text(*.actual)
    )]
    InvalidMagic { expected: u32, actual: u32 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

// ── Geometry newtypes ───────────────────────────────────────────────────────

/// Allocation-group index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AgNumber(pub u32);

/// Byte offset on a device.
///
/// This is a unit-carrying wrapper to prevent mixing bytes and blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ByteOffset(pub u64);

impl ByteOffset {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn checked_add(self, bytes: u64) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }

    #[must_use]
    pub fn checked_mul(self, factor: u64) -> Option<Self> {
        self.0.checked_mul(factor).map(Self)
    }

    /// Narrow to `usize`, returning `ParseError::IntegerConversion` on overflow.
    pub fn to_usize(self) -> Result<usize, ParseError> {
        usize::try_from(self.0).map_err(|_| ParseError::IntegerConversion {
            field: "byte_offset",
        })
    }
}

/// Validated XFS block size (power of two in 512..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(XFS_MIN_BLOCKSIZE..=XFS_MAX_BLOCKSIZE).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "sb_blocksize",
                reason: "must be power of two in 512..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// log2 of the block size; must agree with `sb_blocklog`.
    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }
}

/// Validated sector size (power of two in 512..=32768).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SectorSize(u16);

impl SectorSize {
    pub fn new(value: u16) -> Result<Self, ParseError> {
        let wide = u32::from(value);
        if !wide.is_power_of_two() || !(XFS_MIN_SECTORSIZE..=XFS_MAX_SECTORSIZE).contains(&wide) {
            return Err(ParseError::InvalidField {
                field: "sb_sectsize",
                reason: "must be power of two in 512..=32768",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u16 {
        self.0
    }

    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }
}

// ── Inode numbers ───────────────────────────────────────────────────────────

/// A 64-bit XFS inode number.
///
/// Not a flat index: the value packs the allocation group, the block within
/// the group and the slot within that block. See [`InodeNumber::decode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InodeNumber(pub u64);

/// The three sub-fields of an inode number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InodeParts {
    pub ag: u32,
    pub block: u32,
    pub slot: u16,
}

impl InodeNumber {
    /// Split into `(ag, block, slot)` using the fixed 32/23/9 bit layout.
    #[must_use]
    pub fn decode(self) -> InodeParts {
        decode_inode_number(self.0)
    }

    #[must_use]
    pub fn compose(parts: InodeParts) -> Self {
        Self(compose_inode_number(parts))
    }
}

/// Right-shift-and-mask an inode number into its three components.
///
/// Bits 63..32 hold the AG number, bits 31..9 the block within the AG and
/// bits 8..0 the slot within the block.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // each field is masked to its width first
pub fn decode_inode_number(ino: u64) -> InodeParts {
    let block_mask = (1_u64 << INO_BLOCK_BITS) - 1;
    let slot_mask = (1_u64 << INO_SLOT_BITS) - 1;
    InodeParts {
        ag: (ino >> INO_AG_SHIFT) as u32,
        block: ((ino >> INO_SLOT_BITS) & block_mask) as u32,
        slot: (ino & slot_mask) as u16,
    }
}

/// Inverse of [`decode_inode_number`]. Out-of-range `block`/`slot` bits are masked off.
#[must_use]
pub fn compose_inode_number(parts: InodeParts) -> u64 {
    let block_mask = (1_u64 << INO_BLOCK_BITS) - 1;
    let slot_mask = (1_u64 << INO_SLOT_BITS) - 1;
    (u64::from(parts.ag) << INO_AG_SHIFT)
        | ((u64::from(parts.block) & block_mask) << INO_SLOT_BITS)
        | (u64::from(parts.slot) & slot_mask)
}

// ── UUIDs and magic tags ────────────────────────────────────────────────────

/// Render a 16-byte on-disk UUID in canonical 8-4-4-4-12 lowercase hex.
///
/// Bytes are taken in stored order (RFC 4122 network order).
#[must_use]
pub fn decode_uuid(bytes: &[u8; 16]) -> String {
    let hex = |range: std::ops::Range<usize>| -> String {
        bytes[range].iter().map(|b| format!("{b:02x}")).collect()
    };
    format!(
        "{}-{}-{}-{}-{}",
        hex(0..4),
        hex(4..6),
        hex(6..8),
        hex(8..10),
        hex(10..16)
    )
}

/// Interpret a magic number as four ASCII characters, most significant byte first.
///
/// Bytes outside printable ASCII are shown as `.`.
#[must_use]
pub fn magic_as_text(magic: u32) -> String {
    magic
        .to_be_bytes()
        .iter()
        .map(|&b| {
            if b.is_ascii_graphic() || b == b' ' {
                char::from(b)
            } else {
                '.'
            }
        })
        .collect()
}

// ── Field readers ───────────────────────────────────────────────────────────

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
    Ok(ensure_slice(data, offset, 1)?[0])
}

#[inline]
pub fn read_be_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    Ok(u16::from_be_bytes(read_fixed::<2>(data, offset)?))
}

#[inline]
pub fn read_be_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_be_bytes(read_fixed::<4>(data, offset)?))
}

#[inline]
pub fn read_be_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_be_bytes(read_fixed::<8>(data, offset)?))
}

/// Checksums are stored little-endian even inside otherwise big-endian structures.
#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_le_bytes(read_fixed::<4>(data, offset)?))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

#[must_use]
pub fn trim_nul_padded(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).trim().to_owned()
}

impl fmt::Display for AgNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ByteOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for InodeParts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(ag={}, block={}, slot={})", self.ag, self.block, self.slot)
    }
}
