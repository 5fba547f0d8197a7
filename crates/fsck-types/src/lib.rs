#![forbid(unsafe_code)]
//! Shared vocabulary for the checker: id newtypes, the immutable
//! [`VolumeConfig`] threaded through every component, little-endian read
//! helpers, and the on-disk layout constants the core relies on.
//!
//! Nothing in this crate performs I/O.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

// ── Object header layout ────────────────────────────────────────────────────

/// Size of the common object header (`o_cksum`, `o_oid`, `o_xid`, `o_type`, `o_subtype`).
pub const OBJ_PHYS_SIZE: usize = 32;
/// Bytes at the start of every object reserved for its checksum.
pub const MAX_CKSUM_SIZE: usize = 8;
/// Object ids below this value are reserved and never name a real object.
pub const OID_RESERVED_COUNT: u64 = 1024;

pub const OBJECT_TYPE_MASK: u32 = 0x0000_FFFF;
pub const OBJECT_TYPE_FLAGS_MASK: u32 = 0xFFFF_0000;
pub const OBJ_STORAGETYPE_MASK: u32 = 0xC000_0000;
pub const OBJECT_TYPE_FLAGS_DEFINED_MASK: u32 = 0xF800_0000;

pub const OBJ_VIRTUAL: u32 = 0x0000_0000;
pub const OBJ_EPHEMERAL: u32 = 0x8000_0000;
pub const OBJ_PHYSICAL: u32 = 0x4000_0000;
pub const OBJ_NOHEADER: u32 = 0x2000_0000;
pub const OBJ_ENCRYPTED: u32 = 0x1000_0000;
pub const OBJ_NONPERSISTENT: u32 = 0x0800_0000;

// ── Catalog key header ──────────────────────────────────────────────────────

pub const OBJ_ID_MASK: u64 = 0x0FFF_FFFF_FFFF_FFFF;
pub const OBJ_TYPE_MASK: u64 = 0xF000_0000_0000_0000;
pub const OBJ_TYPE_SHIFT: u32 = 60;

// ── Crypto ids ──────────────────────────────────────────────────────────────

/// Crypto id shared by all software-encrypted extents; it has no state record.
pub const CRYPTO_SW_ID: u64 = 4;
/// Largest wrapped key a crypto state record may carry.
pub const CP_MAX_WRAPPEDKEYSIZE: u16 = 128;

// ── Block size bounds ───────────────────────────────────────────────────────

pub const MIN_BLOCK_SIZE: u32 = 4096;
pub const MAX_BLOCK_SIZE: u32 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(pub u64);

impl ObjectId {
    /// Whether this id falls in the reserved range.
    #[must_use]
    pub fn is_reserved(self) -> bool {
        self.0 < OID_RESERVED_COUNT
    }
}

/// Transaction id stamped on every object at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Xid(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockNumber(pub u64);

/// Validated block size (power of two in 4096..=65536).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockSize(u32);

impl BlockSize {
    pub fn new(value: u32) -> Result<Self, ParseError> {
        if !value.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&value) {
            return Err(ParseError::InvalidField {
                field: "block_size",
                reason: "must be power of two in 4096..=65536",
            });
        }
        Ok(Self(value))
    }

    #[must_use]
    pub fn get(self) -> u32 {
        self.0
    }

    /// Block size as a `usize` buffer length.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_usize(self) -> usize {
        // Bounded by MAX_BLOCK_SIZE.
        self.0 as usize
    }

    #[must_use]
    pub fn shift(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// Whether `bytes` is a whole number of blocks.
    #[must_use]
    pub fn is_aligned(self, bytes: u64) -> bool {
        bytes & (u64::from(self.0) - 1) == 0
    }

    /// Number of whole blocks in `bytes` (truncating).
    #[must_use]
    pub fn bytes_to_blocks(self, bytes: u64) -> u64 {
        bytes >> self.shift()
    }

    #[must_use]
    pub fn block_to_byte(self, block: BlockNumber) -> Option<u64> {
        block.0.checked_mul(u64::from(self.0))
    }
}

/// Volume-wide parameters supplied by the superblock loader.
///
/// Built once per run and passed by reference; never mutated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeConfig {
    pub block_size: BlockSize,
    /// Newest transaction on the volume; no object may carry a later one.
    pub current_xid: Xid,
    /// Filenames are case-folded before hashing.
    pub case_insensitive: bool,
}

impl VolumeConfig {
    #[must_use]
    pub fn new(block_size: BlockSize, current_xid: Xid, case_insensitive: bool) -> Self {
        Self {
            block_size,
            current_xid,
            case_insensitive,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

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
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    Ok(u16::from_le_bytes(read_fixed::<2>(data, offset)?))
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    Ok(u32::from_le_bytes(read_fixed::<4>(data, offset)?))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    Ok(i32::from_le_bytes(read_fixed::<4>(data, offset)?))
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    Ok(u64::from_le_bytes(read_fixed::<8>(data, offset)?))
}

#[inline]
pub fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> Result<[u8; N], ParseError> {
    let bytes = ensure_slice(data, offset, N)?;
    let mut out = [0_u8; N];
    out.copy_from_slice(bytes);
    Ok(out)
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for BlockSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
