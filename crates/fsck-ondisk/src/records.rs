#![forbid(unsafe_code)]
//! Value payloads of the records the reference model consumes.
//!
//! Parsing here only checks what a single value can tell about itself:
//! exact size, reserved bits, field ranges. Cross-record consistency
//! belongs to the reference model.

use fsck_types::{
    BlockSize, CP_MAX_WRAPPEDKEYSIZE, ParseError, read_le_i32, read_le_u16, read_le_u32,
    read_le_u64,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const FILE_EXTENT_VAL_SIZE: usize = 24;
const DSTREAM_ID_VAL_SIZE: usize = 4;
const PHYS_EXT_VAL_SIZE: usize = 20;
const CRYPTO_VAL_HEADER_SIZE: usize = 24;
const DSTREAM_SIZE: usize = 40;
const OMAP_VAL_SIZE: usize = 16;

const FILE_EXTENT_LEN_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;
const FILE_EXTENT_FLAG_SHIFT: u32 = 56;
const PEXT_LEN_MASK: u64 = 0x0FFF_FFFF_FFFF_FFFF;
const PEXT_KIND_SHIFT: u32 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    FileExtent,
    DstreamId,
    PhysExtent,
    CryptoState,
    Dstream,
    ObjectMap,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::FileExtent => "file extent value",
            Self::DstreamId => "dstream id value",
            Self::PhysExtent => "physical extent value",
            Self::CryptoState => "crypto state value",
            Self::Dstream => "dstream",
            Self::ObjectMap => "object map value",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RecordError {
    #[error("{kind}: wrong size of value ({actual} bytes, expected {expected})")]
    WrongSize {
        kind: RecordKind,
        actual: usize,
        expected: usize,
    },
    #[error("{kind}: {reason}")]
    Invalid {
        kind: RecordKind,
        reason: &'static str,
    },
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl RecordError {
    #[must_use]
    pub fn kind(&self) -> Option<RecordKind> {
        match self {
            Self::WrongSize { kind, .. } | Self::Invalid { kind, .. } => Some(*kind),
            Self::Parse(_) => None,
        }
    }
}

fn exact_size(raw: &[u8], kind: RecordKind, expected: usize) -> Result<(), RecordError> {
    if raw.len() == expected {
        Ok(())
    } else {
        Err(RecordError::WrongSize {
            kind,
            actual: raw.len(),
            expected,
        })
    }
}

// ── File extent ─────────────────────────────────────────────────────────────

/// Value of a file extent record: one logical run of a data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileExtentVal {
    /// Length in bytes; always a whole number of blocks.
    pub len: u64,
    /// First physical block, or 0 for a hole.
    pub phys_block: u64,
    pub crypto_id: u64,
}

impl FileExtentVal {
    pub fn parse(raw: &[u8], block_size: BlockSize) -> Result<Self, RecordError> {
        let kind = RecordKind::FileExtent;
        exact_size(raw, kind, FILE_EXTENT_VAL_SIZE)?;

        let len_and_flags = read_le_u64(raw, 0)?;
        if len_and_flags >> FILE_EXTENT_FLAG_SHIFT != 0 {
            return Err(RecordError::Invalid {
                kind,
                reason: "no flags should be set",
            });
        }
        let len = len_and_flags & FILE_EXTENT_LEN_MASK;
        if len == 0 {
            return Err(RecordError::Invalid {
                kind,
                reason: "length is zero",
            });
        }
        if !block_size.is_aligned(len) {
            return Err(RecordError::Invalid {
                kind,
                reason: "length isn't multiple of block size",
            });
        }

        Ok(Self {
            len,
            phys_block: read_le_u64(raw, 8)?,
            crypto_id: read_le_u64(raw, 16)?,
        })
    }

    #[must_use]
    pub fn is_hole(&self) -> bool {
        self.phys_block == 0
    }

    #[must_use]
    pub fn blocks(&self, block_size: BlockSize) -> u64 {
        block_size.bytes_to_blocks(self.len)
    }
}

// ── Dstream id ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DstreamIdVal {
    pub refcnt: u32,
}

impl DstreamIdVal {
    pub fn parse(raw: &[u8]) -> Result<Self, RecordError> {
        exact_size(raw, RecordKind::DstreamId, DSTREAM_ID_VAL_SIZE)?;
        Ok(Self {
            refcnt: read_le_u32(raw, 0)?,
        })
    }
}

// ── Physical extent ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhysExtKind {
    /// Defines the extent and its reference count.
    New,
    /// Adjusts the reference count of an extent defined in an older snapshot.
    Update,
}

impl PhysExtKind {
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Self::New),
            2 => Some(Self::Update),
            _ => None,
        }
    }
}

/// Value of a physical extent record in the extent-reference tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysExtVal {
    pub blocks: u64,
    pub kind: PhysExtKind,
    /// Id of the dstream (or other object) that owns the extent.
    pub owning_obj_id: u64,
    /// Reference count for a new extent, or a signed delta for an update.
    pub refcnt: i32,
}

impl PhysExtVal {
    pub fn parse(raw: &[u8]) -> Result<Self, RecordError> {
        let kind = RecordKind::PhysExtent;
        exact_size(raw, kind, PHYS_EXT_VAL_SIZE)?;

        let len_and_kind = read_le_u64(raw, 0)?;
        #[allow(clippy::cast_possible_truncation)]
        let raw_kind = (len_and_kind >> PEXT_KIND_SHIFT) as u8;
        let Some(ext_kind) = PhysExtKind::from_raw(raw_kind) else {
            return Err(RecordError::Invalid {
                kind,
                reason: "invalid kind",
            });
        };

        Ok(Self {
            blocks: len_and_kind & PEXT_LEN_MASK,
            kind: ext_kind,
            owning_obj_id: read_le_u64(raw, 8)?,
            refcnt: read_le_i32(raw, 16)?,
        })
    }
}

// ── Crypto state ────────────────────────────────────────────────────────────

/// Value of a crypto state record: a reference count and a wrapped key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoStateVal {
    pub refcnt: u32,
    pub major_version: u16,
    pub minor_version: u16,
    pub cpflags: u32,
    pub persistent_class: u32,
    pub key_os_version: u32,
    pub key_revision: u16,
    pub key_len: u16,
}

impl CryptoStateVal {
    pub fn parse(raw: &[u8]) -> Result<Self, RecordError> {
        let kind = RecordKind::CryptoState;
        if raw.len() < CRYPTO_VAL_HEADER_SIZE {
            return Err(RecordError::WrongSize {
                kind,
                actual: raw.len(),
                expected: CRYPTO_VAL_HEADER_SIZE,
            });
        }

        let key_len = read_le_u16(raw, 22)?;
        if key_len > CP_MAX_WRAPPEDKEYSIZE {
            return Err(RecordError::Invalid {
                kind,
                reason: "wrapped key is too long",
            });
        }
        exact_size(raw, kind, CRYPTO_VAL_HEADER_SIZE + usize::from(key_len))?;

        Ok(Self {
            refcnt: read_le_u32(raw, 0)?,
            major_version: read_le_u16(raw, 4)?,
            minor_version: read_le_u16(raw, 6)?,
            cpflags: read_le_u32(raw, 8)?,
            persistent_class: read_le_u32(raw, 12)?,
            key_os_version: read_le_u32(raw, 16)?,
            key_revision: read_le_u16(raw, 20)?,
            key_len,
        })
    }
}

// ── Dstream ─────────────────────────────────────────────────────────────────

/// The dstream structure embedded in inode and xattr values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DstreamStats {
    pub size: u64,
    pub alloced_size: u64,
    pub default_crypto_id: u64,
    pub total_bytes_written: u64,
    pub total_bytes_read: u64,
}

impl DstreamStats {
    pub fn parse(raw: &[u8]) -> Result<Self, RecordError> {
        exact_size(raw, RecordKind::Dstream, DSTREAM_SIZE)?;
        Ok(Self {
            size: read_le_u64(raw, 0)?,
            alloced_size: read_le_u64(raw, 8)?,
            default_crypto_id: read_le_u64(raw, 16)?,
            total_bytes_written: read_le_u64(raw, 24)?,
            total_bytes_read: read_le_u64(raw, 32)?,
        })
    }
}

// ── Object map ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapVal {
    pub flags: u32,
    pub size: u32,
    pub paddr: u64,
}

impl OmapVal {
    pub fn parse(raw: &[u8]) -> Result<Self, RecordError> {
        exact_size(raw, RecordKind::ObjectMap, OMAP_VAL_SIZE)?;
        Ok(Self {
            flags: read_le_u32(raw, 0)?,
            size: read_le_u32(raw, 4)?,
            paddr: read_le_u64(raw, 8)?,
        })
    }
}
