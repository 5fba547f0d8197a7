#![forbid(unsafe_code)]
//! Object header parsing and Fletcher-64 verification.
//!
//! Every on-disk object starts with a 32-byte header whose first eight bytes
//! hold a checksum over the rest of the block. [`validate_object`] applies
//! the full header contract in a fixed order and stops at the first
//! violation; the I/O side (omap translation, block reads) lives in
//! `fsck-core`.

use fsck_types::{
    MAX_CKSUM_SIZE, OBJ_ENCRYPTED, OBJ_EPHEMERAL, OBJ_NOHEADER, OBJ_NONPERSISTENT, OBJ_PHYS_SIZE,
    OBJ_PHYSICAL, OBJ_STORAGETYPE_MASK, OBJECT_TYPE_FLAGS_DEFINED_MASK, OBJECT_TYPE_FLAGS_MASK,
    OBJECT_TYPE_MASK, ObjectId, ParseError, VolumeConfig, Xid, read_le_u32, read_le_u64,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

const FLETCHER_MODULUS: u64 = 0xFFFF_FFFF;

/// Fletcher-64 over little-endian 32-bit words of `data`.
///
/// Trailing bytes that do not fill a whole word are ignored. The running
/// sums are reduced modulo 2^32-1 on every step, which gives the same
/// result as reducing once at the end without risking overflow on large
/// blocks.
#[must_use]
pub fn fletcher64(data: &[u8]) -> u64 {
    let mut sum1: u64 = 0;
    let mut sum2: u64 = 0;

    for word in data.chunks_exact(4) {
        let value = u64::from(u32::from_le_bytes([word[0], word[1], word[2], word[3]]));
        sum1 = (sum1 + value) % FLETCHER_MODULUS;
        sum2 = (sum2 + sum1) % FLETCHER_MODULUS;
    }

    let c1 = FLETCHER_MODULUS - (sum1 + sum2) % FLETCHER_MODULUS;
    let c2 = FLETCHER_MODULUS - (sum1 + c1) % FLETCHER_MODULUS;

    (c2 << 32) | c1
}

/// Checksum an object block would need to carry, computed over everything
/// after the checksum field.
pub fn object_checksum(block: &[u8]) -> Result<u64, ParseError> {
    if block.len() < OBJ_PHYS_SIZE {
        return Err(ParseError::InsufficientData {
            needed: OBJ_PHYS_SIZE,
            offset: 0,
            actual: block.len(),
        });
    }
    Ok(fletcher64(&block[MAX_CKSUM_SIZE..]))
}

/// Whether the stored checksum of `block` matches its contents.
#[must_use]
pub fn verify_checksum(block: &[u8]) -> bool {
    match (read_le_u64(block, 0), object_checksum(block)) {
        (Ok(stored), Ok(computed)) => stored == computed,
        _ => false,
    }
}

/// How an object is addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Reached through an object map.
    Virtual,
    /// Lives in the checkpoint area.
    Ephemeral,
    /// Object id is the physical block number.
    Physical,
    /// Both storage bits set; never valid.
    Invalid,
}

impl StorageType {
    #[must_use]
    pub fn from_flags(flags: u32) -> Self {
        match flags & OBJ_STORAGETYPE_MASK {
            0 => Self::Virtual,
            OBJ_EPHEMERAL => Self::Ephemeral,
            OBJ_PHYSICAL => Self::Physical,
            _ => Self::Invalid,
        }
    }
}

impl fmt::Display for StorageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Virtual => write!(f, "virtual"),
            Self::Ephemeral => write!(f, "ephemeral"),
            Self::Physical => write!(f, "physical"),
            Self::Invalid => write!(f, "invalid"),
        }
    }
}

/// The decoded 32-byte object header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeader {
    pub checksum: u64,
    pub oid: ObjectId,
    pub xid: Xid,
    /// Low 16 bits of `o_type`.
    pub obj_type: u32,
    /// High 16 bits of `o_type`.
    pub flags: u32,
    pub subtype: u32,
}

impl ObjectHeader {
    pub fn parse_from_block(block: &[u8]) -> Result<Self, ParseError> {
        if block.len() < OBJ_PHYS_SIZE {
            return Err(ParseError::InsufficientData {
                needed: OBJ_PHYS_SIZE,
                offset: 0,
                actual: block.len(),
            });
        }

        let raw_type = read_le_u32(block, 24)?;
        Ok(Self {
            checksum: read_le_u64(block, 0)?,
            oid: ObjectId(read_le_u64(block, 8)?),
            xid: Xid(read_le_u64(block, 16)?),
            obj_type: raw_type & OBJECT_TYPE_MASK,
            flags: raw_type & OBJECT_TYPE_FLAGS_MASK,
            subtype: read_le_u32(block, 28)?,
        })
    }

    #[must_use]
    pub fn storage_type(&self) -> StorageType {
        StorageType::from_flags(self.flags)
    }

    #[must_use]
    pub fn undefined_flags(&self) -> u32 {
        self.flags & !OBJECT_TYPE_FLAGS_DEFINED_MASK
    }
}

/// A violated object header invariant.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ObjectError {
    #[error("block is {actual} bytes, expected {expected}")]
    WrongBlockLength { expected: usize, actual: usize },
    #[error("wrong object id (expected {expected}, found {found})")]
    WrongObjectId { expected: ObjectId, found: ObjectId },
    #[error("reserved object id {0}")]
    ReservedObjectId(ObjectId),
    #[error("bad transaction id {xid} (volume is at {current})")]
    BadTransactionId { xid: Xid, current: Xid },
    #[error("transaction id in omap key ({omap}) doesn't match header ({header})")]
    OmapXidMismatch { header: Xid, omap: Xid },
    #[error("undefined flag in use ({0:#x})")]
    UndefinedFlags(u32),
    #[error("nonpersistent flag is set")]
    Nonpersistent,
    #[error("wrong flag for {expected} object (found {found})")]
    WrongStorageType {
        expected: StorageType,
        found: StorageType,
    },
    #[error("encrypted objects are not supported")]
    Encrypted,
    #[error("headerless objects are not supported")]
    NoHeader,
    #[error("bad checksum (stored {stored:#018x}, computed {computed:#018x})")]
    BadChecksum { stored: u64, computed: u64 },
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl ObjectError {
    /// Whether this is an unsupported-feature condition rather than
    /// corruption.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::Encrypted | Self::NoHeader)
    }
}

/// Validate the object in `block` against what the caller asked for.
///
/// `omap_xid` is the transaction id recorded in the object map when the
/// object was reached through one; `None` means `expected_oid` was used as
/// a physical block number. Checks run in this order and the first failure
/// is returned:
///
/// 1. stored id equals `expected_oid`
/// 2. id is above the reserved range
/// 3. xid is non-zero and not newer than the volume
/// 4. xid equals the omap's xid (virtual objects only)
/// 5. no undefined flag bits
/// 6. nonpersistent flag clear
/// 7. storage type is virtual iff an omap was used, physical otherwise
/// 8. checksum verifies
pub fn validate_object(
    block: &[u8],
    expected_oid: ObjectId,
    omap_xid: Option<Xid>,
    config: &VolumeConfig,
) -> Result<ObjectHeader, ObjectError> {
    let expected_len = config.block_size.as_usize();
    if block.len() != expected_len {
        return Err(ObjectError::WrongBlockLength {
            expected: expected_len,
            actual: block.len(),
        });
    }

    let header = ObjectHeader::parse_from_block(block)?;

    if header.oid != expected_oid {
        return Err(ObjectError::WrongObjectId {
            expected: expected_oid,
            found: header.oid,
        });
    }
    if expected_oid.is_reserved() {
        return Err(ObjectError::ReservedObjectId(expected_oid));
    }
    if header.xid.0 == 0 || header.xid > config.current_xid {
        return Err(ObjectError::BadTransactionId {
            xid: header.xid,
            current: config.current_xid,
        });
    }
    if let Some(omap) = omap_xid {
        if header.xid != omap {
            return Err(ObjectError::OmapXidMismatch {
                header: header.xid,
                omap,
            });
        }
    }

    let undefined = header.undefined_flags();
    if undefined != 0 {
        return Err(ObjectError::UndefinedFlags(undefined));
    }
    if header.flags & OBJ_NONPERSISTENT != 0 {
        return Err(ObjectError::Nonpersistent);
    }

    let expected_storage = if omap_xid.is_some() {
        StorageType::Virtual
    } else {
        StorageType::Physical
    };
    let found = header.storage_type();
    if found != expected_storage {
        return Err(ObjectError::WrongStorageType {
            expected: expected_storage,
            found,
        });
    }

    if header.flags & OBJ_NOHEADER != 0 {
        return Err(ObjectError::NoHeader);
    }
    if header.flags & OBJ_ENCRYPTED != 0 {
        return Err(ObjectError::Encrypted);
    }

    let computed = object_checksum(block)?;
    if computed != header.checksum {
        return Err(ObjectError::BadChecksum {
            stored: header.checksum,
            computed,
        });
    }

    Ok(header)
}
