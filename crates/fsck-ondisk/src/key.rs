#![forbid(unsafe_code)]
//! Tree key decoding and ordering.
//!
//! Every on-disk key, whatever its record type, decodes into the same
//! [`Key`] shape: `(id, record_type, number, name)`. Trees are sorted by
//! that tuple, with names compared as raw bytes. Normalization only matters
//! when a directory-record hash is recomputed during decode.

use crate::name_hash::{NAME_LEN_MASK, hash_name};
use fsck_types::{OBJ_ID_MASK, OBJ_TYPE_SHIFT, ParseError, read_le_u16, read_le_u32, read_le_u64};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

/// Catalog key header: `obj_id_and_type`.
const KEY_HEADER_SIZE: usize = 8;
/// Object map key: `oid` + `xid`.
const OMAP_KEY_SIZE: usize = 16;
/// Hashed directory record key: header + `name_len_and_hash`.
const DREC_HASHED_KEY_SIZE: usize = 12;
/// Xattr and snapshot name keys: header + `name_len`.
const NAMED_KEY_SIZE: usize = 10;
/// File extent, sibling link and file info keys: header + one `u64`.
const WIDE_KEY_SIZE: usize = 16;
/// Info bits stored above the lba in a file info key.
const FILE_INFO_LBA_MASK: u64 = 0x00FF_FFFF_FFFF_FFFF;

/// Record type stored in the top four bits of a catalog key header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum RecordType {
    Any = 0,
    SnapMetadata = 1,
    PhysExtent = 2,
    Inode = 3,
    Xattr = 4,
    SiblingLink = 5,
    DstreamId = 6,
    CryptoState = 7,
    FileExtent = 8,
    DirRec = 9,
    DirStats = 10,
    SnapName = 11,
    SiblingMap = 12,
    FileInfo = 13,
}

impl RecordType {
    #[must_use]
    pub fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => Self::Any,
            1 => Self::SnapMetadata,
            2 => Self::PhysExtent,
            3 => Self::Inode,
            4 => Self::Xattr,
            5 => Self::SiblingLink,
            6 => Self::DstreamId,
            7 => Self::CryptoState,
            8 => Self::FileExtent,
            9 => Self::DirRec,
            10 => Self::DirStats,
            11 => Self::SnapName,
            12 => Self::SiblingMap,
            13 => Self::FileInfo,
            _ => return None,
        })
    }

    #[must_use]
    pub fn raw(self) -> u8 {
        self as u8
    }
}

/// Which decoder a key goes through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyFormat {
    /// Fixed `(oid, xid)` key of an object map tree.
    ObjectMap,
    /// Header-prefixed key of the catalog, extent-reference and snapshot
    /// metadata trees; the record type is read from the header.
    Catalog,
}

/// Key variant a decode error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyKind {
    ObjectMap,
    DirRec,
    Xattr,
    FileExtent,
    SnapName,
    SiblingLink,
    FileInfo,
    /// Header-only keys and the header itself.
    Catalog,
}

impl fmt::Display for KeyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ObjectMap => "object map key",
            Self::DirRec => "directory record key",
            Self::Xattr => "xattr key",
            Self::FileExtent => "file extent key",
            Self::SnapName => "snapshot name key",
            Self::SiblingLink => "sibling link key",
            Self::FileInfo => "file info key",
            Self::Catalog => "catalog key",
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("{kind}: wrong size of key ({actual} bytes)")]
    WrongSize { kind: KeyKind, actual: usize },
    #[error("{kind}: name lacks NUL termination")]
    MissingTerminator { kind: KeyKind },
    #[error("{kind}: wrong name length (declared {declared}, found {actual})")]
    NameLengthMismatch {
        kind: KeyKind,
        declared: usize,
        actual: usize,
    },
    #[error("{kind}: size of key doesn't match the name length ({actual} bytes, expected {expected})")]
    SizeMismatch {
        kind: KeyKind,
        expected: usize,
        actual: usize,
    },
    #[error("filename hash is corrupted (stored {stored:#010x}, computed {computed:#010x})")]
    HashMismatch { stored: u32, computed: u32 },
    #[error("filename is not valid UTF-8")]
    InvalidUtf8,
    #[error("transaction id for key is zero")]
    ZeroXid,
    #[error("unknown record type {0}")]
    UnknownRecordType(u8),
    #[error(transparent)]
    Parse(#[from] ParseError),
}

impl KeyError {
    /// Key variant the error was raised for, when known.
    #[must_use]
    pub fn kind(&self) -> Option<KeyKind> {
        match self {
            Self::WrongSize { kind, .. }
            | Self::MissingTerminator { kind }
            | Self::NameLengthMismatch { kind, .. }
            | Self::SizeMismatch { kind, .. } => Some(*kind),
            Self::HashMismatch { .. } | Self::InvalidUtf8 => Some(KeyKind::DirRec),
            Self::ZeroXid => Some(KeyKind::ObjectMap),
            Self::UnknownRecordType(_) => Some(KeyKind::Catalog),
            Self::Parse(_) => None,
        }
    }
}

/// A decoded key. `name` borrows from the raw key bytes and excludes the
/// terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key<'a> {
    pub id: u64,
    pub record_type: u8,
    pub number: u64,
    pub name: Option<&'a [u8]>,
}

impl<'a> Key<'a> {
    /// Key with no name, as used for lookups.
    #[must_use]
    pub fn new(id: u64, record_type: u8, number: u64) -> Self {
        Self {
            id,
            record_type,
            number,
            name: None,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: &'a [u8]) -> Self {
        self.name = Some(name);
        self
    }

    #[must_use]
    pub fn record_type(&self) -> Option<RecordType> {
        RecordType::from_raw(self.record_type)
    }

    /// Name as text, when it is valid UTF-8.
    #[must_use]
    pub fn name_str(&self) -> Option<&'a str> {
        self.name.and_then(|n| std::str::from_utf8(n).ok())
    }

    #[must_use]
    pub fn into_owned(self) -> OwnedKey {
        OwnedKey {
            id: self.id,
            record_type: self.record_type,
            number: self.number,
            name: self.name.map(<[u8]>::to_vec),
        }
    }
}

impl Ord for Key<'_> {
    fn cmp(&self, other: &Self) -> Ordering {
        keycmp(self, other)
    }
}

impl PartialOrd for Key<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A [`Key`] detached from its buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnedKey {
    pub id: u64,
    pub record_type: u8,
    pub number: u64,
    pub name: Option<Vec<u8>>,
}

impl OwnedKey {
    #[must_use]
    pub fn as_key(&self) -> Key<'_> {
        Key {
            id: self.id,
            record_type: self.record_type,
            number: self.number,
            name: self.name.as_deref(),
        }
    }
}

/// Tree order: `id`, then `record_type`, then `number`, then the name
/// bytes. Two unnamed keys that agree on the first three are equal.
#[must_use]
pub fn keycmp(a: &Key<'_>, b: &Key<'_>) -> Ordering {
    a.id.cmp(&b.id)
        .then(a.record_type.cmp(&b.record_type))
        .then(a.number.cmp(&b.number))
        .then_with(|| match (a.name, b.name) {
            (None, None) => Ordering::Equal,
            // Keys of one record type are either all named or all unnamed;
            // the unnamed side sorts first so mixed input stays totally ordered.
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(y),
        })
}

/// Decode a raw key.
///
/// `case_insensitive` selects the filename normalization used to re-verify
/// directory record hashes.
pub fn decode_key(
    format: KeyFormat,
    raw: &[u8],
    case_insensitive: bool,
) -> Result<Key<'_>, KeyError> {
    match format {
        KeyFormat::ObjectMap => decode_omap_key(raw),
        KeyFormat::Catalog => decode_catalog_key(raw, case_insensitive),
    }
}

fn decode_omap_key(raw: &[u8]) -> Result<Key<'_>, KeyError> {
    if raw.len() != OMAP_KEY_SIZE {
        return Err(KeyError::WrongSize {
            kind: KeyKind::ObjectMap,
            actual: raw.len(),
        });
    }

    let xid = read_le_u64(raw, 8)?;
    if xid == 0 {
        return Err(KeyError::ZeroXid);
    }

    Ok(Key::new(read_le_u64(raw, 0)?, 0, xid))
}

fn decode_catalog_key(raw: &[u8], case_insensitive: bool) -> Result<Key<'_>, KeyError> {
    if raw.len() < KEY_HEADER_SIZE {
        return Err(KeyError::WrongSize {
            kind: KeyKind::Catalog,
            actual: raw.len(),
        });
    }

    let header = read_le_u64(raw, 0)?;
    let id = header & OBJ_ID_MASK;
    #[allow(clippy::cast_possible_truncation)]
    let raw_type = (header >> OBJ_TYPE_SHIFT) as u8;
    let Some(record_type) = RecordType::from_raw(raw_type) else {
        return Err(KeyError::UnknownRecordType(raw_type));
    };

    let key = Key::new(id, raw_type, 0);
    match record_type {
        RecordType::DirRec => decode_dir_rec(key, raw, case_insensitive),
        RecordType::Xattr => decode_named(key, raw, KeyKind::Xattr),
        RecordType::SnapName => decode_named(key, raw, KeyKind::SnapName),
        RecordType::FileExtent => decode_wide(key, raw, KeyKind::FileExtent, u64::MAX),
        RecordType::SiblingLink => decode_wide(key, raw, KeyKind::SiblingLink, u64::MAX),
        RecordType::FileInfo => decode_wide(key, raw, KeyKind::FileInfo, FILE_INFO_LBA_MASK),
        RecordType::Any
        | RecordType::SnapMetadata
        | RecordType::PhysExtent
        | RecordType::Inode
        | RecordType::DstreamId
        | RecordType::CryptoState
        | RecordType::DirStats
        | RecordType::SiblingMap => {
            if raw.len() != KEY_HEADER_SIZE {
                return Err(KeyError::WrongSize {
                    kind: KeyKind::Catalog,
                    actual: raw.len(),
                });
            }
            Ok(key)
        }
    }
}

/// Name bytes up to (not including) the first NUL at or after `offset`.
/// Callers have already checked the final byte is NUL.
fn terminated_name(raw: &[u8], offset: usize) -> &[u8] {
    let tail = &raw[offset..];
    let len = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
    &tail[..len]
}

fn check_terminated(raw: &[u8], min: usize, kind: KeyKind) -> Result<(), KeyError> {
    if raw.len() < min + 1 {
        return Err(KeyError::WrongSize {
            kind,
            actual: raw.len(),
        });
    }
    if raw.last() != Some(&0) {
        return Err(KeyError::MissingTerminator { kind });
    }
    Ok(())
}

fn decode_dir_rec<'a>(
    mut key: Key<'a>,
    raw: &'a [u8],
    case_insensitive: bool,
) -> Result<Key<'a>, KeyError> {
    let kind = KeyKind::DirRec;
    check_terminated(raw, DREC_HASHED_KEY_SIZE, kind)?;

    let stored = read_le_u32(raw, 8)?;
    let name = terminated_name(raw, DREC_HASHED_KEY_SIZE);
    let text = std::str::from_utf8(name).map_err(|_| KeyError::InvalidUtf8)?;

    let computed = hash_name(text, case_insensitive);
    if stored != computed {
        return Err(KeyError::HashMismatch { stored, computed });
    }

    // Lengths include the NUL terminator.
    let declared = (stored & NAME_LEN_MASK) as usize;
    if name.len() + 1 != declared {
        return Err(KeyError::NameLengthMismatch {
            kind,
            declared,
            actual: name.len() + 1,
        });
    }
    if raw.len() != DREC_HASHED_KEY_SIZE + declared {
        return Err(KeyError::SizeMismatch {
            kind,
            expected: DREC_HASHED_KEY_SIZE + declared,
            actual: raw.len(),
        });
    }

    key.number = u64::from(stored);
    key.name = Some(name);
    Ok(key)
}

fn decode_named<'a>(mut key: Key<'a>, raw: &'a [u8], kind: KeyKind) -> Result<Key<'a>, KeyError> {
    check_terminated(raw, NAMED_KEY_SIZE, kind)?;

    let declared = usize::from(read_le_u16(raw, 8)?);
    let name = terminated_name(raw, NAMED_KEY_SIZE);
    if name.len() + 1 != declared {
        return Err(KeyError::NameLengthMismatch {
            kind,
            declared,
            actual: name.len() + 1,
        });
    }
    if raw.len() != NAMED_KEY_SIZE + declared {
        return Err(KeyError::SizeMismatch {
            kind,
            expected: NAMED_KEY_SIZE + declared,
            actual: raw.len(),
        });
    }

    key.name = Some(name);
    Ok(key)
}

fn decode_wide<'a>(
    mut key: Key<'a>,
    raw: &'a [u8],
    kind: KeyKind,
    mask: u64,
) -> Result<Key<'a>, KeyError> {
    if raw.len() != WIDE_KEY_SIZE {
        return Err(KeyError::WrongSize {
            kind,
            actual: raw.len(),
        });
    }
    key.number = read_le_u64(raw, KEY_HEADER_SIZE)? & mask;
    Ok(key)
}
