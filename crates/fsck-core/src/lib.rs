#![forbid(unsafe_code)]
//! Validation core of the checker.
//!
//! Ties the pure parsers in `fsck-ondisk` to block I/O and to the reference
//! model:
//!
//! - [`ObjectReader::read_object`] is the one gate every on-disk object
//!   passes through.
//! - [`decode_key`] and [`compare`] are the key interface offered to tree
//!   walkers.
//! - [`Check`] routes leaf records into the reference model and produces the
//!   final [`CheckReport`].
//! - [`sweep`] scans raw blocks for objects whose checksum no longer holds.
//!
//! Parse errors from the lower crates become categorized [`FsckError`]s
//! here, so `fsck-error` stays free of parser dependencies.

mod check;
mod omap;
mod reader;
pub mod sweep;

pub use check::{Check, CheckReport};
pub use omap::{ObjectMap, OmapRecord, OmapTable};
pub use reader::{ObjectBlock, ObjectReader};

use fsck_error::{Category, FsckError, Result};
use fsck_ondisk::{Key, KeyError, KeyFormat, KeyKind, ObjectError, RecordError, RecordKind};
use std::cmp::Ordering;

/// Decode a raw key, reporting malformed keys as fatal corruption of the
/// matching record category.
pub fn decode_key(format: KeyFormat, raw: &[u8], case_insensitive: bool) -> Result<Key<'_>> {
    fsck_ondisk::decode_key(format, raw, case_insensitive).map_err(|e| key_error(&e))
}

/// Total order over decoded keys.
#[must_use]
pub fn compare(a: &Key<'_>, b: &Key<'_>) -> Ordering {
    fsck_ondisk::keycmp(a, b)
}

// ── Error conversion ────────────────────────────────────────────────────────

fn key_category(kind: Option<KeyKind>) -> Category {
    match kind {
        Some(KeyKind::ObjectMap) => Category::ObjectMap,
        Some(KeyKind::DirRec) => Category::DirectoryRecord,
        Some(KeyKind::Xattr) => Category::XattrRecord,
        Some(KeyKind::FileExtent) => Category::ExtentRecord,
        Some(KeyKind::SnapName) => Category::SnapshotNameRecord,
        Some(KeyKind::SiblingLink) => Category::SiblingLinkRecord,
        Some(KeyKind::FileInfo) => Category::FileInfoRecord,
        Some(KeyKind::Catalog) | None => Category::CatalogTree,
    }
}

fn record_category(kind: Option<RecordKind>) -> Category {
    match kind {
        Some(RecordKind::FileExtent) => Category::ExtentRecord,
        Some(RecordKind::DstreamId) => Category::DstreamIdRecord,
        Some(RecordKind::PhysExtent) => Category::PhysicalExtentRecord,
        Some(RecordKind::CryptoState) => Category::CryptoStateRecord,
        Some(RecordKind::Dstream) => Category::DataStream,
        Some(RecordKind::ObjectMap) => Category::ObjectMap,
        None => Category::CatalogTree,
    }
}

/// Map a key decode failure to a fatal error.
#[must_use]
pub fn key_error(err: &KeyError) -> FsckError {
    FsckError::corruption(key_category(err.kind()), None, err.to_string())
}

/// Map a record value failure to a fatal error.
#[must_use]
pub fn record_error(err: &RecordError) -> FsckError {
    FsckError::corruption(record_category(err.kind()), None, err.to_string())
}

/// Map an object validation failure on block `block` to a fatal error.
#[must_use]
pub fn object_error(err: &ObjectError, block: u64) -> FsckError {
    if err.is_unsupported() {
        return FsckError::Unsupported(format!("{err} (block {block:#x})"));
    }
    match err {
        ObjectError::WrongBlockLength { .. } => FsckError::Format(err.to_string()),
        _ => FsckError::corruption(Category::ObjectHeader, Some(block), err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsck_ondisk::{RecordType, hash_name};
    use fsck_types::{OBJ_TYPE_SHIFT, ObjectId, ParseError};

    fn drec(name: &str) -> Vec<u8> {
        let mut raw = (0x400_u64 | (u64::from(RecordType::DirRec.raw()) << OBJ_TYPE_SHIFT))
            .to_le_bytes()
            .to_vec();
        raw.extend_from_slice(&hash_name(name, false).to_le_bytes());
        raw.extend_from_slice(name.as_bytes());
        raw.push(0);
        raw
    }

    #[test]
    fn decode_key_categorizes_failures() {
        let mut raw = drec("a.txt");
        let last = raw.len() - 1;
        raw[last] = b'x';
        let err = decode_key(KeyFormat::Catalog, &raw, false).unwrap_err();
        assert_eq!(err.category(), Some(Category::DirectoryRecord));
        assert_eq!(err.exit_code(), fsck_error::EXIT_UNCORRECTED);

        let mut raw = drec("a.txt");
        raw[13] ^= 0x20;
        let err = decode_key(KeyFormat::Catalog, &raw, false).unwrap_err();
        assert!(err.to_string().contains("filename hash is corrupted"), "{err}");

        let err = decode_key(KeyFormat::ObjectMap, &[0_u8; 16], false).unwrap_err();
        assert_eq!(err.category(), Some(Category::ObjectMap));
    }

    #[test]
    fn compare_matches_tuple_order() {
        let a = Key::new(1, 3, 0);
        let b = Key::new(1, 9, 5).with_name(b"x");
        assert_eq!(compare(&a, &b), Ordering::Less);
        assert_eq!(compare(&b, &b), Ordering::Equal);
    }

    #[test]
    fn record_errors_map_to_categories() {
        let cases = [
            (RecordKind::FileExtent, Category::ExtentRecord),
            (RecordKind::DstreamId, Category::DstreamIdRecord),
            (RecordKind::PhysExtent, Category::PhysicalExtentRecord),
            (RecordKind::CryptoState, Category::CryptoStateRecord),
            (RecordKind::Dstream, Category::DataStream),
            (RecordKind::ObjectMap, Category::ObjectMap),
        ];
        for (kind, expected) in cases {
            let err = record_error(&RecordError::WrongSize {
                kind,
                actual: 1,
                expected: 2,
            });
            assert_eq!(err.category(), Some(expected), "{kind:?}");
        }

        let err = record_error(&RecordError::Parse(ParseError::IntegerConversion {
            field: "len",
        }));
        assert_eq!(err.category(), Some(Category::CatalogTree));
    }

    #[test]
    fn object_errors_map_by_kind() {
        let err = object_error(&ObjectError::Encrypted, 7);
        assert!(matches!(err, FsckError::Unsupported(ref m) if m.contains("0x7")));

        let err = object_error(
            &ObjectError::WrongBlockLength {
                expected: 4096,
                actual: 10,
            },
            7,
        );
        assert!(matches!(err, FsckError::Format(_)));

        let err = object_error(&ObjectError::ReservedObjectId(ObjectId(3)), 7);
        assert_eq!(
            err.to_string(),
            "Object header: reserved object id 0x3 (block 0x7)"
        );
    }
}
