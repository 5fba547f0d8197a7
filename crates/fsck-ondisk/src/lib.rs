#![forbid(unsafe_code)]
//! On-disk format parsing for the checker.
//!
//! Pure parsing crate: no I/O, no side effects. Turns byte slices into typed
//! values for object headers (with Fletcher-64 verification), tree keys (with
//! their total order), filename hashes, and the record values the reference
//! model consumes.

pub mod key;
pub mod name_hash;
pub mod object;
pub mod records;

pub use key::{Key, KeyError, KeyFormat, KeyKind, OwnedKey, RecordType, decode_key, keycmp};
pub use name_hash::{hash_name, name_hash_len, normalized_code_points};
pub use object::{
    ObjectError, ObjectHeader, StorageType, fletcher64, object_checksum, validate_object,
    verify_checksum,
};
pub use records::{
    CryptoStateVal, DstreamIdVal, DstreamStats, FileExtentVal, OmapVal, PhysExtKind, PhysExtVal,
    RecordError, RecordKind,
};
