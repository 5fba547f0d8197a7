#![forbid(unsafe_code)]
//! Object map lookups.

use crate::{key_error, record_error};
use fsck_error::{Category, FsckError, Result};
use fsck_ondisk::{KeyFormat, OmapVal, decode_key};
use fsck_types::Xid;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One object map mapping: virtual `oid` at transaction `xid` lives in
/// physical block `bno`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OmapRecord {
    pub oid: u64,
    pub xid: u64,
    pub bno: u64,
}

/// Virtual-to-physical translation for [`crate::ObjectReader`].
pub trait ObjectMap {
    /// Newest mapping for `oid` written no later than `max_xid`.
    ///
    /// Mappings from later transactions belong to a checkpoint that was
    /// never committed and are ignored.
    fn lookup(&self, oid: u64, max_xid: Xid) -> Result<OmapRecord>;
}

/// Object map held in memory, filled from decoded leaf records.
#[derive(Debug, Clone, Default)]
pub struct OmapTable {
    entries: BTreeMap<(u64, u64), u64>,
}

impl OmapTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, oid: u64, xid: u64, bno: u64) {
        self.entries.insert((oid, xid), bno);
    }

    /// Add one raw object map leaf record.
    pub fn insert_raw(&mut self, raw_key: &[u8], raw_val: &[u8]) -> Result<OmapRecord> {
        let key = decode_key(KeyFormat::ObjectMap, raw_key, false).map_err(|e| key_error(&e))?;
        let val = OmapVal::parse(raw_val).map_err(|e| record_error(&e))?;
        self.insert(key.id, key.number, val.paddr);
        Ok(OmapRecord {
            oid: key.id,
            xid: key.number,
            bno: val.paddr,
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl ObjectMap for OmapTable {
    fn lookup(&self, oid: u64, max_xid: Xid) -> Result<OmapRecord> {
        self.entries
            .range((oid, 0)..=(oid, max_xid.0))
            .next_back()
            .map(|(&(oid, xid), &bno)| OmapRecord { oid, xid, bno })
            .ok_or_else(|| {
                FsckError::corruption(
                    Category::ObjectMap,
                    None,
                    format!("record missing for id {oid:#x}"),
                )
            })
    }
}
