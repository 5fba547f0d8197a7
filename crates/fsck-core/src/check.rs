#![forbid(unsafe_code)]
//! A check session: leaf records in, defect report out.

use crate::{decode_key, record_error};
use fsck_error::{Category, Defect, FsckError, Result};
use fsck_ondisk::{DstreamStats, Key, KeyFormat, RecordType};
use fsck_refs::{DstreamOwner, ReconcileSummary, RefModel};
use fsck_types::{CRYPTO_SW_ID, VolumeConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Final result of a check run that was not stopped by a fatal error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckReport {
    pub summary: ReconcileSummary,
    pub defects: Vec<Defect>,
}

impl CheckReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.defects.is_empty()
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_clean() {
            fsck_error::EXIT_CLEAN
        } else {
            fsck_error::EXIT_UNCORRECTED
        }
    }

    #[must_use]
    pub fn count_in(&self, category: Category) -> usize {
        self.defects
            .iter()
            .filter(|d| d.category == category)
            .count()
    }
}

/// Feeds decoded catalog and extent-reference records to the reference
/// model.
///
/// Record kinds the model does not track are accepted as is. A structural
/// problem in any record ends the session with an error.
#[derive(Debug)]
pub struct Check {
    refs: RefModel,
    /// Last block of the previous physical extent record in this tree.
    last_phys_block: Option<u64>,
}

impl Check {
    #[must_use]
    pub fn new(config: VolumeConfig) -> Self {
        Self {
            refs: RefModel::new(config),
            last_phys_block: None,
        }
    }

    #[must_use]
    pub fn refs(&self) -> &RefModel {
        &self.refs
    }

    /// Start a new extent-reference tree; overlap checks restart.
    pub fn begin_extentref_tree(&mut self) {
        self.last_phys_block = None;
    }

    /// Decode and ingest one raw leaf record.
    pub fn ingest_raw(&mut self, raw_key: &[u8], raw_val: &[u8]) -> Result<()> {
        let case_insensitive = self.refs.config().case_insensitive;
        let key = decode_key(KeyFormat::Catalog, raw_key, case_insensitive)?;
        self.ingest(&key, raw_val)
    }

    /// Ingest one decoded leaf record.
    pub fn ingest(&mut self, key: &Key<'_>, val: &[u8]) -> Result<()> {
        let Some(record_type) = key.record_type() else {
            return Err(FsckError::corruption(
                Category::CatalogTree,
                None,
                format!("unknown record type {}", key.record_type),
            ));
        };

        match record_type {
            RecordType::FileExtent => self
                .refs
                .parse_extent_record(key, val)
                .map_err(|e| record_error(&e)),
            RecordType::DstreamId => self
                .refs
                .parse_dstream_id_record(key, val)
                .map_err(|e| record_error(&e)),
            RecordType::CryptoState => self
                .refs
                .parse_crypto_state_record(key, val)
                .map_err(|e| record_error(&e)),
            RecordType::PhysExtent => {
                self.refs.check_phys_ext_order(key.id, self.last_phys_block);
                let last = self
                    .refs
                    .parse_phys_ext_record(key, val)
                    .map_err(|e| record_error(&e))?;
                self.last_phys_block = Some(last);
                Ok(())
            }
            _ => {
                trace!(id = key.id, record_type = ?record_type, "record not tracked");
                Ok(())
            }
        }
    }

    /// An inode `inode_id` stores its data in dstream `dstream_id`.
    pub fn register_inode_dstream(
        &mut self,
        inode_id: u64,
        dstream_id: u64,
        stats: &DstreamStats,
        orphan: bool,
    ) {
        self.refs
            .register_dstream_owner(dstream_id, DstreamOwner::Inode, inode_id, stats, orphan);
        if stats.default_crypto_id != 0 && stats.default_crypto_id != CRYPTO_SW_ID {
            self.refs.reference_crypto_state(stats.default_crypto_id, false);
        }
    }

    /// An xattr of inode `inode_id` stores its value in dstream `dstream_id`.
    pub fn register_xattr_dstream(&mut self, inode_id: u64, dstream_id: u64, stats: &DstreamStats) {
        self.refs
            .register_dstream_owner(dstream_id, DstreamOwner::Xattr, inode_id, stats, false);
    }

    /// Reconcile, release the registries, and return every soft defect.
    #[must_use]
    pub fn finish(mut self) -> CheckReport {
        let summary = self.refs.reconcile();
        self.refs.free_dstream_table();
        self.refs.free_extent_table();
        self.refs.free_crypto_table();

        let mut diag = self.refs.take_diagnostics();
        let defects = diag.drain();
        debug!(defects = defects.len(), orphans = summary.orphans, "check finished");
        CheckReport { summary, defects }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fsck_types::{BlockSize, OBJ_TYPE_SHIFT, Xid};

    fn config() -> VolumeConfig {
        VolumeConfig::new(BlockSize::new(4096).expect("bs"), Xid(10), false)
    }

    fn catalog_key(id: u64, record_type: RecordType, tail: &[u8]) -> Vec<u8> {
        let mut raw = (id | (u64::from(record_type.raw()) << OBJ_TYPE_SHIFT))
            .to_le_bytes()
            .to_vec();
        raw.extend_from_slice(tail);
        raw
    }

    fn file_extent(len: u64, paddr: u64) -> Vec<u8> {
        let mut raw = len.to_le_bytes().to_vec();
        raw.extend_from_slice(&paddr.to_le_bytes());
        raw.extend_from_slice(&0_u64.to_le_bytes());
        raw
    }

    fn phys_ext(blocks: u64, refcnt: i32) -> Vec<u8> {
        let mut raw = (blocks | (1 << 60)).to_le_bytes().to_vec();
        raw.extend_from_slice(&0x20_u64.to_le_bytes());
        raw.extend_from_slice(&refcnt.to_le_bytes());
        raw
    }

    fn stats(size: u64) -> DstreamStats {
        DstreamStats {
            size,
            alloced_size: size,
            ..DstreamStats::default()
        }
    }

    fn populated(refcnt: i32) -> Check {
        let mut check = Check::new(config());
        check.register_inode_dstream(0x20, 0x20, &stats(4096), false);
        check
            .ingest_raw(
                &catalog_key(0x20, RecordType::DstreamId, &[]),
                &1_u32.to_le_bytes(),
            )
            .expect("dstream id");
        check
            .ingest_raw(
                &catalog_key(0x20, RecordType::FileExtent, &0_u64.to_le_bytes()),
                &file_extent(4096, 0x100),
            )
            .expect("file extent");
        check
            .ingest_raw(
                &catalog_key(0x100, RecordType::PhysExtent, &[]),
                &phys_ext(1, refcnt),
            )
            .expect("phys ext");
        check
    }

    #[test]
    fn clean_records_produce_clean_report() {
        let report = populated(1).finish();
        assert!(report.is_clean(), "{:?}", report.defects);
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.summary.extents, 1);
    }

    #[test]
    fn refcount_mismatch_reported_once() {
        let report = populated(2).finish();
        assert_eq!(report.defects.len(), 1);
        assert_eq!(report.count_in(Category::PhysicalExtentRecord), 1);
        assert_eq!(report.exit_code(), 4);
        assert_eq!(
            report.defects[0].to_string(),
            "Physical extent record (block 0x100): bad reference count (stored=2, measured=1)"
        );
    }

    #[test]
    fn untracked_records_are_accepted() {
        let mut check = Check::new(config());
        check
            .ingest_raw(&catalog_key(0x20, RecordType::Inode, &[]), &[0_u8; 92])
            .expect("inode record");
        check
            .ingest_raw(&catalog_key(0x20, RecordType::SiblingLink, &5_u64.to_le_bytes()), &[])
            .expect("sibling link");
        assert!(check.finish().is_clean());
    }

    #[test]
    fn malformed_value_is_fatal_with_category() {
        let mut check = Check::new(config());
        let err = check
            .ingest_raw(&catalog_key(0x20, RecordType::DstreamId, &[]), &[0_u8; 2])
            .unwrap_err();
        assert_eq!(err.category(), Some(Category::DstreamIdRecord));

        let err = check
            .ingest_raw(
                &catalog_key(0x20, RecordType::FileExtent, &0_u64.to_le_bytes()),
                &file_extent(100, 0x100),
            )
            .unwrap_err();
        assert_eq!(err.category(), Some(Category::ExtentRecord));
    }

    #[test]
    fn malformed_key_is_fatal() {
        let mut check = Check::new(config());
        let err = check
            .ingest_raw(&catalog_key(0x20, RecordType::FileExtent, &[1, 2]), &[])
            .unwrap_err();
        assert_eq!(err.category(), Some(Category::ExtentRecord));
    }

    #[test]
    fn unknown_record_type_in_decoded_key() {
        let mut check = Check::new(config());
        let err = check.ingest(&Key::new(1, 15, 0), &[]).unwrap_err();
        assert_eq!(err.category(), Some(Category::CatalogTree));
    }

    #[test]
    fn overlapping_physical_extents_within_one_tree() {
        let mut check = Check::new(config());
        check
            .ingest_raw(&catalog_key(0x100, RecordType::PhysExtent, &[]), &phys_ext(4, 1))
            .expect("first");
        check
            .ingest_raw(&catalog_key(0x102, RecordType::PhysExtent, &[]), &phys_ext(1, 1))
            .expect("second");
        assert_eq!(
            check
                .refs()
                .diagnostics()
                .count_in(Category::PhysicalExtentRecord),
            1
        );

        check.begin_extentref_tree();
        check
            .ingest_raw(&catalog_key(0x100, RecordType::PhysExtent, &[]), &phys_ext(4, 1))
            .expect("next tree");
        // Ordering restarted; only the duplicate base record is reported.
        assert_eq!(
            check
                .refs()
                .diagnostics()
                .count_in(Category::PhysicalExtentRecord),
            2
        );
    }

    #[test]
    fn inode_default_crypto_is_referenced() {
        let mut check = Check::new(config());
        let stats = DstreamStats {
            default_crypto_id: 0x77,
            ..DstreamStats::default()
        };
        check.register_inode_dstream(0x20, 0x20, &stats, true);
        assert_eq!(
            check.refs().crypto_state(0x77).map(|c| c.references),
            Some(1)
        );
    }
}
