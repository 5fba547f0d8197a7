#![forbid(unsafe_code)]
//! End-of-scan reconciliation of stored against measured values.

use crate::{DstreamOwner, RefModel};
use fsck_error::{Category, Defect};
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

/// Outcome of [`RefModel::reconcile`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileSummary {
    pub extents: usize,
    pub dstreams: usize,
    pub crypto_states: usize,
    /// Crypto states used by at least one overprovisioning file.
    pub overprovisioned: usize,
    /// Data streams with no owning inode or xattr.
    pub orphans: usize,
    /// Defects reported during the scan and the reconciliation combined.
    pub defects: usize,
}

fn sorted_ids<V>(map: &std::collections::HashMap<u64, V>) -> Vec<u64> {
    let mut ids: Vec<u64> = map.keys().copied().collect();
    ids.sort_unstable();
    ids
}

impl RefModel {
    /// Link every data stream to the physical extents it uses, then check
    /// data streams, extents and crypto states in ascending id order.
    pub fn reconcile(&mut self) -> ReconcileSummary {
        self.link_extents();
        let orphans = self.check_dstreams();
        self.check_extents();
        let overprovisioned = self.check_crypto_states();

        let summary = ReconcileSummary {
            extents: self.extents.len(),
            dstreams: self.dstreams.len(),
            crypto_states: self.crypto_states.len(),
            overprovisioned,
            orphans,
            defects: self.diag.len(),
        };
        debug!(
            extents = summary.extents,
            dstreams = summary.dstreams,
            crypto_states = summary.crypto_states,
            orphans = summary.orphans,
            defects = summary.defects,
            "reconciled"
        );
        summary
    }

    /// Resolve each listed extent to the physical extent record covering
    /// its first block and count one reference per distinct data stream.
    fn link_extents(&mut self) {
        let starts = sorted_ids(&self.extents);

        for id in sorted_ids(&self.dstreams) {
            let Some(dstream) = self.dstreams.get(&id) else {
                continue;
            };
            let owner = dstream.owner;
            let owner_id = dstream.owner_id;
            let is_owner = |obj: u64| obj == id || obj == owner_id;

            for listed in &dstream.extents {
                let idx = starts.partition_point(|bno| *bno <= listed.paddr);
                let covering = idx
                    .checked_sub(1)
                    .map(|i| starts[i])
                    .and_then(|bno| self.extents.get_mut(&bno).map(|ext| (bno, ext)))
                    .filter(|(bno, ext)| listed.paddr - bno < ext.stored_blocks);

                let Some((bno, extent)) = covering else {
                    self.diag.report(
                        Defect::new(
                            Category::DataStream,
                            format!(
                                "extent at block {:#x} has no physical extent record",
                                listed.paddr
                            ),
                        )
                        .with_id(id)
                        .with_block(listed.paddr),
                    );
                    continue;
                };

                let end = listed.paddr.saturating_add(listed.blocks);
                if end > bno.saturating_add(extent.stored_blocks) {
                    self.diag.report(
                        Defect::new(
                            Category::DataStream,
                            format!("extent at block {:#x} overruns its physical extent", listed.paddr),
                        )
                        .with_id(id)
                        .with_block(bno),
                    );
                }

                if extent.last_owner != Some(id) {
                    extent.references = extent.references.saturating_add(1);
                    extent.last_owner = Some(id);
                }
                extent.owner_linked |= is_owner(extent.owning_obj_id);
                extent.update_owner_linked |= extent.update_owner.is_some_and(is_owner);

                match (extent.owner_obj_type, owner) {
                    (None, _) => extent.owner_obj_type = owner,
                    (Some(seen), Some(this)) if seen != this => {
                        self.diag.report(
                            Defect::new(
                                Category::PhysicalExtentRecord,
                                "owners of different types",
                            )
                            .with_block(bno),
                        );
                    }
                    _ => {}
                }
            }
        }
    }

    /// Returns the number of orphan data streams.
    fn check_dstreams(&mut self) -> usize {
        let mut orphans = 0;

        for id in sorted_ids(&self.dstreams) {
            let Some(dstream) = self.dstreams.get_mut(&id) else {
                continue;
            };

            match dstream.owner {
                None => {
                    dstream.is_orphan = true;
                    orphans += 1;
                    continue;
                }
                Some(DstreamOwner::Inode) => {
                    if dstream.seen {
                        if dstream.refcnt != dstream.references {
                            self.diag.report(
                                Defect::new(
                                    Category::DataStream,
                                    format!(
                                        "bad reference count (stored={}, measured={})",
                                        dstream.refcnt, dstream.references
                                    ),
                                )
                                .with_id(id),
                            );
                        }
                    } else if !dstream.is_orphan {
                        self.diag.report(
                            Defect::new(Category::DataStream, "missing dstream id record")
                                .with_id(id),
                        );
                    }
                }
                Some(DstreamOwner::Xattr) => {
                    if dstream.seen {
                        self.diag.report(
                            Defect::new(Category::DataStream, "xattr stream has a dstream id record")
                                .with_id(id),
                        );
                    }
                    if dstream.references != 1 {
                        self.diag.report(
                            Defect::new(
                                Category::DataStream,
                                format!(
                                    "xattr stream has {} references",
                                    dstream.references
                                ),
                            )
                            .with_id(id),
                        );
                    }
                }
            }

            match dstream.covered_bytes() {
                Some(covered) => {
                    if covered < dstream.size {
                        self.diag.report(
                            Defect::new(Category::DataStream, "some extents are missing")
                                .with_id(id),
                        );
                    }
                    if covered != dstream.alloced_size {
                        self.diag.report(
                            Defect::new(
                                Category::DataStream,
                                format!(
                                    "wrong allocated space (stored={}, measured={covered})",
                                    dstream.alloced_size
                                ),
                            )
                            .with_id(id),
                        );
                    }
                }
                None => self.diag.report(
                    Defect::new(Category::DataStream, "extent sizes overflow").with_id(id),
                ),
            }
        }

        orphans
    }

    fn check_extents(&mut self) {
        for bno in sorted_ids(&self.extents) {
            let Some(extent) = self.extents.get(&bno) else {
                continue;
            };
            if extent.total_refcount != i64::from(extent.references) {
                self.diag.report(
                    Defect::new(
                        Category::PhysicalExtentRecord,
                        format!(
                            "bad reference count (stored={}, measured={})",
                            extent.total_refcount, extent.references
                        ),
                    )
                    .with_block(bno),
                );
            }
            if extent.references == 0 {
                continue;
            }
            if extent.has_base && !extent.owner_linked {
                self.diag.report(
                    Defect::new(
                        Category::PhysicalExtentRecord,
                        format!("owner {:#x} does not use the extent", extent.owning_obj_id),
                    )
                    .with_block(bno),
                );
            }
            let stale_update = extent.update_owner.filter(|_| !extent.update_owner_linked);
            if let Some(update_owner) = stale_update {
                self.diag.report(
                    Defect::new(
                        Category::PhysicalExtentRecord,
                        format!("update record not referenced by its latest owner {update_owner:#x}"),
                    )
                    .with_block(bno),
                );
            }
        }
    }

    /// Returns the number of crypto states used by overprovisioning files.
    fn check_crypto_states(&mut self) -> usize {
        let mut overprovisioned = 0;

        for id in sorted_ids(&self.crypto_states) {
            let Some(state) = self.crypto_states.get(&id) else {
                continue;
            };
            trace!(
                crypto = id,
                key_len = state.key_len,
                overprov = state.overprov,
                references = state.references,
                "crypto state"
            );
            if state.overprov {
                overprovisioned += 1;
            }
            if !state.seen {
                self.diag.report(
                    Defect::new(Category::CryptoStateRecord, "referenced but has no record")
                        .with_id(id),
                );
            } else if state.refcnt != state.references {
                self.diag.report(
                    Defect::new(
                        Category::CryptoStateRecord,
                        format!(
                            "bad reference count (stored={}, measured={})",
                            state.refcnt, state.references
                        ),
                    )
                    .with_id(id),
                );
            }
        }

        overprovisioned
    }
}

#[cfg(test)]
mod tests {
    use crate::DstreamOwner;
    use crate::tests::{crypto_val, file_extent_val, key, model, phys_ext_val, stats};
    use fsck_error::Category;
    use fsck_ondisk::{PhysExtKind, RecordType};

    /// One inode-owned stream of `len` bytes at `paddr`, with its dstream id
    /// record.
    fn add_stream(refs: &mut crate::RefModel, id: u64, paddr: u64, len: u64) {
        refs.register_dstream_owner(id, DstreamOwner::Inode, id, &stats(len, len), false);
        refs.parse_dstream_id_record(&key(id, RecordType::DstreamId, 0), &1_u32.to_le_bytes())
            .expect("dstream id");
        refs.parse_extent_record(
            &key(id, RecordType::FileExtent, 0),
            &file_extent_val(len, paddr, 0),
        )
        .expect("file extent");
    }

    fn add_phys(refs: &mut crate::RefModel, bno: u64, blocks: u64, refcnt: i32) {
        refs.parse_phys_ext_record(
            &key(bno, RecordType::PhysExtent, 0),
            &phys_ext_val(blocks, PhysExtKind::New, 0x20, refcnt),
        )
        .expect("phys ext");
    }

    #[test]
    fn single_stream_single_extent_is_clean() {
        let mut refs = model();
        add_stream(&mut refs, 0x20, 0x100, 4096);
        add_phys(&mut refs, 0x100, 1, 1);

        let summary = refs.reconcile();
        assert!(
            refs.diagnostics().is_clean(),
            "unexpected defects: {:?}",
            refs.diagnostics().defects()
        );
        assert_eq!(summary.extents, 1);
        assert_eq!(summary.dstreams, 1);
        assert_eq!(summary.orphans, 0);
        assert_eq!(summary.defects, 0);
        assert_eq!(refs.extent(0x100).map(|e| e.references), Some(1));
    }

    #[test]
    fn shared_extent_counts_each_stream_once() {
        let mut refs = model();
        add_stream(&mut refs, 0x20, 0x100, 8192);
        add_stream(&mut refs, 0x30, 0x100, 8192);
        add_phys(&mut refs, 0x100, 2, 2);

        refs.reconcile();
        let extent = refs.extent(0x100).expect("extent");
        assert_eq!(extent.references, 2);
        assert_eq!(extent.owner_obj_type, Some(DstreamOwner::Inode));
        assert!(refs.diagnostics().is_clean(), "{:?}", refs.diagnostics().defects());
    }

    #[test]
    fn shared_extent_with_refcount_one_is_reported() {
        let mut refs = model();
        add_stream(&mut refs, 0x20, 0x100, 4096);
        add_stream(&mut refs, 0x30, 0x100, 4096);
        add_phys(&mut refs, 0x100, 1, 1);

        refs.reconcile();
        let defects = refs.diagnostics().defects();
        assert_eq!(defects.len(), 1, "{defects:?}");
        assert_eq!(defects[0].message, "bad reference count (stored=1, measured=2)");
    }

    #[test]
    fn update_record_adjusts_expected_refcount() {
        let mut refs = model();
        add_stream(&mut refs, 0x20, 0x100, 4096);
        add_stream(&mut refs, 0x30, 0x100, 4096);
        add_phys(&mut refs, 0x100, 1, 1);
        refs.parse_phys_ext_record(
            &key(0x100, RecordType::PhysExtent, 0),
            &phys_ext_val(1, PhysExtKind::Update, 0x30, 1),
        )
        .expect("update");

        refs.reconcile();
        assert!(refs.diagnostics().is_clean(), "{:?}", refs.diagnostics().defects());
    }

    #[test]
    fn two_extents_in_one_stream_count_once() {
        let mut refs = model();
        add_stream(&mut refs, 0x20, 0x100, 4096);
        refs.parse_extent_record(
            &key(0x20, RecordType::FileExtent, 4096),
            &file_extent_val(4096, 0x101, 0),
        )
        .expect("second extent");
        refs.get_dstream(0x20).size = 8192;
        refs.get_dstream(0x20).alloced_size = 8192;
        add_phys(&mut refs, 0x100, 2, 1);

        refs.reconcile();
        assert_eq!(refs.extent(0x100).map(|e| e.references), Some(1));
        assert!(refs.diagnostics().is_clean(), "{:?}", refs.diagnostics().defects());
    }

    #[test]
    fn stored_refcount_two_with_one_reference() {
        let mut refs = model();
        add_stream(&mut refs, 0x20, 0x100, 4096);
        add_phys(&mut refs, 0x100, 1, 2);

        refs.reconcile();
        let defects = refs.diagnostics().defects();
        assert_eq!(defects.len(), 1, "{defects:?}");
        assert_eq!(defects[0].category, Category::PhysicalExtentRecord);
        assert_eq!(defects[0].block, Some(0x100));
        assert_eq!(defects[0].message, "bad reference count (stored=2, measured=1)");
    }

    #[test]
    fn extent_without_physical_record() {
        let mut refs = model();
        add_stream(&mut refs, 0x20, 0x900, 4096);
        add_phys(&mut refs, 0x100, 1, 1);

        refs.reconcile();
        let defects = refs.diagnostics().defects();
        assert_eq!(defects.len(), 2, "{defects:?}");
        assert_eq!(defects[0].category, Category::DataStream);
        assert_eq!(defects[0].block, Some(0x900));
        assert_eq!(defects[0].message, "extent at block 0x900 has no physical extent record");
        // The registered extent is then unreferenced.
        assert_eq!(defects[1].message, "bad reference count (stored=1, measured=0)");
    }

    #[test]
    fn stream_without_owner_is_orphan_not_defect() {
        let mut refs = model();
        refs.parse_dstream_id_record(&key(0x50, RecordType::DstreamId, 0), &0_u32.to_le_bytes())
            .expect("dstream id");

        let summary = refs.reconcile();
        assert_eq!(summary.orphans, 1);
        assert!(refs.dstream(0x50).expect("dstream").is_orphan);
        assert!(refs.diagnostics().is_clean());
    }

    #[test]
    fn inode_stream_missing_dstream_id_record() {
        let mut refs = model();
        refs.register_dstream_owner(0x60, DstreamOwner::Inode, 0x60, &stats(0, 0), false);
        refs.register_dstream_owner(0x61, DstreamOwner::Inode, 0x61, &stats(0, 0), true);

        refs.reconcile();
        let defects = refs.diagnostics().defects();
        assert_eq!(defects.len(), 1, "{defects:?}");
        assert_eq!(defects[0].id, Some(0x60));
        assert_eq!(defects[0].message, "missing dstream id record");
    }

    #[test]
    fn size_checks_on_owned_streams() {
        let mut refs = model();
        refs.register_dstream_owner(0x20, DstreamOwner::Inode, 0x20, &stats(8192, 8192), false);
        refs.parse_dstream_id_record(&key(0x20, RecordType::DstreamId, 0), &1_u32.to_le_bytes())
            .expect("dstream id");
        refs.parse_extent_record(
            &key(0x20, RecordType::FileExtent, 0),
            &file_extent_val(4096, 0x100, 0),
        )
        .expect("extent");
        add_phys(&mut refs, 0x100, 1, 1);

        refs.reconcile();
        let messages: Vec<&str> = refs
            .diagnostics()
            .defects()
            .iter()
            .map(|d| d.message.as_str())
            .collect();
        assert_eq!(
            messages,
            vec![
                "some extents are missing",
                "wrong allocated space (stored=8192, measured=4096)",
            ]
        );
    }

    #[test]
    fn xattr_streams_have_single_reference_and_no_id_record() {
        let mut refs = model();
        refs.register_dstream_owner(0x70, DstreamOwner::Xattr, 0x10, &stats(4096, 4096), false);
        refs.parse_extent_record(
            &key(0x70, RecordType::FileExtent, 0),
            &file_extent_val(4096, 0x200, 0),
        )
        .expect("extent");
        refs.parse_phys_ext_record(
            &key(0x200, RecordType::PhysExtent, 0),
            &phys_ext_val(1, PhysExtKind::New, 0x70, 1),
        )
        .expect("phys ext");
        refs.reconcile();
        assert!(refs.diagnostics().is_clean(), "{:?}", refs.diagnostics().defects());

        let mut refs = model();
        refs.register_dstream_owner(0x70, DstreamOwner::Xattr, 0x10, &stats(0, 0), false);
        refs.parse_dstream_id_record(&key(0x70, RecordType::DstreamId, 0), &1_u32.to_le_bytes())
            .expect("dstream id");
        refs.reconcile();
        assert_eq!(
            refs.diagnostics().defects()[0].message,
            "xattr stream has a dstream id record"
        );
    }

    #[test]
    fn extent_shared_by_inode_and_xattr_streams() {
        let mut refs = model();
        add_stream(&mut refs, 0x20, 0x100, 4096);
        refs.register_dstream_owner(0x70, DstreamOwner::Xattr, 0x10, &stats(4096, 4096), false);
        refs.parse_extent_record(
            &key(0x70, RecordType::FileExtent, 0),
            &file_extent_val(4096, 0x100, 0),
        )
        .expect("extent");
        add_phys(&mut refs, 0x100, 1, 2);

        refs.reconcile();
        let defects = refs.diagnostics().defects();
        assert_eq!(defects.len(), 1, "{defects:?}");
        assert_eq!(defects[0].message, "owners of different types");
    }

    #[test]
    fn extent_owner_must_use_the_extent() {
        let mut refs = model();
        add_stream(&mut refs, 0x30, 0x100, 4096);
        add_phys(&mut refs, 0x100, 1, 1);

        refs.reconcile();
        let defects = refs.diagnostics().defects();
        assert_eq!(defects.len(), 1, "{defects:?}");
        assert_eq!(defects[0].category, Category::PhysicalExtentRecord);
        assert_eq!(defects[0].block, Some(0x100));
        assert_eq!(defects[0].message, "owner 0x20 does not use the extent");
    }

    #[test]
    fn owner_may_be_the_object_owning_the_stream() {
        let mut refs = model();
        refs.register_dstream_owner(0x30, DstreamOwner::Inode, 0x20, &stats(4096, 4096), false);
        refs.parse_dstream_id_record(&key(0x30, RecordType::DstreamId, 0), &1_u32.to_le_bytes())
            .expect("dstream id");
        refs.parse_extent_record(
            &key(0x30, RecordType::FileExtent, 0),
            &file_extent_val(4096, 0x100, 0),
        )
        .expect("file extent");
        add_phys(&mut refs, 0x100, 1, 1);

        refs.reconcile();
        assert!(refs.diagnostics().is_clean(), "{:?}", refs.diagnostics().defects());
        assert!(refs.extent(0x100).expect("extent").owner_linked);
    }

    #[test]
    fn update_record_owner_must_still_use_the_extent() {
        let mut refs = model();
        add_stream(&mut refs, 0x20, 0x100, 4096);
        add_phys(&mut refs, 0x100, 1, 1);
        refs.parse_phys_ext_record(
            &key(0x100, RecordType::PhysExtent, 0),
            &phys_ext_val(1, PhysExtKind::Update, 0x40, 0),
        )
        .expect("update");

        refs.reconcile();
        let extent = refs.extent(0x100).expect("extent");
        assert_eq!(extent.update_owner, Some(0x40));
        assert!(!extent.update_owner_linked);
        let defects = refs.diagnostics().defects();
        assert_eq!(defects.len(), 1, "{defects:?}");
        assert_eq!(defects[0].block, Some(0x100));
        assert_eq!(
            defects[0].message,
            "update record not referenced by its latest owner 0x40"
        );
    }

    #[test]
    fn unreferenced_extent_skips_owner_checks() {
        let mut refs = model();
        refs.parse_phys_ext_record(
            &key(0x100, RecordType::PhysExtent, 0),
            &phys_ext_val(1, PhysExtKind::Update, 0x40, 0),
        )
        .expect("update");

        refs.reconcile();
        assert!(refs.diagnostics().is_clean(), "{:?}", refs.diagnostics().defects());
    }

    #[test]
    fn overprovisioned_crypto_states_are_counted() {
        let mut refs = model();
        refs.parse_crypto_state_record(&key(0x80, RecordType::CryptoState, 0), &crypto_val(2, 16))
            .expect("crypto");
        refs.reference_crypto_state(0x80, true);
        refs.reference_crypto_state(0x80, false);

        let summary = refs.reconcile();
        assert_eq!(summary.overprovisioned, 1);
        assert!(refs.diagnostics().is_clean(), "{:?}", refs.diagnostics().defects());
    }

    #[test]
    fn crypto_refcounts_reconciled() {
        let mut refs = model();
        refs.parse_crypto_state_record(&key(0x80, RecordType::CryptoState, 0), &crypto_val(2, 16))
            .expect("crypto");
        refs.reference_crypto_state(0x80, false);
        refs.reference_crypto_state(0x81, false);

        refs.reconcile();
        let defects = refs.diagnostics().defects();
        assert_eq!(defects.len(), 2, "{defects:?}");
        assert_eq!(defects[0].id, Some(0x80));
        assert_eq!(defects[0].message, "bad reference count (stored=2, measured=1)");
        assert_eq!(defects[1].id, Some(0x81));
        assert_eq!(defects[1].message, "referenced but has no record");
    }

    #[test]
    fn summary_serializes() {
        let mut refs = model();
        add_stream(&mut refs, 0x20, 0x100, 4096);
        add_phys(&mut refs, 0x100, 1, 1);
        let summary = refs.reconcile();
        let json = serde_json::to_string(&summary).expect("serialize");
        assert!(json.contains("\"orphans\":0"));
    }
}
