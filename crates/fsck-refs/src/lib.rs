#![forbid(unsafe_code)]
//! Reference model for physical extents, data streams and crypto states.
//!
//! Three registries keyed by 64-bit id are filled during a single linear
//! scan of the catalog and extent-reference trees. Each entry carries the
//! *stored* values read from its defining record and the *measured* values
//! counted while walking the records that refer to it. After the scan,
//! [`RefModel::reconcile`] links data streams to the extents they use and
//! compares the two sides.
//!
//! Structural problems in a single value (wrong size, reserved bits set)
//! are returned as [`RecordError`] and end the run. Inconsistencies between
//! records are reported to the model's [`Diagnostics`] and the scan goes on.

mod reconcile;

pub use reconcile::ReconcileSummary;

use fsck_error::{Category, Defect, Diagnostics};
use fsck_ondisk::{
    CryptoStateVal, DstreamIdVal, DstreamStats, FileExtentVal, Key, PhysExtKind, PhysExtVal,
    RecordError,
};
use fsck_types::{CRYPTO_SW_ID, VolumeConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

/// Kind of record that owns a data stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DstreamOwner {
    Inode,
    Xattr,
}

/// Physical extent, keyed by its first block.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// Owner kind of the data streams using the extent; all must agree.
    pub owner_obj_type: Option<DstreamOwner>,
    /// Owner named by the `NEW` record.
    pub owning_obj_id: u64,
    /// Owner named by the latest `UPDATE` record.
    pub update_owner: Option<u64>,

    // Read from the physical extent records.
    pub stored_refcount: i32,
    pub stored_blocks: u64,
    pub is_update: bool,
    /// A `NEW` record for the extent has been seen.
    pub has_base: bool,

    // Measured.
    /// Stored reference count plus every update delta.
    pub total_refcount: i64,
    /// Distinct data streams found to use the extent.
    pub references: u32,
    /// Last data stream counted in `references`.
    pub last_owner: Option<u64>,
    /// `owning_obj_id` was among the streams counted in `references`.
    pub owner_linked: bool,
    /// `update_owner` was among the streams counted in `references`.
    pub update_owner_linked: bool,
}

/// A physical range listed by one of a data stream's file extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedExtent {
    pub paddr: u64,
    pub blocks: u64,
}

/// Data stream, keyed by dstream id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dstream {
    pub owner: Option<DstreamOwner>,
    pub owner_id: u64,
    /// The dstream id record has been visited.
    pub seen: bool,
    pub is_orphan: bool,

    // Read from the owning inode or xattr and the dstream id record.
    pub size: u64,
    pub alloced_size: u64,
    pub refcnt: u32,

    // Measured.
    /// Logical address of the first file extent.
    pub logical_start: u64,
    pub bytes: u64,
    pub sparse_bytes: u64,
    pub references: u32,
    /// Physical ranges used by the stream, in logical order.
    pub extents: Vec<ListedExtent>,
}

impl Dstream {
    /// Bytes covered by the file extents read so far, holes included.
    #[must_use]
    pub fn covered_bytes(&self) -> Option<u64> {
        self.bytes.checked_add(self.sparse_bytes)
    }

    fn has_extents(&self) -> bool {
        self.bytes != 0 || self.sparse_bytes != 0
    }
}

/// Crypto state, keyed by crypto id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CryptoState {
    pub refcnt: u32,
    pub key_len: u16,
    pub seen: bool,
    pub references: u32,
    /// Referenced by an overprovisioning file.
    pub overprov: bool,
}

/// The three registries plus the soft-defect sink they report to.
#[derive(Debug)]
pub struct RefModel {
    config: VolumeConfig,
    extents: HashMap<u64, Extent>,
    dstreams: HashMap<u64, Dstream>,
    crypto_states: HashMap<u64, CryptoState>,
    diag: Diagnostics,
}

impl RefModel {
    #[must_use]
    pub fn new(config: VolumeConfig) -> Self {
        Self {
            config,
            extents: HashMap::new(),
            dstreams: HashMap::new(),
            crypto_states: HashMap::new(),
            diag: Diagnostics::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    #[must_use]
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diag
    }

    /// Take the defects reported so far.
    pub fn take_diagnostics(&mut self) -> Diagnostics {
        std::mem::take(&mut self.diag)
    }

    // ── Lookups ─────────────────────────────────────────────────────────────

    /// Get the data stream with `id`, creating it if needed.
    pub fn get_dstream(&mut self, id: u64) -> &mut Dstream {
        self.dstreams.entry(id).or_default()
    }

    /// Get the crypto state with `id`, creating it if needed.
    pub fn get_crypto_state(&mut self, id: u64) -> &mut CryptoState {
        self.crypto_states.entry(id).or_default()
    }

    /// Get the physical extent starting at `bno`, creating it if needed.
    pub fn get_extent(&mut self, bno: u64) -> &mut Extent {
        self.extents.entry(bno).or_default()
    }

    #[must_use]
    pub fn dstream(&self, id: u64) -> Option<&Dstream> {
        self.dstreams.get(&id)
    }

    #[must_use]
    pub fn crypto_state(&self, id: u64) -> Option<&CryptoState> {
        self.crypto_states.get(&id)
    }

    #[must_use]
    pub fn extent(&self, bno: u64) -> Option<&Extent> {
        self.extents.get(&bno)
    }

    #[must_use]
    pub fn dstream_count(&self) -> usize {
        self.dstreams.len()
    }

    #[must_use]
    pub fn extent_count(&self) -> usize {
        self.extents.len()
    }

    #[must_use]
    pub fn crypto_count(&self) -> usize {
        self.crypto_states.len()
    }

    // ── Teardown ────────────────────────────────────────────────────────────

    pub fn free_dstream_table(&mut self) {
        self.dstreams = HashMap::new();
    }

    pub fn free_extent_table(&mut self) {
        self.extents = HashMap::new();
    }

    pub fn free_crypto_table(&mut self) {
        self.crypto_states = HashMap::new();
    }

    // ── Registration ────────────────────────────────────────────────────────

    /// Account for a file extent record of the dstream `key.id` starting at
    /// logical address `key.number`.
    pub fn parse_extent_record(&mut self, key: &Key<'_>, val: &[u8]) -> Result<(), RecordError> {
        let extent = FileExtentVal::parse(val, self.config.block_size)?;
        let dstream_id = key.id;
        let logical_addr = key.number;

        if extent.crypto_id != 0 && extent.crypto_id != CRYPTO_SW_ID {
            self.reference_crypto_state(extent.crypto_id, false);
        }

        let dstream = self.dstreams.entry(dstream_id).or_default();
        if dstream.has_extents() {
            let expected = dstream
                .covered_bytes()
                .and_then(|covered| covered.checked_add(dstream.logical_start));
            if expected != Some(logical_addr) {
                self.diag.report(
                    Defect::new(Category::DataStream, "extents are not consecutive")
                        .with_id(dstream_id),
                );
            }
        } else {
            dstream.logical_start = logical_addr;
        }

        let counter = if extent.is_hole() {
            &mut dstream.sparse_bytes
        } else {
            &mut dstream.bytes
        };
        match counter.checked_add(extent.len) {
            Some(total) => *counter = total,
            None => {
                self.diag.report(
                    Defect::new(Category::DataStream, "extent sizes overflow").with_id(dstream_id),
                );
                return Ok(());
            }
        }

        if !extent.is_hole() {
            dstream.extents.push(ListedExtent {
                paddr: extent.phys_block,
                blocks: extent.blocks(self.config.block_size),
            });
        }

        trace!(
            dstream = dstream_id,
            logical_addr,
            len = extent.len,
            paddr = extent.phys_block,
            "file extent"
        );
        Ok(())
    }

    /// Register the dstream id record for `key.id`.
    pub fn parse_dstream_id_record(
        &mut self,
        key: &Key<'_>,
        val: &[u8],
    ) -> Result<(), RecordError> {
        let record = DstreamIdVal::parse(val)?;
        let dstream = self.dstreams.entry(key.id).or_default();

        if dstream.seen {
            self.diag.report(
                Defect::new(Category::DstreamIdRecord, "dstream id registered twice")
                    .with_id(key.id),
            );
        }
        dstream.seen = true;
        dstream.refcnt = record.refcnt;

        trace!(dstream = key.id, refcnt = record.refcnt, "dstream id");
        Ok(())
    }

    /// Register a physical extent record for the extent starting at block
    /// `key.id`, and return the last block it covers.
    pub fn parse_phys_ext_record(&mut self, key: &Key<'_>, val: &[u8]) -> Result<u64, RecordError> {
        let record = PhysExtVal::parse(val)?;
        let bno = key.id;
        let last_block = bno.saturating_add(record.blocks.saturating_sub(1));
        let extent = self.extents.entry(bno).or_default();

        if record.blocks == 0 {
            self.diag.report(
                Defect::new(Category::PhysicalExtentRecord, "length is zero").with_block(bno),
            );
        }
        if extent.stored_blocks != 0 && extent.stored_blocks != record.blocks {
            self.diag.report(
                Defect::new(
                    Category::PhysicalExtentRecord,
                    format!(
                        "length doesn't match earlier record ({} vs {} blocks)",
                        record.blocks, extent.stored_blocks
                    ),
                )
                .with_block(bno),
            );
        }
        extent.stored_blocks = record.blocks;

        match record.kind {
            PhysExtKind::New => {
                if extent.has_base {
                    self.diag.report(
                        Defect::new(Category::PhysicalExtentRecord, "extent registered twice")
                            .with_block(bno),
                    );
                }
                if record.refcnt <= 0 {
                    self.diag.report(
                        Defect::new(
                            Category::PhysicalExtentRecord,
                            format!("reference count is not positive ({})", record.refcnt),
                        )
                        .with_block(bno),
                    );
                }
                extent.has_base = true;
                extent.stored_refcount = record.refcnt;
                extent.owning_obj_id = record.owning_obj_id;
            }
            PhysExtKind::Update => {
                extent.is_update = true;
                extent.update_owner = Some(record.owning_obj_id);
            }
        }
        extent.total_refcount += i64::from(record.refcnt);

        trace!(
            block = bno,
            blocks = record.blocks,
            kind = ?record.kind,
            owner = record.owning_obj_id,
            refcnt = record.refcnt,
            "physical extent"
        );
        Ok(last_block)
    }

    /// Physical extent records of one tree must not overlap: `first_block`
    /// must lie past `previous_last`, the value returned for the record
    /// before it.
    pub fn check_phys_ext_order(&mut self, first_block: u64, previous_last: Option<u64>) {
        if let Some(prev) = previous_last {
            if first_block <= prev {
                self.diag.report(
                    Defect::new(
                        Category::PhysicalExtentRecord,
                        format!("overlaps previous extent ending at block {prev:#x}"),
                    )
                    .with_block(first_block),
                );
            }
        }
    }

    /// Register the crypto state record for `key.id`.
    pub fn parse_crypto_state_record(
        &mut self,
        key: &Key<'_>,
        val: &[u8],
    ) -> Result<(), RecordError> {
        let record = CryptoStateVal::parse(val)?;
        let state = self.crypto_states.entry(key.id).or_default();

        if state.seen {
            self.diag.report(
                Defect::new(Category::CryptoStateRecord, "crypto state registered twice")
                    .with_id(key.id),
            );
        }
        state.seen = true;
        state.refcnt = record.refcnt;
        state.key_len = record.key_len;

        trace!(
            crypto = key.id,
            refcnt = record.refcnt,
            key_len = record.key_len,
            "crypto state"
        );
        Ok(())
    }

    /// Record that an inode or xattr `owner_id` uses dstream `id`.
    ///
    /// `orphan` marks an inode that is no longer linked into the tree but
    /// whose data has not been released yet.
    pub fn register_dstream_owner(
        &mut self,
        id: u64,
        owner: DstreamOwner,
        owner_id: u64,
        stats: &DstreamStats,
        orphan: bool,
    ) {
        let dstream = self.dstreams.entry(id).or_default();

        match dstream.owner {
            Some(existing) if existing != owner => {
                self.diag.report(
                    Defect::new(Category::DataStream, "owned by both an inode and an xattr")
                        .with_id(id),
                );
            }
            Some(_) if dstream.size != stats.size || dstream.alloced_size != stats.alloced_size => {
                self.diag.report(
                    Defect::new(Category::DataStream, "sizes differ between owners").with_id(id),
                );
            }
            Some(_) => {}
            None => {
                dstream.owner = Some(owner);
                dstream.owner_id = owner_id;
                dstream.size = stats.size;
                dstream.alloced_size = stats.alloced_size;
            }
        }
        dstream.is_orphan |= orphan;
        dstream.references = dstream.references.saturating_add(1);

        trace!(dstream = id, owner = ?owner, owner_id, orphan, "dstream owner");
    }

    /// Count one reference to crypto state `id`.
    pub fn reference_crypto_state(&mut self, id: u64, overprovisioning: bool) {
        let state = self.crypto_states.entry(id).or_default();
        state.references = state.references.saturating_add(1);
        state.overprov |= overprovisioning;
    }
}
