#![forbid(unsafe_code)]
//! Whole-image checksum sweep.
//!
//! Reads every block in a range and looks for things that claim to be
//! objects. A block is treated as an object when its header carries a
//! non-zero object type and a transaction id in `1..=current_xid`; file
//! data almost never looks like that. Objects whose Fletcher-64 checksum
//! fails are reported. Never-written (all-zero) blocks are skipped.
//!
//! Unlike [`crate::ObjectReader::read_object`], the sweep never stops on a
//! bad block: every finding is collected into the [`SweepReport`].

use fsck_block::{BlockBuf, BlockDevice};
use fsck_ondisk::{ObjectHeader, object_checksum};
use fsck_types::{BlockNumber, VolumeConfig};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

// ── Findings ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepFindingKind {
    /// Stored checksum does not match the computed one.
    ChecksumMismatch,
    /// The device returned an error for this block.
    IoError,
}

impl fmt::Display for SweepFindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ChecksumMismatch => write!(f, "checksum_mismatch"),
            Self::IoError => write!(f, "io_error"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepFinding {
    pub block: u64,
    pub kind: SweepFindingKind,
    /// Object id from the header, when the block could be read.
    pub oid: Option<u64>,
    pub detail: String,
}

impl fmt::Display for SweepFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "block {:#x} {}: {}", self.block, self.kind, self.detail)
    }
}

// ── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Findings ordered by block number.
    pub findings: Vec<SweepFinding>,
    pub blocks_scanned: u64,
    /// All-zero blocks.
    pub blocks_empty: u64,
    /// Blocks that looked like objects.
    pub objects_found: u64,
    pub blocks_io_error: u64,
}

impl SweepReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    #[must_use]
    pub fn count_of(&self, kind: SweepFindingKind) -> usize {
        self.findings.iter().filter(|f| f.kind == kind).count()
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "scanned {} blocks: {} objects, {} empty, {} io_errors, {} findings",
            self.blocks_scanned,
            self.objects_found,
            self.blocks_empty,
            self.blocks_io_error,
            self.findings.len(),
        )
    }
}

// ── Sweeper ─────────────────────────────────────────────────────────────────

enum Verdict {
    Empty,
    NotObject,
    Valid,
    BadChecksum { oid: u64, stored: u64, computed: u64 },
}

fn classify(data: &BlockBuf, config: &VolumeConfig) -> Verdict {
    if data.is_zeroed() {
        return Verdict::Empty;
    }
    let Ok(header) = ObjectHeader::parse_from_block(data.as_slice()) else {
        return Verdict::NotObject;
    };
    if header.obj_type == 0 || header.xid.0 == 0 || header.xid > config.current_xid {
        return Verdict::NotObject;
    }
    match object_checksum(data.as_slice()) {
        Ok(computed) if computed == header.checksum => Verdict::Valid,
        Ok(computed) => Verdict::BadChecksum {
            oid: header.oid.0,
            stored: header.checksum,
            computed,
        },
        Err(_) => Verdict::NotObject,
    }
}

pub struct Sweeper<'a> {
    device: &'a dyn BlockDevice,
    config: &'a VolumeConfig,
}

impl<'a> Sweeper<'a> {
    pub fn new(device: &'a dyn BlockDevice, config: &'a VolumeConfig) -> Self {
        Self { device, config }
    }

    /// Sweep blocks `[start, start + count)`, clamped to the device.
    #[must_use]
    pub fn sweep_range(&self, start: BlockNumber, count: u64) -> SweepReport {
        let end = start.0.saturating_add(count).min(self.device.block_count());
        let mut report = SweepReport::default();

        for bno in start.0..end {
            report.blocks_scanned += 1;

            let data = match self.device.read_block(BlockNumber(bno)) {
                Ok(data) => data,
                Err(e) => {
                    report.blocks_io_error += 1;
                    report.findings.push(SweepFinding {
                        block: bno,
                        kind: SweepFindingKind::IoError,
                        oid: None,
                        detail: format!("read failed: {e}"),
                    });
                    continue;
                }
            };

            match classify(&data, self.config) {
                Verdict::Empty => report.blocks_empty += 1,
                Verdict::NotObject => {}
                Verdict::Valid => report.objects_found += 1,
                Verdict::BadChecksum {
                    oid,
                    stored,
                    computed,
                } => {
                    report.objects_found += 1;
                    warn!(block = bno, oid, stored, computed, "bad object checksum");
                    report.findings.push(SweepFinding {
                        block: bno,
                        kind: SweepFindingKind::ChecksumMismatch,
                        oid: Some(oid),
                        detail: format!(
                            "bad checksum for object {oid:#x} (stored {stored:#018x}, computed {computed:#018x})"
                        ),
                    });
                }
            }
        }

        debug!(
            scanned = report.blocks_scanned,
            objects = report.objects_found,
            findings = report.findings.len(),
            "sweep done"
        );
        report
    }

    #[must_use]
    pub fn sweep_all(&self) -> SweepReport {
        self.sweep_range(BlockNumber(0), self.device.block_count())
    }
}
