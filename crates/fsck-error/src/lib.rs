#![forbid(unsafe_code)]
//! Error types for the checker.
//!
//! # Two channels
//!
//! | Channel | Type | Policy |
//! |---------|------|--------|
//! | Fatal | [`FsckError`] | Structural defects (bad checksum, bad header, malformed key). Propagated with `?`; the run stops. |
//! | Soft | [`Diagnostics`] of [`Defect`] | Reconciliation defects (refcounts, sizes, ownership). Accumulated; the run continues. |
//!
//! A structural defect means the bytes backing a structure cannot be trusted,
//! so anything derived from them afterwards would only produce secondary
//! noise. Reconciliation defects are independent of each other and are all
//! worth reporting in a single run.
//!
//! ## Mapping policy
//!
//! `fsck-error` does not depend on the parsing crates. Parse errors from
//! `fsck-types` and `fsck-ondisk` are converted into [`FsckError`] in
//! `fsck-core`, which attaches the [`Category`] and block context.
//!
//! ## Exit codes
//!
//! [`FsckError::exit_code`] and [`Diagnostics::exit_code`] follow fsck(8):
//!
//! | Outcome | Code |
//! |---------|------|
//! | No defects | `0` |
//! | Defects found (fatal or soft) | `4` |
//! | Operational error (I/O, bad arguments, unsupported image) | `8` |

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::warn;

pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_UNCORRECTED: i32 = 4;
pub const EXIT_OPERATIONAL: i32 = 8;

/// Kind of on-disk structure a defect was found in.
///
/// The display string is the `category` half of every report line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    ObjectHeader,
    ObjectMap,
    DirectoryRecord,
    XattrRecord,
    ExtentRecord,
    SnapshotNameRecord,
    SiblingLinkRecord,
    FileInfoRecord,
    CatalogTree,
    PhysicalExtentRecord,
    DstreamIdRecord,
    DataStream,
    CryptoStateRecord,
}

impl Category {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ObjectHeader => "Object header",
            Self::ObjectMap => "Object map",
            Self::DirectoryRecord => "Directory record",
            Self::XattrRecord => "Xattr record",
            Self::ExtentRecord => "Extent record",
            Self::SnapshotNameRecord => "Snapshot name record",
            Self::SiblingLinkRecord => "Sibling link record",
            Self::FileInfoRecord => "File info record",
            Self::CatalogTree => "Catalog tree record",
            Self::PhysicalExtentRecord => "Physical extent record",
            Self::DstreamIdRecord => "Dstream id record",
            Self::DataStream => "Data stream",
            Self::CryptoStateRecord => "Crypto state record",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn block_suffix(block: &Option<u64>) -> String {
    block.map_or_else(String::new, |b| format!(" (block {b:#x})"))
}

/// Fatal error: the run cannot continue.
#[derive(Debug, Error)]
pub enum FsckError {
    /// Operating system I/O error while reading the image.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A structure failed validation. `block` is set when the physical
    /// location is known.
    #[error("{category}: {detail}{}", block_suffix(.block))]
    Corruption {
        category: Category,
        block: Option<u64>,
        detail: String,
    },

    /// The image or the run configuration is unusable (bad block size,
    /// block out of range, truncated image).
    #[error("invalid image or configuration: {0}")]
    Format(String),

    /// A structure uses a feature the checker does not understand
    /// (encrypted objects, headerless objects).
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl FsckError {
    #[must_use]
    pub fn corruption(category: Category, block: Option<u64>, detail: impl Into<String>) -> Self {
        Self::Corruption {
            category,
            block,
            detail: detail.into(),
        }
    }

    /// Category of a corruption error, if this is one.
    #[must_use]
    pub fn category(&self) -> Option<Category> {
        match self {
            Self::Corruption { category, .. } => Some(*category),
            Self::Io(_) | Self::Format(_) | Self::Unsupported(_) => None,
        }
    }

    /// fsck(8) exit code for a run that stopped on this error.
    ///
    /// Exhaustive on purpose: a new variant must pick its code.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Corruption { .. } => EXIT_UNCORRECTED,
            Self::Io(_) | Self::Format(_) | Self::Unsupported(_) => EXIT_OPERATIONAL,
        }
    }
}

pub type Result<T> = std::result::Result<T, FsckError>;

/// A reconciliation defect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defect {
    pub category: Category,
    /// Record id (dstream id, crypto id, object id) when one applies.
    pub id: Option<u64>,
    /// Physical block when one applies.
    pub block: Option<u64>,
    pub message: String,
}

impl Defect {
    #[must_use]
    pub fn new(category: Category, message: impl Into<String>) -> Self {
        Self {
            category,
            id: None,
            block: None,
            message: message.into(),
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn with_block(mut self, block: u64) -> Self {
        self.block = Some(block);
        self
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.category)?;
        match (self.id, self.block) {
            (Some(id), Some(block)) => write!(f, " (id {id:#x}, block {block:#x})")?,
            (Some(id), None) => write!(f, " (id {id:#x})")?,
            (None, Some(block)) => write!(f, " (block {block:#x})")?,
            (None, None) => {}
        }
        write!(f, ": {}", self.message)
    }
}

/// Accumulating sink for soft defects.
///
/// Every defect is logged when reported and kept until drained at the
/// end of the run.
#[derive(Debug, Default, Clone)]
pub struct Diagnostics {
    defects: Vec<Defect>,
}

impl Diagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, defect: Defect) {
        warn!(
            category = %defect.category,
            id = ?defect.id,
            block = ?defect.block,
            "{}",
            defect.message
        );
        self.defects.push(defect);
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.defects.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.defects.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.defects.is_empty()
    }

    #[must_use]
    pub fn defects(&self) -> &[Defect] {
        &self.defects
    }

    #[must_use]
    pub fn count_in(&self, category: Category) -> usize {
        self.defects
            .iter()
            .filter(|d| d.category == category)
            .count()
    }

    /// Take all collected defects, leaving the sink empty.
    pub fn drain(&mut self) -> Vec<Defect> {
        std::mem::take(&mut self.defects)
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_clean() {
            EXIT_CLEAN
        } else {
            EXIT_UNCORRECTED
        }
    }
}
