#![forbid(unsafe_code)]
//! The validated entry point for every on-disk object.

use crate::object_error;
use crate::omap::ObjectMap;
use fsck_block::{BlockBuf, BlockDevice};
use fsck_error::{FsckError, Result};
use fsck_ondisk::{ObjectHeader, validate_object};
use fsck_types::{BlockNumber, ObjectId, VolumeConfig, Xid};
use tracing::{debug, error};

/// A block that passed every header and checksum check.
#[derive(Debug, Clone)]
pub struct ObjectBlock {
    pub header: ObjectHeader,
    /// Physical block the object was read from.
    pub block: BlockNumber,
    data: BlockBuf,
}

impl ObjectBlock {
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        self.data.as_slice()
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.data.into_inner()
    }
}

/// Reads objects off a block device and validates them.
#[derive(Debug)]
pub struct ObjectReader<D: BlockDevice> {
    dev: D,
    config: VolumeConfig,
}

impl<D: BlockDevice> ObjectReader<D> {
    /// The device block size must agree with the volume's.
    pub fn new(dev: D, config: VolumeConfig) -> Result<Self> {
        if dev.block_size() != config.block_size {
            return Err(FsckError::Format(format!(
                "device block size {} doesn't match volume block size {}",
                dev.block_size(),
                config.block_size
            )));
        }
        Ok(Self { dev, config })
    }

    #[must_use]
    pub fn config(&self) -> &VolumeConfig {
        &self.config
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.dev
    }

    /// Read object `oid`.
    ///
    /// With an object map, `oid` is virtual and is translated through its
    /// newest mapping up to the volume's current transaction; otherwise it
    /// is the physical block number. The first violated
    /// header invariant is returned as a fatal error.
    pub fn read_object(&self, oid: u64, omap: Option<&dyn ObjectMap>) -> Result<ObjectBlock> {
        let (bno, omap_xid) = match omap {
            Some(map) => {
                let record = map.lookup(oid, self.config.current_xid)?;
                (record.bno, Some(Xid(record.xid)))
            }
            None => (oid, None),
        };

        let block = BlockNumber(bno);
        let data = self.dev.read_block(block)?;
        let header = validate_object(data.as_slice(), ObjectId(oid), omap_xid, &self.config)
            .map_err(|err| {
                error!(oid, block = bno, error = %err, "object validation failed");
                object_error(&err, bno)
            })?;

        debug!(
            oid,
            block = bno,
            xid = header.xid.0,
            obj_type = header.obj_type,
            "object read"
        );
        Ok(ObjectBlock {
            header,
            block,
            data,
        })
    }
}
