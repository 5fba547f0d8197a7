#![forbid(unsafe_code)]
//! Synthetic volumes for end-to-end tests.
//!
//! [`ImageBuilder`] lays sealed objects into a zeroed image, and the
//! `*_key` / `*_val` helpers produce raw leaf records in the on-disk
//! layout. Sparse JSON fixtures under `conformance/fixtures` describe
//! images as a size plus hex writes.

use anyhow::{Context, Result, bail};
use fsck_block::{ByteBlockDevice, MemByteDevice};
use fsck_ondisk::{PhysExtKind, RecordType, hash_name, object_checksum};
use fsck_types::{BlockSize, OBJ_PHYS_SIZE, OBJ_TYPE_SHIFT};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

// ── Images ──────────────────────────────────────────────────────────────────

/// Builds a volume image one block at a time.
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    block_size: BlockSize,
    bytes: Vec<u8>,
}

impl ImageBuilder {
    #[must_use]
    pub fn new(block_size: BlockSize, block_count: usize) -> Self {
        Self {
            block_size,
            bytes: vec![0; block_size.as_usize() * block_count],
        }
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_mut(&mut self, bno: usize) -> &mut [u8] {
        let bs = self.block_size.as_usize();
        &mut self.bytes[bno * bs..(bno + 1) * bs]
    }

    /// Write an object header and `payload` into block `bno` and seal it
    /// with a valid checksum. `type_and_flags` is the raw `o_type` word.
    ///
    /// # Panics
    ///
    /// Panics if `bno` is past the end of the image.
    pub fn put_object(
        &mut self,
        bno: usize,
        oid: u64,
        xid: u64,
        type_and_flags: u32,
        payload: &[u8],
    ) -> Result<&mut Self> {
        let block = self.block_mut(bno);
        let end = OBJ_PHYS_SIZE + payload.len();
        if end > block.len() {
            bail!("payload of {} bytes does not fit in one block", payload.len());
        }
        block.fill(0);
        block[8..16].copy_from_slice(&oid.to_le_bytes());
        block[16..24].copy_from_slice(&xid.to_le_bytes());
        block[24..28].copy_from_slice(&type_and_flags.to_le_bytes());
        block[OBJ_PHYS_SIZE..end].copy_from_slice(payload);
        seal(block)?;
        Ok(self)
    }

    /// Fill block `bno` with raw file data.
    pub fn put_data(&mut self, bno: usize, byte: u8) -> &mut Self {
        self.block_mut(bno).fill(byte);
        self
    }

    /// Flip bits at `offset` inside block `bno` without resealing it.
    pub fn corrupt(&mut self, bno: usize, offset: usize, mask: u8) -> &mut Self {
        self.block_mut(bno)[offset] ^= mask;
        self
    }

    #[must_use]
    pub fn build(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    /// The image as an in-memory block device.
    pub fn into_device(self) -> Result<ByteBlockDevice<MemByteDevice>> {
        ByteBlockDevice::new(MemByteDevice::new(self.bytes), self.block_size)
            .context("image does not form a block device")
    }
}

/// Store the correct checksum in the first eight bytes of `block`.
pub fn seal(block: &mut [u8]) -> Result<()> {
    let sum = object_checksum(block).context("block is shorter than an object header")?;
    block[..8].copy_from_slice(&sum.to_le_bytes());
    Ok(())
}

// ── Keys ────────────────────────────────────────────────────────────────────

/// Catalog key header for `id` and `record_type`, followed by `tail`.
#[must_use]
pub fn catalog_key(id: u64, record_type: RecordType, tail: &[u8]) -> Vec<u8> {
    let mut raw = (id | (u64::from(record_type.raw()) << OBJ_TYPE_SHIFT))
        .to_le_bytes()
        .to_vec();
    raw.extend_from_slice(tail);
    raw
}

/// Hashed directory record key for `name` in directory `parent`.
#[must_use]
pub fn dir_rec_key(parent: u64, name: &str, case_insensitive: bool) -> Vec<u8> {
    let mut tail = hash_name(name, case_insensitive).to_le_bytes().to_vec();
    tail.extend_from_slice(name.as_bytes());
    tail.push(0);
    catalog_key(parent, RecordType::DirRec, &tail)
}

#[must_use]
pub fn file_extent_key(dstream_id: u64, logical_addr: u64) -> Vec<u8> {
    catalog_key(dstream_id, RecordType::FileExtent, &logical_addr.to_le_bytes())
}

#[must_use]
pub fn phys_ext_key(first_block: u64) -> Vec<u8> {
    catalog_key(first_block, RecordType::PhysExtent, &[])
}

#[must_use]
pub fn omap_key(oid: u64, xid: u64) -> Vec<u8> {
    let mut raw = oid.to_le_bytes().to_vec();
    raw.extend_from_slice(&xid.to_le_bytes());
    raw
}

// ── Values ──────────────────────────────────────────────────────────────────

#[must_use]
pub fn file_extent_val(len: u64, phys_block: u64, crypto_id: u64) -> Vec<u8> {
    let mut raw = len.to_le_bytes().to_vec();
    raw.extend_from_slice(&phys_block.to_le_bytes());
    raw.extend_from_slice(&crypto_id.to_le_bytes());
    raw
}

#[must_use]
pub fn dstream_id_val(refcnt: u32) -> Vec<u8> {
    refcnt.to_le_bytes().to_vec()
}

#[must_use]
pub fn phys_ext_val(blocks: u64, kind: PhysExtKind, owner: u64, refcnt: i32) -> Vec<u8> {
    let raw_kind: u64 = match kind {
        PhysExtKind::New => 1,
        PhysExtKind::Update => 2,
    };
    let mut raw = (blocks | (raw_kind << 60)).to_le_bytes().to_vec();
    raw.extend_from_slice(&owner.to_le_bytes());
    raw.extend_from_slice(&refcnt.to_le_bytes());
    raw
}

/// Crypto state value carrying `key` as its wrapped key.
pub fn crypto_state_val(refcnt: u32, key: &[u8]) -> Result<Vec<u8>> {
    let key_len = u16::try_from(key.len()).context("wrapped key longer than 64 KiB")?;
    let mut raw = refcnt.to_le_bytes().to_vec();
    raw.extend_from_slice(&5_u16.to_le_bytes()); // major_version
    raw.extend_from_slice(&0_u16.to_le_bytes()); // minor_version
    raw.extend_from_slice(&0_u32.to_le_bytes()); // cpflags
    raw.extend_from_slice(&3_u32.to_le_bytes()); // persistent_class
    raw.extend_from_slice(&0_u32.to_le_bytes()); // key_os_version
    raw.extend_from_slice(&1_u16.to_le_bytes()); // key_revision
    raw.extend_from_slice(&key_len.to_le_bytes());
    raw.extend_from_slice(key);
    Ok(raw)
}

#[must_use]
pub fn omap_val(paddr: u64) -> Vec<u8> {
    let mut raw = vec![0_u8; 8];
    raw.extend_from_slice(&paddr.to_le_bytes());
    raw
}

// ── Sparse fixtures ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct SparseFixture {
    pub size: usize,
    pub writes: Vec<FixtureWrite>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureWrite {
    pub offset: usize,
    pub hex: String,
}

pub fn load_sparse_fixture(path: &Path) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("failed to read fixture {}", path.display()))?;
    let fixture: SparseFixture = serde_json::from_str(&text)
        .with_context(|| format!("invalid fixture json {}", path.display()))?;

    let mut bytes = vec![0_u8; fixture.size];
    for write in fixture.writes {
        let payload = hex::decode(write.hex)
            .with_context(|| format!("invalid hex at offset {}", write.offset))?;

        let end = write
            .offset
            .checked_add(payload.len())
            .context("fixture offset overflow")?;
        if end > bytes.len() {
            bail!(
                "fixture write out of bounds: offset={} payload={} size={}",
                write.offset,
                payload.len(),
                bytes.len()
            );
        }

        bytes[write.offset..end].copy_from_slice(&payload);
    }

    Ok(bytes)
}

/// Path of a fixture under the workspace `conformance/fixtures` directory.
pub fn fixture_path(name: &str) -> Result<PathBuf> {
    let root = Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .and_then(Path::parent)
        .context("workspace root")?;
    Ok(root.join("conformance").join("fixtures").join(name))
}
