#![forbid(unsafe_code)]
//! Read-only block access.
//!
//! Provides the `ByteDevice` and `BlockDevice` traits, a file-backed device
//! using positioned reads, and an in-memory device for synthetic images.
//! Blocks are copied into an owned [`BlockBuf`] and released as soon as the
//! caller drops it; nothing is cached.

use fsck_error::{FsckError, Result};
use fsck_types::{BlockNumber, BlockSize};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;
use tracing::trace;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.bytes
    }

    /// Whether every byte is zero (never-written space).
    #[must_use]
    pub fn is_zeroed(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }
}

fn read_end(offset: u64, len: usize) -> Result<u64> {
    offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| FsckError::Format("read length overflows u64".to_owned()))?,
        )
        .ok_or_else(|| FsckError::Format("read range overflows u64".to_owned()))
}

/// Byte-addressed read-only device (pread semantics).
pub trait ByteDevice: Send + Sync {
    /// Total length in bytes.
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;
}

/// File-backed byte device. The image is opened read-only.
#[derive(Debug)]
pub struct FileByteDevice {
    file: File,
    len: u64,
}

impl FileByteDevice {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let len = file.metadata()?.len();
        Ok(Self { file, len })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = read_end(offset, buf.len())?;
        if end > self.len {
            return Err(FsckError::Format(format!(
                "read out of bounds: offset={offset} len={} file_len={}",
                buf.len(),
                self.len
            )));
        }

        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory byte device over an owned image.
#[derive(Debug, Clone, Default)]
pub struct MemByteDevice {
    bytes: Vec<u8>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.len()).unwrap_or(u64::MAX)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let end = read_end(offset, buf.len())?;
        let range = usize::try_from(offset)
            .ok()
            .zip(usize::try_from(end).ok())
            .filter(|(_, end)| *end <= self.bytes.len());
        let Some((start, end)) = range else {
            return Err(FsckError::Format(format!(
                "read out of bounds: offset={offset} len={} image_len={}",
                buf.len(),
                self.bytes.len()
            )));
        };
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }
}

/// Block-addressed read-only interface.
pub trait BlockDevice: Send + Sync {
    /// Read a block by number.
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Device block size.
    fn block_size(&self) -> BlockSize;

    /// Total number of blocks.
    fn block_count(&self) -> u64;
}

#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: BlockSize,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    /// Wrap `inner`. The image length must be a whole number of blocks.
    pub fn new(inner: D, block_size: BlockSize) -> Result<Self> {
        let len = inner.len_bytes();
        let block_size_u64 = u64::from(block_size.get());
        let remainder = len % block_size_u64;
        if remainder != 0 {
            return Err(FsckError::Format(format!(
                "image length is not block-aligned: len_bytes={len} block_size={block_size} remainder={remainder}"
            )));
        }
        Ok(Self {
            inner,
            block_size,
            block_count: len / block_size_u64,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        if block.0 >= self.block_count {
            return Err(FsckError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }

        let offset = self
            .block_size
            .block_to_byte(block)
            .ok_or_else(|| FsckError::Format("block offset overflow".to_owned()))?;
        let mut buf = vec![0_u8; self.block_size.as_usize()];
        self.inner.read_exact_at(offset, &mut buf)?;
        trace!(block = block.0, offset, "read block");
        Ok(BlockBuf::new(buf))
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn bs() -> BlockSize {
        BlockSize::new(4096).expect("block size")
    }

    fn patterned_image(blocks: usize) -> Vec<u8> {
        let mut image = vec![0_u8; 4096 * blocks];
        for (i, chunk) in image.chunks_exact_mut(4096).enumerate() {
            chunk.fill(u8::try_from(i).expect("small block index"));
        }
        image
    }

    #[test]
    fn mem_block_device_reads_whole_blocks() {
        let dev = ByteBlockDevice::new(MemByteDevice::new(patterned_image(4)), bs())
            .expect("device");
        assert_eq!(dev.block_count(), 4);
        assert_eq!(dev.block_size(), bs());

        let read = dev.read_block(BlockNumber(2)).expect("read");
        assert_eq!(read.as_slice(), &[2_u8; 4096]);
        assert!(!read.is_zeroed());
        assert!(dev.read_block(BlockNumber(0)).expect("read").is_zeroed());
    }

    #[test]
    fn out_of_range_block_is_format_error() {
        let dev = ByteBlockDevice::new(MemByteDevice::new(patterned_image(2)), bs())
            .expect("device");
        let err = dev.read_block(BlockNumber(2)).unwrap_err();
        assert!(
            matches!(err, FsckError::Format(ref msg) if msg.contains("out of range")),
            "unexpected error: {err:?}"
        );
    }

    #[test]
    fn unaligned_image_rejected() {
        let err = ByteBlockDevice::new(MemByteDevice::new(vec![0_u8; 4097]), bs()).unwrap_err();
        assert!(matches!(err, FsckError::Format(_)), "unexpected error: {err:?}");
    }

    #[test]
    fn mem_byte_device_bounds_checked() {
        let dev = MemByteDevice::new(vec![1_u8; 16]);
        let mut buf = [0_u8; 8];
        dev.read_exact_at(8, &mut buf).expect("in bounds");
        assert_eq!(buf, [1_u8; 8]);
        assert!(dev.read_exact_at(9, &mut buf).is_err());
        assert!(dev.read_exact_at(u64::MAX, &mut buf).is_err());
    }

    #[test]
    fn file_byte_device_reads_blocks() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        file.write_all(&patterned_image(3)).expect("write image");
        file.flush().expect("flush");

        let dev = ByteBlockDevice::new(FileByteDevice::open(file.path()).expect("open"), bs())
            .expect("device");
        assert_eq!(dev.block_count(), 3);
        assert_eq!(dev.read_block(BlockNumber(1)).expect("read").as_slice(), &[1_u8; 4096]);

        let mut buf = [0_u8; 4];
        let err = dev.inner().read_exact_at(4096 * 3, &mut buf).unwrap_err();
        assert!(matches!(err, FsckError::Format(_)), "unexpected error: {err:?}");
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = FileByteDevice::open(dir.path().join("absent.img")).unwrap_err();
        assert!(matches!(err, FsckError::Io(_)), "unexpected error: {err:?}");
    }
}
