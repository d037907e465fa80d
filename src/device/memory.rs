use super::BlockIO;
use crate::fs::BLOCK_SIZE;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MemDiskError {
    #[error("Block {block} is out of range, the disk has {count} blocks")]
    OutOfRange { block: u64, count: usize },
    #[error("Buffer of {len} bytes can't hold a block of {block_size} bytes")]
    BufferTooSmall { len: usize, block_size: usize },
}

/// A disk living entirely in memory.
/// Mostly useful for tests.
#[derive(Debug, Clone)]
pub struct MemDisk {
    block_size: usize,
    data: Vec<u8>,
}

impl MemDisk {
    /// A zeroed disk of `block_count` blocks of [`BLOCK_SIZE`] bytes
    pub fn new(block_count: usize) -> Self {
        Self::with_block_size(block_count, BLOCK_SIZE)
    }

    pub fn with_block_size(block_count: usize, block_size: usize) -> Self {
        Self {
            block_size,
            data: vec![0; block_count * block_size],
        }
    }

    /// Size of the disk in bytes
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Borrow a block without going through [`BlockIO`].
    pub fn block(&self, block_number: usize) -> &[u8] {
        let start = block_number * self.block_size;
        &self.data[start..start + self.block_size]
    }

    pub fn block_mut(&mut self, block_number: usize) -> &mut [u8] {
        let start = block_number * self.block_size;
        &mut self.data[start..start + self.block_size]
    }

    fn range(&self, block_number: u64, len: usize) -> Result<std::ops::Range<usize>, MemDiskError> {
        if block_number as usize >= self.block_count() {
            return Err(MemDiskError::OutOfRange {
                block: block_number,
                count: self.block_count(),
            });
        }
        if len < self.block_size {
            return Err(MemDiskError::BufferTooSmall {
                len,
                block_size: self.block_size,
            });
        }
        let start = block_number as usize * self.block_size;
        Ok(start..start + self.block_size)
    }
}

impl BlockIO for MemDisk {
    type IoError = MemDiskError;

    fn block_count(&self) -> usize {
        self.data.len() / self.block_size
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_block(&mut self, block_number: u64, block: &mut [u8]) -> Result<(), MemDiskError> {
        let range = self.range(block_number, block.len())?;
        block[..self.block_size].copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_block(&mut self, block_number: u64, block: &[u8]) -> Result<(), MemDiskError> {
        let range = self.range(block_number, block.len())?;
        self.data[range].copy_from_slice(&block[..self.block_size]);
        Ok(())
    }
}
