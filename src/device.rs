//! Block devices the file system can be
//! mounted on. The storage layer only
//! ever talks to a device through the
//! [`BlockIO`] trait.

mod image;
mod memory;

pub use image::ImageFile;
pub use memory::{MemDisk, MemDiskError};

/// Trait that abstracts out a block device.
/// This crate implements an in-memory disk
/// and a mmap'ed image file backing.
pub trait BlockIO {
    /// Error type returned from the IO methods
    type IoError: std::error::Error + Send + Sync + 'static;
    /// The total amount of blocks available
    /// to do IO
    fn block_count(&self) -> usize;
    /// The size of a single block. It is required
    /// all blocks are the same size.
    fn block_size(&self) -> usize;
    /// Read a single block at offset `block_number` (starting at 0),
    /// stores the block into the `block` argument (must be big enough).
    fn read_block(
        &mut self,
        block_number: u64,
        block: &mut [u8],
    ) -> std::result::Result<(), Self::IoError>;
    /// Write a single `block` at offset `block_number` (starting at 0).
    /// The `block` argument must be at least `block_size` long.
    fn write_block(
        &mut self,
        block_number: u64,
        block: &[u8],
    ) -> std::result::Result<(), Self::IoError>;
}

/// Lending a device to a file system keeps
/// it accessible once the file system is gone.
impl<T: BlockIO + ?Sized> BlockIO for &mut T {
    type IoError = T::IoError;

    fn block_count(&self) -> usize {
        (**self).block_count()
    }

    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn read_block(
        &mut self,
        block_number: u64,
        block: &mut [u8],
    ) -> std::result::Result<(), Self::IoError> {
        (**self).read_block(block_number, block)
    }

    fn write_block(
        &mut self,
        block_number: u64,
        block: &[u8],
    ) -> std::result::Result<(), Self::IoError> {
        (**self).write_block(block_number, block)
    }
}
