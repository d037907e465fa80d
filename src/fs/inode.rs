//! Inodes and the inode table stored in block 0.

use super::{FileId, Result, BLOCK_SIZE, MAX_INODES};
use packed_struct::prelude::*;

/// The metadata of a single file. On disk, the
/// inode table is simply `MAX_INODES` of these
/// packed back to back.
#[derive(PackedStruct, Debug, Clone, Copy, PartialEq, Eq)]
#[packed_struct(endian = "lsb")]
pub struct Inode {
    /// The file id, [`Inode::FREE_ID`] for unused slots
    pub id: i32,
    /// Bytes of content, never more than a block
    pub size: u32,
    /// The single data block of the file
    pub block_number: u32,
}

impl Inode {
    /// Works because an inode has only 4 byte members
    pub const SIZE: usize = std::mem::size_of::<Self>();
    pub const FREE_ID: FileId = -1;
    pub const FREE: Self = Self {
        id: Self::FREE_ID,
        size: 0,
        block_number: 0,
    };

    pub fn new(id: FileId, block_number: u32) -> Self {
        Self {
            id,
            size: 0,
            block_number,
        }
    }

    pub fn is_free(&self) -> bool {
        self.id == Self::FREE_ID
    }
}

pub type InodeTable = [Inode; MAX_INODES];

pub(crate) fn empty_table() -> InodeTable {
    [Inode::FREE; MAX_INODES]
}

/// Serializes the table into a block image, the tail
/// past the last record is zeroed.
pub(crate) fn encode_table(table: &InodeTable, block: &mut [u8]) -> Result<()> {
    block[..BLOCK_SIZE].fill(0);
    for (inode, record) in table.iter().zip(block.chunks_exact_mut(Inode::SIZE)) {
        record.copy_from_slice(&inode.pack()?);
    }
    Ok(())
}

pub(crate) fn decode_table(block: &[u8]) -> Result<InodeTable> {
    let mut table = empty_table();
    for (inode, record) in table.iter_mut().zip(block.chunks_exact(Inode::SIZE)) {
        *inode = Inode::unpack_from_slice(record)?;
    }
    Ok(table)
}
