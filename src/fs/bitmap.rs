//! The free-block bitmap, one flag byte per
//! block, mirrored to block 1 on disk.

use super::{BITMAP_BLOCK, BLOCK_SIZE, FIRST_DATA_BLOCK, INODE_BLOCK};
use tracing::warn;

const FREE: u8 = 0;
const USED: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    flags: Box<[u8; BLOCK_SIZE]>,
    /// Blocks at or past this index don't exist on the device
    limit: usize,
}

impl Bitmap {
    /// A bitmap with only the metadata blocks in use
    pub fn formatted(limit: usize) -> Self {
        let mut flags = Box::new([FREE; BLOCK_SIZE]);
        flags[INODE_BLOCK] = USED;
        flags[BITMAP_BLOCK] = USED;
        Self {
            flags,
            limit: limit.min(BLOCK_SIZE),
        }
    }

    pub fn from_block(block: &[u8], limit: usize) -> Self {
        let mut flags = Box::new([FREE; BLOCK_SIZE]);
        flags.copy_from_slice(&block[..BLOCK_SIZE]);
        Self {
            flags,
            limit: limit.min(BLOCK_SIZE),
        }
    }

    pub fn as_bytes(&self) -> &[u8; BLOCK_SIZE] {
        &self.flags
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn is_allocated(&self, block: u32) -> bool {
        self.flags.get(block as usize).is_some_and(|&f| f != FREE)
    }

    /// First fit, starting after the metadata blocks
    pub fn allocate(&mut self) -> Option<u32> {
        let block = (FIRST_DATA_BLOCK..self.limit).find(|&b| self.flags[b] == FREE)?;
        self.flags[block] = USED;
        Some(block as u32)
    }

    pub fn free(&mut self, block: u32) {
        let block = block as usize;
        if block < FIRST_DATA_BLOCK || block >= BLOCK_SIZE {
            warn!("Refusing to free reserved or invalid block {block}");
            return;
        }
        self.flags[block] = FREE;
    }

    /// Data blocks still available for allocation
    pub fn free_count(&self) -> usize {
        (FIRST_DATA_BLOCK..self.limit)
            .filter(|&b| self.flags[b] == FREE)
            .count()
    }

    /// All allocated block indices, reserved ones included
    pub fn allocated(&self) -> impl Iterator<Item = u32> + '_ {
        self.flags
            .iter()
            .enumerate()
            .filter(|&(_, &f)| f != FREE)
            .map(|(b, _)| b as u32)
    }
}
