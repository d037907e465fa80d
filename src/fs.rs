//! A file store keeping every file in a single
//! block. Block 0 holds the inode table, block 1
//! the free-block bitmap, all other blocks are data.

use thiserror::Error;
use tracing::{debug, error, trace, warn};

pub mod bitmap;
pub mod file;
pub mod inode;

use crate::device::BlockIO;
use bitmap::Bitmap;
pub use file::File;
pub use inode::Inode;
use inode::InodeTable;

/// Bytes per block, the device has to agree
pub const BLOCK_SIZE: usize = 512;
/// As many inodes as fit into the inode block
pub const MAX_INODES: usize = BLOCK_SIZE / Inode::SIZE;
pub const INODE_BLOCK: usize = 0;
pub const BITMAP_BLOCK: usize = 1;
pub const FIRST_DATA_BLOCK: usize = 2;

pub type FileId = i32;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum FSError {
    #[error("File {0} already exists")]
    FileExists(FileId),
    #[error("File {0} not found")]
    FileNotFound(FileId),
    #[error("No free inode available")]
    NoFreeInode,
    #[error("No free block available")]
    NoFreeBlock,
    #[error("{0} is reserved and can't be used as a file id")]
    InvalidId(FileId),
    #[error("No device is mounted")]
    NotMounted,
    #[error("A device is already mounted")]
    AlreadyMounted,
    #[error("The device is invalid: {0}")]
    InvalidDevice(String),
    #[error("The expected block size is {expected}, but the device reports {device}")]
    BlockSizeMismatch { expected: usize, device: usize },
    #[error("Block {block} is out of range, the device has {count} blocks")]
    BlockOutOfRange { block: u32, count: usize },
    #[error("The file system is corrupt: {0}")]
    Corrupt(String),
    #[error("Failed to (un)pack on-disk structure")]
    Layout(#[from] packed_struct::PackingError),
    #[error("Device I/O failed")]
    Device(#[source] Box<dyn std::error::Error + Send + Sync>),
}

pub type Result<T> = std::result::Result<T, FSError>;

fn device_error<E: std::error::Error + Send + Sync + 'static>(err: E) -> FSError {
    FSError::Device(Box::new(err))
}

/// Verifies the device has our block size and room
/// for at least the metadata blocks. Returns how many
/// blocks the bitmap may hand out.
fn check_geometry(device: &impl BlockIO) -> Result<usize> {
    if device.block_size() != BLOCK_SIZE {
        return Err(FSError::BlockSizeMismatch {
            expected: BLOCK_SIZE,
            device: device.block_size(),
        });
    }
    let block_count = device.block_count();
    if block_count < FIRST_DATA_BLOCK {
        return Err(FSError::InvalidDevice(format!(
            "{block_count} blocks can't hold the inode table and bitmap"
        )));
    }
    if block_count > BLOCK_SIZE {
        debug!(
            "Device has {} blocks, only the first {} are addressable",
            block_count, BLOCK_SIZE
        );
    }
    Ok(block_count.min(BLOCK_SIZE))
}

#[derive(Debug)]
pub struct FileSystem<D: BlockIO> {
    inodes: InodeTable,
    free_blocks: Bitmap,
    device: Option<D>,
    buffer: Vec<u8>,
}

impl<D: BlockIO> Default for FileSystem<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: BlockIO> FileSystem<D> {
    /// An unmounted file system, see [`FileSystem::mount`]
    pub fn new() -> Self {
        Self {
            inodes: inode::empty_table(),
            free_blocks: Bitmap::formatted(0),
            device: None,
            buffer: vec![0; BLOCK_SIZE],
        }
    }

    /// Writes an empty inode table and bitmap to `device`,
    /// any previous metadata is lost.
    ///
    /// `size` is the byte size of the image and is only
    /// validated against the device: it must hold the two
    /// metadata blocks and fit on the device. It isn't stored,
    /// [`FileSystem::mount`] always makes every block of the
    /// device (up to [`BLOCK_SIZE`] blocks) available.
    pub fn format(device: &mut D, size: usize) -> Result<()> {
        debug!("Formatting device ({size} bytes)");
        check_geometry(&*device)?;
        let block_count = size / BLOCK_SIZE;
        if block_count < FIRST_DATA_BLOCK || block_count > device.block_count() {
            return Err(FSError::InvalidDevice(format!(
                "can't format {} blocks on a device with {} blocks",
                block_count,
                device.block_count()
            )));
        }
        let mut block = vec![0; BLOCK_SIZE];
        inode::encode_table(&inode::empty_table(), &mut block)?;
        device
            .write_block(INODE_BLOCK as u64, &block)
            .map_err(device_error)?;
        let bitmap = Bitmap::formatted(block_count);
        device
            .write_block(BITMAP_BLOCK as u64, bitmap.as_bytes())
            .map_err(device_error)?;
        debug!("Device formatted");
        Ok(())
    }

    /// Loads the inode table and bitmap from `device`.
    /// The image is trusted to be formatted, use
    /// [`FileSystem::check`] to verify it.
    pub fn mount(&mut self, mut device: D) -> Result<()> {
        debug!("Mounting file system");
        if self.device.is_some() {
            return Err(FSError::AlreadyMounted);
        }
        let limit = check_geometry(&device)?;
        device
            .read_block(INODE_BLOCK as u64, &mut self.buffer)
            .map_err(device_error)?;
        let inodes = inode::decode_table(&self.buffer)?;
        device
            .read_block(BITMAP_BLOCK as u64, &mut self.buffer)
            .map_err(device_error)?;
        self.free_blocks = Bitmap::from_block(&self.buffer, limit);
        self.inodes = inodes;
        self.device = Some(device);
        debug!("File system mounted");
        Ok(())
    }

    /// Saves all metadata and hands back the device
    pub fn unmount(&mut self) -> Result<D> {
        debug!("Unmounting file system");
        self.persist()?;
        let device = self.device.take().ok_or(FSError::NotMounted)?;
        self.inodes = inode::empty_table();
        self.free_blocks = Bitmap::formatted(0);
        Ok(device)
    }

    pub fn is_mounted(&self) -> bool {
        self.device.is_some()
    }

    fn device(&mut self) -> Result<&mut D> {
        self.device.as_mut().ok_or(FSError::NotMounted)
    }

    pub(crate) fn read_block(&mut self, block: u32, data: &mut [u8]) -> Result<()> {
        let device = self.device()?;
        if block as usize >= device.block_count() {
            return Err(FSError::BlockOutOfRange {
                block,
                count: device.block_count(),
            });
        }
        device.read_block(block as u64, data).map_err(device_error)
    }

    pub(crate) fn write_block(&mut self, block: u32, data: &[u8]) -> Result<()> {
        let device = self.device()?;
        if block as usize >= device.block_count() {
            return Err(FSError::BlockOutOfRange {
                block,
                count: device.block_count(),
            });
        }
        device.write_block(block as u64, data).map_err(device_error)
    }

    fn persist_inodes(&mut self) -> Result<()> {
        trace!("Writing inode table");
        inode::encode_table(&self.inodes, &mut self.buffer)?;
        let device = self.device.as_mut().ok_or(FSError::NotMounted)?;
        device
            .write_block(INODE_BLOCK as u64, &self.buffer)
            .map_err(device_error)
    }

    fn persist_bitmap(&mut self) -> Result<()> {
        trace!("Writing free-block bitmap");
        let device = self.device.as_mut().ok_or(FSError::NotMounted)?;
        device
            .write_block(BITMAP_BLOCK as u64, self.free_blocks.as_bytes())
            .map_err(device_error)
    }

    /// Writes inode table and bitmap back to the device
    pub fn persist(&mut self) -> Result<()> {
        self.persist_inodes()?;
        self.persist_bitmap()
    }

    /// Saves the inode in `slot`, called by files
    /// once their size may have changed.
    pub(crate) fn update_inode(&mut self, slot: usize) -> Result<()> {
        trace!("Updating inode {slot}: {:?}", self.inodes[slot]);
        self.persist_inodes()
    }

    pub(crate) fn lookup_slot(&self, id: FileId) -> Option<usize> {
        if id == Inode::FREE_ID {
            return None;
        }
        self.inodes.iter().position(|inode| inode.id == id)
    }

    pub(crate) fn inode(&self, slot: usize) -> &Inode {
        &self.inodes[slot]
    }

    pub(crate) fn inode_mut(&mut self, slot: usize) -> &mut Inode {
        &mut self.inodes[slot]
    }

    pub fn lookup_file(&self, id: FileId) -> Option<&Inode> {
        trace!("Looking up file {id}");
        self.lookup_slot(id).map(|slot| &self.inodes[slot])
    }

    /// Creates an empty file, claiming the first free inode
    /// and the first free data block.
    pub fn create_file(&mut self, id: FileId) -> Result<()> {
        debug!("Creating file {id}");
        if !self.is_mounted() {
            return Err(FSError::NotMounted);
        }
        if id == Inode::FREE_ID {
            return Err(FSError::InvalidId(id));
        }
        if self.lookup_slot(id).is_some() {
            warn!("File {id} already exists");
            return Err(FSError::FileExists(id));
        }
        let Some(slot) = self.inodes.iter().position(Inode::is_free) else {
            warn!("No free inode for file {id}");
            return Err(FSError::NoFreeInode);
        };
        let Some(block) = self.free_blocks.allocate() else {
            warn!("No free block for file {id}");
            return Err(FSError::NoFreeBlock);
        };
        self.inodes[slot] = Inode::new(id, block);
        self.persist()?;
        debug!("Created file {id} in slot {slot} on block {block}");
        Ok(())
    }

    /// Releases the file's block and inode. Like creation,
    /// the metadata is written back right away.
    pub fn delete_file(&mut self, id: FileId) -> Result<()> {
        debug!("Deleting file {id}");
        if !self.is_mounted() {
            return Err(FSError::NotMounted);
        }
        let Some(slot) = self.lookup_slot(id) else {
            warn!("File {id} not found");
            return Err(FSError::FileNotFound(id));
        };
        self.free_blocks.free(self.inodes[slot].block_number);
        self.inodes[slot] = Inode::FREE;
        self.persist()?;
        debug!("Deleted file {id}");
        Ok(())
    }

    /// The live inodes in table order
    pub fn files(&self) -> impl Iterator<Item = &Inode> + '_ {
        self.inodes.iter().filter(|inode| !inode.is_free())
    }

    pub fn free_blocks(&self) -> usize {
        self.free_blocks.free_count()
    }

    pub fn free_inodes(&self) -> usize {
        self.inodes.iter().filter(|inode| inode.is_free()).count()
    }

    pub fn is_block_allocated(&self, block: u32) -> bool {
        self.free_blocks.is_allocated(block)
    }

    /// Verifies a block is marked allocated exactly
    /// when it is a metadata block or owned by a file.
    pub fn check(&self) -> Result<()> {
        if !self.is_mounted() {
            return Err(FSError::NotMounted);
        }
        for reserved in [INODE_BLOCK, BITMAP_BLOCK] {
            if !self.free_blocks.is_allocated(reserved as u32) {
                return Err(FSError::Corrupt(format!(
                    "metadata block {reserved} is marked free"
                )));
            }
        }
        let mut owners: Vec<Option<FileId>> = vec![None; BLOCK_SIZE];
        for inode in self.files() {
            let block = inode.block_number as usize;
            if block < FIRST_DATA_BLOCK || block >= self.free_blocks.limit() {
                return Err(FSError::Corrupt(format!(
                    "file {} points to invalid block {block}",
                    inode.id
                )));
            }
            if inode.size as usize > BLOCK_SIZE {
                return Err(FSError::Corrupt(format!(
                    "file {} has size {} larger than a block",
                    inode.id, inode.size
                )));
            }
            if self.files().filter(|other| other.id == inode.id).count() > 1 {
                return Err(FSError::Corrupt(format!("file id {} is not unique", inode.id)));
            }
            if let Some(owner) = owners[block].replace(inode.id) {
                return Err(FSError::Corrupt(format!(
                    "block {block} is shared by files {owner} and {}",
                    inode.id
                )));
            }
            if !self.free_blocks.is_allocated(block as u32) {
                return Err(FSError::Corrupt(format!(
                    "block {block} of file {} is marked free",
                    inode.id
                )));
            }
        }
        for block in self.free_blocks.allocated() {
            let index = block as usize;
            if index >= FIRST_DATA_BLOCK && owners[index].is_none() {
                return Err(FSError::Corrupt(format!(
                    "block {block} is allocated but not owned by any file"
                )));
            }
        }
        Ok(())
    }
}

impl<D: BlockIO> Drop for FileSystem<D> {
    fn drop(&mut self) {
        if self.device.is_some() {
            if let Err(err) = self.persist() {
                error!("Failed to save file system metadata: {err}");
            }
        }
    }
}
