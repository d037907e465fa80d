pub mod device;
pub mod fs;

pub use device::{BlockIO, ImageFile, MemDisk};
pub use fs::{FSError, File, FileId, FileSystem, Inode, BLOCK_SIZE, MAX_INODES};
