//! Sequential access to a single file.

use super::{FSError, FileId, FileSystem, Inode, Result, BLOCK_SIZE};
use crate::device::BlockIO;
use std::io;
use tracing::{debug, error, trace, warn};

/// An open file. The file's data block is cached
/// in memory, every write goes straight through to
/// the device and closing saves the inode.
///
/// The file system stays mutably borrowed while
/// the file is open, so a file can't be opened twice.
#[derive(Debug)]
pub struct File<'fs, D: BlockIO> {
    fs: &'fs mut FileSystem<D>,
    slot: usize,
    block_cache: Box<[u8; BLOCK_SIZE]>,
    position: usize,
    closed: bool,
}

impl<'fs, D: BlockIO> File<'fs, D> {
    pub fn open(fs: &'fs mut FileSystem<D>, id: FileId) -> Result<Self> {
        debug!("Opening file {id}");
        let Some(slot) = fs.lookup_slot(id) else {
            warn!("File {id} not found");
            return Err(FSError::FileNotFound(id));
        };
        let Inode {
            size,
            block_number: block,
            ..
        } = *fs.inode(slot);
        if size as usize > BLOCK_SIZE {
            warn!("File {id} has size {size}, more than a block");
            return Err(FSError::Corrupt(format!(
                "file {id} has size {size} larger than a block"
            )));
        }
        let mut block_cache = Box::new([0; BLOCK_SIZE]);
        fs.read_block(block, &mut block_cache[..])?;
        Ok(Self {
            fs,
            slot,
            block_cache,
            position: 0,
            closed: false,
        })
    }

    pub fn id(&self) -> FileId {
        self.fs.inode(self.slot).id
    }

    pub fn size(&self) -> usize {
        self.fs.inode(self.slot).size as usize
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// A file never grows past its single block
    pub fn capacity(&self) -> usize {
        BLOCK_SIZE
    }

    /// Reads up to `buf.len()` bytes, never past the end
    /// of the file. Returns 0 at the end of the file.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.size().saturating_sub(self.position));
        buf[..n].copy_from_slice(&self.block_cache[self.position..self.position + n]);
        self.position += n;
        trace!("Read {n} bytes from file {}", self.id());
        n
    }

    /// Writes as much of `data` as fits into the block and
    /// saves the block. Anything that doesn't fit is dropped,
    /// the returned count tells how much was taken.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        let n = data.len().min(BLOCK_SIZE - self.position);
        self.block_cache[self.position..self.position + n].copy_from_slice(&data[..n]);
        self.position += n;
        let inode = self.fs.inode_mut(self.slot);
        if self.position > inode.size as usize {
            inode.size = self.position as u32;
        }
        let block = inode.block_number;
        self.fs.write_block(block, &self.block_cache[..])?;
        if n < data.len() {
            debug!(
                "Write to file {} truncated to {n} of {} bytes",
                self.id(),
                data.len()
            );
        }
        Ok(n)
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }

    pub fn eof(&self) -> bool {
        self.position >= self.size()
    }

    /// Saves the cached block and the inode
    pub fn sync(&mut self) -> Result<()> {
        let block = self.fs.inode(self.slot).block_number;
        self.fs.write_block(block, &self.block_cache[..])?;
        self.fs.update_inode(self.slot)
    }

    /// Like dropping the file, but reports errors
    pub fn close(mut self) -> Result<()> {
        debug!("Closing file {}", self.id());
        self.closed = true;
        self.sync()
    }
}

impl<'fs, D: BlockIO> Drop for File<'fs, D> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        debug!("Closing file {}", self.id());
        if let Err(err) = self.sync() {
            error!("Failed to save file {}: {err}", self.id());
        }
    }
}

impl<'fs, D: BlockIO> io::Read for File<'fs, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(File::read(self, buf))
    }
}

impl<'fs, D: BlockIO> io::Write for File<'fs, D> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        File::write(self, buf).map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sync()
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDisk;
    use crate::fs::inode;
    use std::io::{Read, Write};

    fn setup(block_count: usize) -> FileSystem<MemDisk> {
        let mut disk = MemDisk::new(block_count);
        let size = disk.size();
        FileSystem::format(&mut disk, size).unwrap();
        let mut fs = FileSystem::new();
        fs.mount(disk).unwrap();
        fs
    }

    #[test]
    fn test_open_missing() {
        let mut fs = setup(8);
        assert!(matches!(
            File::open(&mut fs, 5),
            Err(FSError::FileNotFound(5))
        ));
    }

    #[test]
    fn test_write_reset_read() {
        let mut fs = setup(8);
        fs.create_file(5).unwrap();
        let mut file = File::open(&mut fs, 5).unwrap();
        assert!(file.eof());
        assert_eq!(file.write(b"hello").unwrap(), 5);
        assert_eq!(file.size(), 5);
        file.reset();
        assert!(!file.eof());
        let mut buf = [0; 10];
        assert_eq!(file.read(&mut buf), 5);
        assert_eq!(&buf[..5], b"hello");
        assert!(file.eof());
        assert_eq!(file.read(&mut buf), 0);
        file.close().unwrap();
        assert_eq!(fs.lookup_file(5).unwrap().size, 5);
    }

    #[test]
    fn test_partial_reads() {
        let mut fs = setup(8);
        fs.create_file(1).unwrap();
        let mut file = File::open(&mut fs, 1).unwrap();
        file.write(b"abcdefg").unwrap();
        file.reset();
        let mut buf = [0; 3];
        assert_eq!(file.read(&mut buf), 3);
        assert_eq!(&buf, b"abc");
        assert_eq!(file.read(&mut buf), 3);
        assert_eq!(&buf, b"def");
        assert_eq!(file.read(&mut buf), 1);
        assert_eq!(buf[0], b'g');
        assert_eq!(file.position(), 7);
    }

    #[test]
    fn test_write_clamped_to_block() {
        let mut fs = setup(8);
        fs.create_file(2).unwrap();
        let mut file = File::open(&mut fs, 2).unwrap();
        let data = vec![0x7F; BLOCK_SIZE + 100];
        assert_eq!(file.write(&data).unwrap(), BLOCK_SIZE);
        assert_eq!(file.size(), BLOCK_SIZE);
        assert_eq!(file.write(b"more").unwrap(), 0);

        file.reset();
        file.write(&[0; 10]).unwrap();
        assert_eq!(file.write(&data).unwrap(), BLOCK_SIZE - 10);
        assert_eq!(file.size(), file.capacity());
    }

    #[test]
    fn test_overwrite_keeps_size() {
        let mut fs = setup(8);
        fs.create_file(3).unwrap();
        let mut file = File::open(&mut fs, 3).unwrap();
        file.write(b"0123456789").unwrap();
        file.reset();
        file.write(b"ab").unwrap();
        assert_eq!(file.size(), 10);
        file.reset();
        let mut buf = [0; 16];
        let n = file.read(&mut buf);
        assert_eq!(&buf[..n], b"ab23456789");
    }

    #[test]
    fn test_write_goes_to_disk() {
        let mut fs = setup(8);
        fs.create_file(4).unwrap();
        let mut file = File::open(&mut fs, 4).unwrap();
        file.write(b"durable").unwrap();
        // skip the flush on drop
        std::mem::forget(file);
        let block = fs.lookup_file(4).unwrap().block_number as usize;
        let disk = fs.unmount().unwrap();
        assert_eq!(&disk.block(block)[..7], b"durable");
    }

    #[test]
    fn test_content_survives_remount() {
        let mut fs = setup(8);
        fs.create_file(10).unwrap();
        fs.create_file(20).unwrap();
        {
            let mut file = File::open(&mut fs, 10).unwrap();
            file.write(b"first").unwrap();
        }
        {
            let mut file = File::open(&mut fs, 20).unwrap();
            file.write(b"second file").unwrap();
        }
        let disk = fs.unmount().unwrap();
        fs.mount(disk).unwrap();

        let mut file = File::open(&mut fs, 20).unwrap();
        assert_eq!(file.size(), 11);
        let mut content = String::new();
        file.read_to_string(&mut content).unwrap();
        assert_eq!(content, "second file");
        drop(file);

        let mut file = File::open(&mut fs, 10).unwrap();
        let mut content = Vec::new();
        file.read_to_end(&mut content).unwrap();
        assert_eq!(content, b"first");
    }

    #[test]
    fn test_io_write_full_block() {
        let mut fs = setup(8);
        fs.create_file(6).unwrap();
        let mut file = File::open(&mut fs, 6).unwrap();
        let err = file.write_all(&[1; BLOCK_SIZE + 1]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WriteZero);
        assert_eq!(file.size(), BLOCK_SIZE);
        Write::flush(&mut file).unwrap();
    }

    #[test]
    fn test_deleted_file_block_reused() {
        let mut fs = setup(4);
        fs.create_file(1).unwrap();
        {
            let mut file = File::open(&mut fs, 1).unwrap();
            file.write(b"old content").unwrap();
        }
        fs.delete_file(1).unwrap();
        fs.create_file(2).unwrap();
        let mut file = File::open(&mut fs, 2).unwrap();
        assert_eq!(file.size(), 0);
        assert!(file.eof());
        let mut buf = [0; 8];
        assert_eq!(file.read(&mut buf), 0);
    }

    fn lent(disk: &mut MemDisk) -> FileSystem<&mut MemDisk> {
        let mut fs = FileSystem::new();
        fs.mount(disk).unwrap();
        fs
    }

    fn formatted(block_count: usize) -> MemDisk {
        let mut disk = MemDisk::new(block_count);
        let size = disk.size();
        FileSystem::format(&mut disk, size).unwrap();
        disk
    }

    #[test]
    fn test_open_rejects_oversized_inode() {
        let mut disk = formatted(8);
        {
            let mut fs = lent(&mut disk);
            fs.create_file(1).unwrap();
        }
        // size field of slot 0
        disk.block_mut(0)[4..8].copy_from_slice(&600u32.to_le_bytes());
        let mut fs = lent(&mut disk);
        assert_eq!(fs.lookup_file(1).unwrap().size, 600);
        assert!(matches!(File::open(&mut fs, 1), Err(FSError::Corrupt(_))));
    }

    #[test]
    fn test_close_saves_inode() {
        let mut disk = formatted(8);
        {
            let mut fs = lent(&mut disk);
            fs.create_file(1).unwrap();
            let mut file = File::open(&mut fs, 1).unwrap();
            file.write(b"abc").unwrap();
            file.close().unwrap();
            // skip the flush on unmount
            std::mem::forget(fs);
        }
        let table = inode::decode_table(disk.block(0)).unwrap();
        assert_eq!(table[0].id, 1);
        assert_eq!(table[0].size, 3);
    }

    #[test]
    fn test_drop_saves_inode() {
        let mut disk = formatted(8);
        {
            let mut fs = lent(&mut disk);
            fs.create_file(1).unwrap();
            {
                let mut file = File::open(&mut fs, 1).unwrap();
                file.write(b"abcd").unwrap();
            }
            std::mem::forget(fs);
        }
        let table = inode::decode_table(disk.block(0)).unwrap();
        assert_eq!(table[0].size, 4);
    }

    #[test]
    fn test_write_alone_leaves_inode_on_disk() {
        let mut disk = formatted(8);
        {
            let mut fs = lent(&mut disk);
            fs.create_file(1).unwrap();
            let mut file = File::open(&mut fs, 1).unwrap();
            file.write(b"abc").unwrap();
            std::mem::forget(file);
            std::mem::forget(fs);
        }
        let table = inode::decode_table(disk.block(0)).unwrap();
        assert_eq!(table[0].size, 0);
    }
}
