use super::BlockIO;
use crate::fs::BLOCK_SIZE;
use eyre::{ensure, Context, Result};
use std::ffi::c_void;
use std::fs::{self, File};
use std::io::{self, Write};
use std::mem::MaybeUninit;
use std::os::fd::AsRawFd;
use std::path::Path;
use tracing::{debug, trace};

/// A disk image file, mapped into memory.
/// Every block is [`BLOCK_SIZE`] bytes, the
/// block count follows from the file size.
#[derive(Debug)]
pub struct ImageFile {
    pub(crate) data_addr: *mut u8,
    pub(crate) data_size: usize,
    pub(crate) block_count: usize,
    // keeps the descriptor alive for as long as the mapping
    _file: File,
}

impl ImageFile {
    fn stat_file_size(fd: libc::c_int) -> Result<usize> {
        let mut stat = MaybeUninit::<libc::stat>::uninit();
        if unsafe { libc::fstat(fd, stat.as_mut_ptr()) } != 0 {
            return Err(io::Error::last_os_error().into());
        }
        let stat = unsafe { stat.assume_init() };
        trace!("Stat'ed file size: {}", stat.st_size);
        Ok(stat.st_size as usize)
    }

    fn mmap_image_file(fd: libc::c_int, size: usize) -> Result<*mut u8> {
        let addr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error().into());
        }
        Ok(addr as *mut u8)
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().canonicalize()?;
        debug!("Opening image at {:?}", path);
        let file = File::options()
            .append(false)
            .read(true)
            .write(true)
            .open(&path)
            .context("Couldn't open image file")?;
        let size = Self::stat_file_size(file.as_raw_fd())?;
        ensure!(size > 0, "Image file {path:?} is empty");
        ensure!(
            size % BLOCK_SIZE == 0,
            "Image size {} is not a multiple of the block size {}",
            size,
            BLOCK_SIZE
        );
        let data_addr = Self::mmap_image_file(file.as_raw_fd(), size)?;
        Ok(Self {
            data_addr,
            data_size: size,
            block_count: size / BLOCK_SIZE,
            _file: file,
        })
    }

    /// Creates a zero-filled image of `block_count` blocks.
    /// The image still has to be formatted before it can be mounted.
    pub fn create(path: impl AsRef<Path>, block_count: usize, overwrite: bool) -> Result<()> {
        let path = path.as_ref();
        debug!("Creating image at {path:?} with {block_count} blocks");
        ensure!(block_count > 0, "An image needs at least one block");
        ensure!(
            path.parent()
                .map(|p| p.as_os_str().is_empty() || p.is_dir())
                .unwrap_or(false),
            "target file location has no parent directory"
        );
        ensure!(
            overwrite || !path.exists(),
            "target file location already exists"
        );
        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(path)?;
        let block = [0; BLOCK_SIZE];
        for _ in 0..block_count {
            file.write_all(&block)?;
        }
        file.flush()?;
        Ok(())
    }

    fn block_slice(&self, block_number: u64, len: usize) -> io::Result<*mut u8> {
        if len < BLOCK_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("buffer of {len} bytes can't hold a block of {BLOCK_SIZE} bytes"),
            ));
        }
        if block_number as usize >= self.block_count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "block number {block_number} out of range (image has {} blocks)",
                    self.block_count
                ),
            ));
        }
        Ok(self.data_addr.wrapping_add(block_number as usize * BLOCK_SIZE))
    }

    /// Writes the mapping back to the image file
    pub fn sync(&self) -> io::Result<()> {
        let err = unsafe {
            libc::msync(self.data_addr as *mut c_void, self.data_size, libc::MS_SYNC)
        };
        if err != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    pub fn close(mut self) -> Result<()> {
        self.sync().wrap_err("Failed to sync image file")?;
        self.unmap()?;
        Ok(())
    }

    fn unmap(&mut self) -> io::Result<()> {
        if self.data_addr.is_null() {
            return Ok(());
        }
        let err = unsafe { libc::munmap(self.data_addr as *mut c_void, self.data_size) };
        self.data_addr = std::ptr::null_mut();
        if err != 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl Drop for ImageFile {
    fn drop(&mut self) {
        if let Err(err) = self.unmap() {
            tracing::error!("Failed to unmap image file: {err}");
        }
    }
}

impl BlockIO for ImageFile {
    type IoError = io::Error;

    fn block_count(&self) -> usize {
        self.block_count
    }

    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn read_block(&mut self, block_number: u64, block: &mut [u8]) -> io::Result<()> {
        let addr = self.block_slice(block_number, block.len())?;
        let data = unsafe { std::slice::from_raw_parts(addr, BLOCK_SIZE) };
        block[..BLOCK_SIZE].copy_from_slice(data);
        Ok(())
    }

    fn write_block(&mut self, block_number: u64, block: &[u8]) -> io::Result<()> {
        let addr = self.block_slice(block_number, block.len())?;
        let data: &mut [u8] = unsafe { std::slice::from_raw_parts_mut(addr, BLOCK_SIZE) };
        data.copy_from_slice(&block[..BLOCK_SIZE]);
        Ok(())
    }
}
