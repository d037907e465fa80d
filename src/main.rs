use blockfs::{
    BlockIO, FSError, File, FileId, FileSystem, ImageFile, BLOCK_SIZE, MAX_INODES,
};
use clap::{Parser, Subcommand};
use eyre::{ensure, Context, Result};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{trace, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(about = "Manage files on a blockfs disk image")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create a new image and format it
    Format {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(short = 'b', long)]
        blocks: usize,
        /// Overwrite an existing image
        #[arg(short = 'f', long)]
        force: bool,
    },
    Create {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(index = 2, allow_negative_numbers = true)]
        id: FileId,
    },
    Delete {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(index = 2, allow_negative_numbers = true)]
        id: FileId,
    },
    /// Replace the content of a file, read from stdin unless --data is given
    Write {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(index = 2, allow_negative_numbers = true)]
        id: FileId,
        #[arg(short = 'd', long)]
        data: Option<String>,
        /// Add to the end of the file instead
        #[arg(short = 'a', long)]
        append: bool,
    },
    /// Print the content of a file
    Cat {
        #[arg(index = 1)]
        image: PathBuf,
        #[arg(index = 2, allow_negative_numbers = true)]
        id: FileId,
    },
    /// List all files
    Ls {
        #[arg(index = 1)]
        image: PathBuf,
    },
    /// Verify the allocation bitmap against the inode table
    Check {
        #[arg(index = 1)]
        image: PathBuf,
    },
}

fn with_mounted<T>(
    image: &Path,
    op: impl FnOnce(&mut FileSystem<ImageFile>) -> Result<T>,
) -> Result<T> {
    let device = ImageFile::open(image)?;
    let mut fs = FileSystem::new();
    fs.mount(device)
        .wrap_err_with(|| format!("Failed to mount {image:?}"))?;
    let result = op(&mut fs);
    let device = fs.unmount().wrap_err("Failed to unmount")?;
    device.close()?;
    result
}

fn write_file<D: BlockIO>(
    fs: &mut FileSystem<D>,
    id: FileId,
    data: &[u8],
    append: bool,
) -> Result<()> {
    if !append {
        // files never shrink, start over with an empty one
        match fs.delete_file(id) {
            Ok(()) | Err(FSError::FileNotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        fs.create_file(id)?;
    }
    let mut file = File::open(fs, id)?;
    if append {
        io::copy(&mut file, &mut io::sink())?;
    }
    let written = file.write(data)?;
    if written < data.len() {
        warn!("Truncated write to file {id}");
        eprintln!(
            "file {id} is full: wrote {written} of {} bytes (files hold at most {BLOCK_SIZE} bytes)",
            data.len()
        );
    }
    file.close()?;
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .with(EnvFilter::from_default_env())
        .init();
    trace!("Starting up blockfs cli");
    match cli.command {
        Command::Format {
            image,
            blocks,
            force,
        } => {
            ensure!(blocks >= 2, "An image needs at least 2 blocks for its metadata");
            if blocks > BLOCK_SIZE {
                println!("note: only the first {BLOCK_SIZE} blocks of the image will be used");
            }
            ImageFile::create(&image, blocks, force).wrap_err("Failed to create image")?;
            let mut device = ImageFile::open(&image)?;
            FileSystem::format(&mut device, blocks * BLOCK_SIZE)
                .wrap_err("Failed to format image")?;
            device.close()?;
        }
        Command::Create { image, id } => {
            with_mounted(&image, |fs| Ok(fs.create_file(id)?))?;
        }
        Command::Delete { image, id } => {
            with_mounted(&image, |fs| Ok(fs.delete_file(id)?))?;
        }
        Command::Write {
            image,
            id,
            data,
            append,
        } => {
            let data = match data {
                Some(data) => data.into_bytes(),
                None => {
                    let mut data = Vec::new();
                    io::stdin()
                        .read_to_end(&mut data)
                        .context("Failed to read stdin")?;
                    data
                }
            };
            with_mounted(&image, |fs| write_file(fs, id, &data, append))?;
        }
        Command::Cat { image, id } => {
            let content = with_mounted(&image, |fs| {
                let mut content = Vec::new();
                File::open(fs, id)?.read_to_end(&mut content)?;
                Ok(content)
            })?;
            let mut stdout = io::stdout().lock();
            stdout.write_all(&content)?;
            stdout.flush()?;
        }
        Command::Ls { image } => {
            with_mounted(&image, |fs| {
                println!("{:>11} {:>5} {:>5}", "ID", "SIZE", "BLOCK");
                for inode in fs.files() {
                    println!(
                        "{:>11} {:>5} {:>5}",
                        inode.id, inode.size, inode.block_number
                    );
                }
                println!(
                    "{} of {} inodes free, {} blocks free",
                    fs.free_inodes(),
                    MAX_INODES,
                    fs.free_blocks()
                );
                Ok(())
            })?;
        }
        Command::Check { image } => {
            with_mounted(&image, |fs| Ok(fs.check()?))?;
            println!("{image:?} is consistent");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use blockfs::MemDisk;

    fn mounted() -> FileSystem<MemDisk> {
        let mut disk = MemDisk::new(8);
        let size = disk.size();
        FileSystem::format(&mut disk, size).unwrap();
        let mut fs = FileSystem::new();
        fs.mount(disk).unwrap();
        fs
    }

    fn content(fs: &mut FileSystem<MemDisk>, id: FileId) -> Vec<u8> {
        let mut content = Vec::new();
        File::open(fs, id).unwrap().read_to_end(&mut content).unwrap();
        content
    }

    #[test]
    fn test_write_creates_missing_file() {
        let mut fs = mounted();
        write_file(&mut fs, 3, b"fresh", false).unwrap();
        assert_eq!(content(&mut fs, 3), b"fresh");
    }

    #[test]
    fn test_write_replaces_content() {
        let mut fs = mounted();
        write_file(&mut fs, 3, b"a longer text", false).unwrap();
        write_file(&mut fs, 3, b"short", false).unwrap();
        assert_eq!(content(&mut fs, 3), b"short");
        assert_eq!(fs.files().count(), 1);
    }

    #[test]
    fn test_write_append() {
        let mut fs = mounted();
        write_file(&mut fs, 3, b"head", false).unwrap();
        write_file(&mut fs, 3, b"-tail", true).unwrap();
        assert_eq!(content(&mut fs, 3), b"head-tail");
    }

    #[test]
    fn test_append_needs_existing_file() {
        let mut fs = mounted();
        assert!(write_file(&mut fs, 9, b"data", true).is_err());
        assert!(fs.lookup_file(9).is_none());
    }
}
