//! `FileStore` - `BlockStore` over a regular file.
//!
//! Positional I/O only, so any number of worker threads can share one
//! descriptor. Write-zeroes punches a hole where the filesystem supports
//! it and falls back to writing zeros.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use rbdshim_core::{kdebug, BlockStore, RbdError, Result};

pub struct FileStore {
    file: File,
    path: PathBuf,
}

impl FileStore {
    /// Create (or truncate) `path` as a sparse file of `size` bytes.
    pub fn create(path: &Path, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    /// Open an existing image file.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file, path: path.to_path_buf() })
    }

    pub fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        self.len().map(|n| n == 0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    fn punch_hole(&self, offset: u64, len: u64) -> bool {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "linux")] {
                let ret = unsafe {
                    libc::fallocate(
                        self.file.as_raw_fd(),
                        libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                        offset as libc::off_t,
                        len as libc::off_t,
                    )
                };
                if ret != 0 {
                    kdebug!("{}: hole punch unavailable ({}), writing zeros", self.path.display(), RbdError::last_os_error());
                }
                ret == 0
            } else {
                let _ = (offset, len, self.file.as_raw_fd());
                false
            }
        }
    }
}

impl BlockStore for FileStore {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                // Past EOF of a shorter file: the rest is a hole.
                Ok(0) => {
                    buf[done..].fill(0);
                    break;
                }
                Ok(n) => done += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.write_all_at(data, offset)?;
        Ok(())
    }

    fn write_zeroes(&self, offset: u64, len: u64) -> Result<()> {
        if len == 0 || self.punch_hole(offset, len) {
            return Ok(());
        }
        const CHUNK: u64 = 64 * 1024;
        let zeros = vec![0u8; CHUNK.min(len) as usize];
        let mut done = 0u64;
        while done < len {
            let n = CHUNK.min(len - done) as usize;
            self.write_at(offset + done, &zeros[..n])?;
            done += n as u64;
        }
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
