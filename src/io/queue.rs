// # I/O Queue - Positioned File Access
//
// Thin synchronous wrapper over the archive file handle. No scheduling, no
// retry; errors propagate to the caller.

use crate::error::Result;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub struct IoQueue {
    file: Mutex<File>,
    writable: bool,
}

impl IoQueue {
    /// Create a fresh file, truncating any existing content.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            writable: true,
        })
    }

    /// Open an existing file.
    pub fn open(path: &Path, writable: bool) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
            writable,
        })
    }

    /// Read exactly `buf.len()` bytes at `offset`, zero-filling past EOF.
    ///
    /// The region beyond the committed watermark is undefined on disk, so a
    /// short read of the tail page is not an error.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        buf[filled..].fill(0);
        Ok(())
    }

    /// Write `buf` at `offset`.
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        Ok(())
    }

    /// Flush OS buffers to stable storage.
    pub fn flush(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    pub fn length(&self) -> Result<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    #[inline]
    pub fn can_write(&self) -> bool {
        self.writable
    }
}
