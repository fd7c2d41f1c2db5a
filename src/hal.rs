//! The block-device boundary the core consumes. Concrete HAL bindings are
//! not part of the core filesystem logic, but the trait contract and two
//! concrete bindings are shipped for testing and for the `fsutil` binary,
//! the way a tablespace-parsing tool ships reader/writer bindings alongside
//! its parsing core.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use mmap_rs::{Mmap, MmapFlags, MmapMut, MmapOptions};

/// Synchronous read/write/erase primitives over a volume-relative address
/// space. All addresses and lengths are caller-validated against geometry by
/// the core before a call reaches the HAL; the HAL itself need not bounds-check.
pub trait Hal {
    type Error: std::error::Error + Send + Sync + 'static;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error>;
    fn write(&mut self, addr: u32, buf: &[u8]) -> Result<(), Self::Error>;
    /// Erase exactly one physical erase block, returning it to all-ones.
    fn erase(&mut self, addr: u32, len: u32) -> Result<(), Self::Error>;
}

/// A plain `std::fs::File`-backed HAL. Reads/writes seek to the requested
/// offset; erase overwrites the range with `0xFF`.
pub struct FileHal {
    file: File,
}

impl FileHal {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(FileHal { file })
    }

    pub fn create(path: &Path, size: u64) -> std::io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size)?;
        Ok(FileHal { file })
    }
}

impl Hal for FileHal {
    type Error = std::io::Error;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        self.file.seek(SeekFrom::Start(addr as u64))?;
        self.file.read_exact(buf)
    }

    fn write(&mut self, addr: u32, buf: &[u8]) -> Result<(), Self::Error> {
        self.file.seek(SeekFrom::Start(addr as u64))?;
        self.file.write_all(buf)
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<(), Self::Error> {
        let chunk = vec![0xFFu8; 4096.min(len as usize).max(1)];
        let mut remaining = len as usize;
        self.file.seek(SeekFrom::Start(addr as u64))?;
        while remaining > 0 {
            let n = remaining.min(chunk.len());
            self.file.write_all(&chunk[..n])?;
            remaining -= n;
        }
        Ok(())
    }
}

/// A memory-mapped HAL, for callers that prefer mapped I/O over seek+read.
/// Collapses a reader/writer split into one read-write mapping since the
/// core always needs both.
pub struct MmapHal {
    _file: File,
    map: MmapMut,
}

impl MmapHal {
    #[allow(unsafe_code)]
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        let map = unsafe {
            MmapOptions::new(len)
                .map_err(std::io::Error::other)?
                .with_file(&file, 0)
                .with_flags(MmapFlags::SHARED)
                .map_mut()
                .map_err(std::io::Error::other)?
        };
        Ok(MmapHal { _file: file, map })
    }
}

impl Hal for MmapHal {
    type Error = std::io::Error;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        let start = addr as usize;
        buf.copy_from_slice(&self.map[start..start + buf.len()]);
        Ok(())
    }

    fn write(&mut self, addr: u32, buf: &[u8]) -> Result<(), Self::Error> {
        let start = addr as usize;
        self.map[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<(), Self::Error> {
        let start = addr as usize;
        self.map[start..start + len as usize].fill(0xFF);
        Ok(())
    }
}

/// In-memory HAL used by unit tests: a flat `Vec<u8>` initialized to
/// all-ones, with a write-granularity check (only bits may be cleared).
#[cfg(test)]
pub struct MemHal {
    pub bytes: Vec<u8>,
}

#[cfg(test)]
impl MemHal {
    pub fn new(size: u32) -> Self {
        MemHal { bytes: vec![0xFFu8; size as usize] }
    }
}

#[cfg(test)]
#[derive(Debug, thiserror::Error)]
pub enum MemHalError {
    #[error("attempted to set a bit that was previously cleared")]
    IllegalWrite,
    #[error("address out of range")]
    OutOfRange,
}

#[cfg(test)]
impl Hal for MemHal {
    type Error = MemHalError;

    fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Self::Error> {
        let start = addr as usize;
        let end = start + buf.len();
        if end > self.bytes.len() {
            return Err(MemHalError::OutOfRange);
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(())
    }

    fn write(&mut self, addr: u32, buf: &[u8]) -> Result<(), Self::Error> {
        let start = addr as usize;
        let end = start + buf.len();
        if end > self.bytes.len() {
            return Err(MemHalError::OutOfRange);
        }
        for (dst, &src) in self.bytes[start..end].iter_mut().zip(buf) {
            if (!*dst) & src != 0 {
                return Err(MemHalError::IllegalWrite);
            }
            *dst &= src;
        }
        Ok(())
    }

    fn erase(&mut self, addr: u32, len: u32) -> Result<(), Self::Error> {
        let start = addr as usize;
        let end = start + len as usize;
        if end > self.bytes.len() {
            return Err(MemHalError::OutOfRange);
        }
        self.bytes[start..end].fill(0xFF);
        Ok(())
    }
}
