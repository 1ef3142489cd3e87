#![forbid(unsafe_code)]

//! Block device abstraction underneath the segment layer.
//!
//! Segments never perform raw I/O themselves; the page cache mediates all
//! reads and writes through a registered [`BlockDevice`]. Two
//! implementations are provided: an in-memory device for tests and
//! log/scratch spaces, and a file-backed device.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, SegmentError};

/// A resizable array of fixed-size blocks.
///
/// `read_block` on a block inside `block_count` that was never written
/// yields zeroes; reading at or past `block_count` is an error.
pub trait BlockDevice: Send + Sync {
    /// Size of one block in bytes.
    fn block_size(&self) -> usize;
    /// Current number of blocks.
    fn block_count(&self) -> u64;
    /// Grows or shrinks the device to exactly `n_blocks` blocks. Growth
    /// zero-fills; shrink discards the tail.
    fn resize(&self, n_blocks: u64) -> Result<()>;
    /// Reads one full block into `buf` (`buf.len() == block_size`).
    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()>;
    /// Writes one full block from `data` (`data.len() == block_size`).
    fn write_block(&self, block: u64, data: &[u8]) -> Result<()>;
    /// Forces previously written blocks to stable storage.
    fn flush(&self) -> Result<()>;
}

fn check_block_len(expected: usize, got: usize) -> Result<()> {
    if expected != got {
        return Err(SegmentError::InvalidArgument(format!(
            "buffer length {got} does not match block size {expected}"
        )));
    }
    Ok(())
}

/// In-memory block device.
///
/// An optional block ceiling makes resize failures reproducible in tests;
/// a resize past the ceiling fails the way a full disk would.
pub struct MemDevice {
    block_size: usize,
    max_blocks: Option<u64>,
    bytes: RwLock<Vec<u8>>,
}

impl MemDevice {
    /// Creates an empty device with unbounded capacity.
    pub fn new(block_size: usize) -> Self {
        Self::with_capacity(block_size, None)
    }

    /// Creates an empty device that refuses to grow past `max_blocks`.
    pub fn with_capacity(block_size: usize, max_blocks: Option<u64>) -> Self {
        Self {
            block_size,
            max_blocks,
            bytes: RwLock::new(Vec::new()),
        }
    }
}

impl BlockDevice for MemDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        (self.bytes.read().len() / self.block_size) as u64
    }

    fn resize(&self, n_blocks: u64) -> Result<()> {
        if let Some(max) = self.max_blocks {
            if n_blocks > max {
                return Err(SegmentError::Io(std::io::Error::new(
                    std::io::ErrorKind::OutOfMemory,
                    format!("device ceiling of {max} blocks exceeded"),
                )));
            }
        }
        let new_len = (n_blocks as usize) * self.block_size;
        self.bytes.write().resize(new_len, 0);
        Ok(())
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_block_len(self.block_size, buf.len())?;
        let bytes = self.bytes.read();
        let start = (block as usize) * self.block_size;
        let end = start + self.block_size;
        if end > bytes.len() {
            return Err(SegmentError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read of block {block} past device end"),
            )));
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_block_len(self.block_size, data.len())?;
        let mut bytes = self.bytes.write();
        let start = (block as usize) * self.block_size;
        let end = start + self.block_size;
        if end > bytes.len() {
            return Err(SegmentError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("write of block {block} past device end"),
            )));
        }
        bytes[start..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// File-backed block device using positioned reads and writes.
pub struct FileDevice {
    block_size: usize,
    file: Mutex<File>,
}

impl FileDevice {
    /// Opens (creating if absent) the file at `path`.
    pub fn open(path: &Path, block_size: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            block_size,
            file: Mutex::new(file),
        })
    }
}

impl BlockDevice for FileDevice {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        let file = self.file.lock();
        match file.metadata() {
            Ok(meta) => meta.len() / self.block_size as u64,
            Err(_) => 0,
        }
    }

    fn resize(&self, n_blocks: u64) -> Result<()> {
        let file = self.file.lock();
        file.set_len(n_blocks * self.block_size as u64)?;
        Ok(())
    }

    fn read_block(&self, block: u64, buf: &mut [u8]) -> Result<()> {
        check_block_len(self.block_size, buf.len())?;
        let mut file = self.file.lock();
        let offset = block * self.block_size as u64;
        if offset + self.block_size as u64 > file.metadata()?.len() {
            return Err(SegmentError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("read of block {block} past device end"),
            )));
        }
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write_block(&self, block: u64, data: &[u8]) -> Result<()> {
        check_block_len(self.block_size, data.len())?;
        let mut file = self.file.lock();
        let offset = block * self.block_size as u64;
        if offset + self.block_size as u64 > file.metadata()?.len() {
            return Err(SegmentError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("write of block {block} past device end"),
            )));
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}
