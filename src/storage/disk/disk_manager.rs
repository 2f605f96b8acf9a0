use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{PageId, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// The disk provider the buffer pool is built against. Implementations move
/// page-sized buffers between memory and stable storage; failures are fatal
/// to the in-flight pool operation and propagate up.
pub trait DiskManager: Send + Sync {
    /// Fill a caller-owned page-sized buffer with the page's content
    fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<(), DiskManagerError>;

    /// Persist a caller-owned page-sized buffer
    fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<(), DiskManagerError>;
}

/// File-backed disk manager: one database file, pages stored at
/// `page_id * PAGE_SIZE`
pub struct FileDiskManager {
    db_file: Mutex<File>,
}

impl FileDiskManager {
    /// Open (or create) the database file at the given path
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        Ok(Self {
            db_file: Mutex::new(file),
        })
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id as u64 * PAGE_SIZE as u64
    }
}

impl DiskManager for FileDiskManager {
    fn read_page(&self, page_id: PageId, buf: &mut [u8; PAGE_SIZE]) -> Result<(), DiskManagerError> {
        if page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = Self::page_offset(page_id);
        let mut file = self.db_file.lock();

        // Pages past the end of the file have never been written; hand back
        // zeroes so callers can fetch a fresh page without a prior write.
        let file_size = file.metadata()?.len();
        if offset >= file_size {
            buf.fill(0);
            return Ok(());
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;

        Ok(())
    }

    fn write_page(&self, page_id: PageId, buf: &[u8; PAGE_SIZE]) -> Result<(), DiskManagerError> {
        if page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let mut file = self.db_file.lock();
        file.seek(SeekFrom::Start(Self::page_offset(page_id)))?;
        file.write_all(buf)?;
        file.flush()?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_write_then_read_round_trip() {
        let file = NamedTempFile::new().unwrap();
        let disk = FileDiskManager::new(file.path()).unwrap();

        let mut out = [0u8; PAGE_SIZE];
        out[0] = 0xAB;
        out[PAGE_SIZE - 1] = 0xCD;
        disk.write_page(3, &out).unwrap();

        let mut buf = [0u8; PAGE_SIZE];
        disk.read_page(3, &mut buf).unwrap();
        assert_eq!(buf[0], 0xAB);
        assert_eq!(buf[PAGE_SIZE - 1], 0xCD);
    }

    #[test]
    fn test_read_past_eof_is_zeroed() {
        let file = NamedTempFile::new().unwrap();
        let disk = FileDiskManager::new(file.path()).unwrap();

        let mut buf = [0xFFu8; PAGE_SIZE];
        disk.read_page(42, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_negative_page_id_rejected() {
        let file = NamedTempFile::new().unwrap();
        let disk = FileDiskManager::new(file.path()).unwrap();

        let mut buf = [0u8; PAGE_SIZE];
        assert!(disk.read_page(-1, &mut buf).is_err());
        assert!(disk.write_page(-1, &buf).is_err());
    }
}
