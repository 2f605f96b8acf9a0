use std::sync::Arc;
use anyhow::Result;
use tempfile::NamedTempFile;

use stratadb::storage::buffer::BufferPoolManager;
use stratadb::storage::disk::FileDiskManager;

// Create a temporary database file for testing
#[allow(dead_code)]
pub fn create_temp_db_file() -> Result<NamedTempFile> {
    Ok(NamedTempFile::new()?)
}

// Create a buffer pool manager over a temporary database, LRU-2 replacement
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    let file = create_temp_db_file()?;
    let disk = Arc::new(FileDiskManager::new(file.path())?);
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, disk, 2));
    Ok((buffer_pool, file))
}
