use thiserror::Error;
use crate::common::types::PageId;
use crate::storage::buffer::replacer::ReplacerError;
use crate::storage::disk::DiskManagerError;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("Out of memory: every frame is pinned")]
    OutOfMemory,

    #[error("Page {0} not found in the buffer pool")]
    PageNotFound(PageId),

    #[error("Page {0} is pinned")]
    PagePinned(PageId),

    #[error("Page {0} is not pinned")]
    PageNotPinned(PageId),

    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),

    #[error("Replacer error: {0}")]
    ReplacerError(#[from] ReplacerError),

    #[error("Disk manager error: {0}")]
    DiskManagerError(#[from] DiskManagerError),
}
