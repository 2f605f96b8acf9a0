use thiserror::Error;
use crate::storage::buffer::BufferPoolError;

#[derive(Error, Debug)]
pub enum BTreeError {
    #[error("Buffer pool error: {0}")]
    BufferPool(#[from] BufferPoolError),

    #[error("Invalid page format")]
    InvalidPageFormat,

    #[error("Node capacity {0} does not fit in a page")]
    NodeTooLarge(usize),

    #[error("Index name too long: {0}")]
    IndexNameTooLong(String),

    #[error("Header page has no room for another index record")]
    HeaderFull,
}
