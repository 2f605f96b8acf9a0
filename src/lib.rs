// Export public modules
pub mod common;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use index::btree::{BPlusTree, BTreeError};
pub use storage::buffer::{BufferPoolError, BufferPoolManager, LRUKReplacer};
pub use storage::disk::{DiskManager, FileDiskManager};
pub use transaction::concurrency::{
    IsolationLevel, LockManager, LockMode, Transaction, TransactionManager,
};
