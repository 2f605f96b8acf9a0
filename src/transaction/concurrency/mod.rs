pub mod error;
pub mod lock_manager;
pub mod transaction;
pub mod transaction_manager;
mod waits_for;

pub use error::{AbortReason, TransactionAbort};
pub use lock_manager::{LockManager, LockMode};
pub use transaction::{IsolationLevel, Transaction, TransactionState};
pub use transaction_manager::TransactionManager;
