use thiserror::Error;
use crate::common::types::TxnId;

/// Why a transaction was aborted by the lock manager
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    #[error("shared lock requested under READ UNCOMMITTED")]
    LockSharedOnReadUncommitted,

    #[error("lock requested while shrinking")]
    LockOnShrinking,

    #[error("requested upgrade is not in the upgrade graph")]
    IncompatibleUpgrade,

    #[error("another transaction is already upgrading on this resource")]
    UpgradeConflict,

    #[error("no lock held on the resource")]
    AttemptedUnlockButNoLockHeld,

    #[error("table unlocked before all of its row locks")]
    TableUnlockedBeforeUnlockingRows,

    #[error("intention lock requested on a row")]
    IntentionLockOnRow,

    #[error("row lock requested without the required table lock")]
    TableLockNotPresent,

    #[error("chosen as a deadlock victim")]
    Deadlock,
}

/// Raised to the caller whenever the lock manager aborts a transaction. The
/// transaction's state is already ABORTED when this surfaces; the reason is
/// never swallowed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("transaction {txn_id} aborted: {reason}")]
pub struct TransactionAbort {
    pub txn_id: TxnId,
    pub reason: AbortReason,
}

impl TransactionAbort {
    pub fn new(txn_id: TxnId, reason: AbortReason) -> Self {
        Self { txn_id, reason }
    }
}
