use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};

/// Issues transaction ids, tracks active transactions, and drives the
/// terminal transitions: commit and abort both release every lock the
/// transaction still holds.
pub struct TransactionManager {
    next_txn_id: AtomicI32,
    lock_manager: Arc<LockManager>,
    active: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new(lock_manager: Arc<LockManager>) -> Self {
        Self {
            next_txn_id: AtomicI32::new(0),
            lock_manager,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Start a new transaction in the GROWING state
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(id, isolation_level));
        self.active.lock().insert(id, txn.clone());
        txn
    }

    /// Commit: release every lock and mark the transaction COMMITTED. A
    /// transaction already aborted (by the deadlock detector) stays aborted.
    pub fn commit(&self, txn: &Arc<Transaction>) {
        self.lock_manager.release_all(txn);
        if txn.state() != TransactionState::Aborted {
            txn.set_state(TransactionState::Committed);
        }
        self.active.lock().remove(&txn.id());
    }

    /// Abort: release every lock and mark the transaction ABORTED
    pub fn abort(&self, txn: &Arc<Transaction>) {
        self.lock_manager.release_all(txn);
        txn.set_state(TransactionState::Aborted);
        self.active.lock().remove(&txn.id());
    }

    pub fn get_transaction(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active.lock().get(&txn_id).cloned()
    }
}
