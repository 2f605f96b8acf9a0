use std::collections::{HashMap, HashSet};
use parking_lot::Mutex;

use crate::common::types::{Rid, TableOid, TxnId};
use crate::transaction::concurrency::lock_manager::LockMode;

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking states. GROWING transitions to SHRINKING on the first
/// release the isolation level counts; COMMITTED and ABORTED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// An active transaction: an id, an isolation level, a 2PL state and the lock
/// sets the lock manager maintains on its behalf. Shared as `Arc<Transaction>`
/// between the caller, the waiters' queues and the deadlock detector.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    locks: Mutex<LockSets>,
}

#[derive(Default)]
struct LockSets {
    shared_tables: HashSet<TableOid>,
    exclusive_tables: HashSet<TableOid>,
    intention_shared_tables: HashSet<TableOid>,
    intention_exclusive_tables: HashSet<TableOid>,
    shared_intention_exclusive_tables: HashSet<TableOid>,
    shared_rows: HashMap<TableOid, HashSet<Rid>>,
    exclusive_rows: HashMap<TableOid, HashSet<Rid>>,
}

impl LockSets {
    fn table_set(&mut self, mode: LockMode) -> &mut HashSet<TableOid> {
        match mode {
            LockMode::Shared => &mut self.shared_tables,
            LockMode::Exclusive => &mut self.exclusive_tables,
            LockMode::IntentionShared => &mut self.intention_shared_tables,
            LockMode::IntentionExclusive => &mut self.intention_exclusive_tables,
            LockMode::SharedIntentionExclusive => &mut self.shared_intention_exclusive_tables,
        }
    }
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            locks: Mutex::new(LockSets::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// True if this transaction holds a table lock of exactly this mode
    pub fn holds_table_lock(&self, oid: TableOid, mode: LockMode) -> bool {
        self.locks.lock().table_set(mode).contains(&oid)
    }

    /// The mode this transaction holds on the table, if any
    pub fn held_table_mode(&self, oid: TableOid) -> Option<LockMode> {
        let locks = self.locks.lock();
        let found = [
            (LockMode::Shared, &locks.shared_tables),
            (LockMode::Exclusive, &locks.exclusive_tables),
            (LockMode::IntentionShared, &locks.intention_shared_tables),
            (LockMode::IntentionExclusive, &locks.intention_exclusive_tables),
            (
                LockMode::SharedIntentionExclusive,
                &locks.shared_intention_exclusive_tables,
            ),
        ]
        .into_iter()
        .find(|(_, set)| set.contains(&oid))
        .map(|(mode, _)| mode);
        found
    }

    pub fn holds_row_lock(&self, oid: TableOid, rid: Rid, mode: LockMode) -> bool {
        let locks = self.locks.lock();
        let rows = match mode {
            LockMode::Shared => &locks.shared_rows,
            LockMode::Exclusive => &locks.exclusive_rows,
            _ => return false,
        };
        rows.get(&oid).is_some_and(|set| set.contains(&rid))
    }

    /// True while any row lock on the table is still held
    pub fn has_row_locks_on(&self, oid: TableOid) -> bool {
        let locks = self.locks.lock();
        locks.shared_rows.get(&oid).is_some_and(|s| !s.is_empty())
            || locks.exclusive_rows.get(&oid).is_some_and(|s| !s.is_empty())
    }

    pub(crate) fn insert_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.locks.lock().table_set(mode).insert(oid);
    }

    pub(crate) fn remove_table_lock(&self, mode: LockMode, oid: TableOid) {
        self.locks.lock().table_set(mode).remove(&oid);
    }

    pub(crate) fn insert_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut locks = self.locks.lock();
        let rows = match mode {
            LockMode::Shared => &mut locks.shared_rows,
            LockMode::Exclusive => &mut locks.exclusive_rows,
            _ => return,
        };
        rows.entry(oid).or_default().insert(rid);
    }

    pub(crate) fn remove_row_lock(&self, mode: LockMode, oid: TableOid, rid: Rid) {
        let mut locks = self.locks.lock();
        let rows = match mode {
            LockMode::Shared => &mut locks.shared_rows,
            LockMode::Exclusive => &mut locks.exclusive_rows,
            _ => return,
        };
        if let Some(set) = rows.get_mut(&oid) {
            set.remove(&rid);
        }
    }

    /// Snapshot every held lock and clear the sets; used by terminal release
    #[allow(clippy::type_complexity)]
    pub(crate) fn take_all_locks(&self) -> (Vec<(TableOid, LockMode)>, Vec<(TableOid, Rid, LockMode)>) {
        let mut locks = self.locks.lock();
        let mut tables = Vec::new();
        let mut rows = Vec::new();
        let LockSets {
            shared_tables,
            exclusive_tables,
            intention_shared_tables,
            intention_exclusive_tables,
            ..
        } = &mut *locks;
        for (mode, set) in [
            (LockMode::Shared, shared_tables),
            (LockMode::Exclusive, exclusive_tables),
            (LockMode::IntentionShared, intention_shared_tables),
            (LockMode::IntentionExclusive, intention_exclusive_tables),
        ] {
            tables.extend(set.drain().map(|oid| (oid, mode)));
        }
        tables.extend(
            locks
                .shared_intention_exclusive_tables
                .drain()
                .map(|oid| (oid, LockMode::SharedIntentionExclusive)),
        );
        for (oid, set) in locks.shared_rows.drain() {
            rows.extend(set.into_iter().map(|rid| (oid, rid, LockMode::Shared)));
        }
        for (oid, set) in locks.exclusive_rows.drain() {
            rows.extend(set.into_iter().map(|rid| (oid, rid, LockMode::Exclusive)));
        }
        (tables, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_transaction_is_growing() {
        let txn = Transaction::new(1, IsolationLevel::RepeatableRead);
        assert_eq!(txn.id(), 1);
        assert_eq!(txn.state(), TransactionState::Growing);
        assert_eq!(txn.isolation_level(), IsolationLevel::RepeatableRead);
    }

    #[test]
    fn test_table_lock_set_bookkeeping() {
        let txn = Transaction::new(2, IsolationLevel::ReadCommitted);
        txn.insert_table_lock(LockMode::IntentionExclusive, 7);
        assert!(txn.holds_table_lock(7, LockMode::IntentionExclusive));
        assert_eq!(txn.held_table_mode(7), Some(LockMode::IntentionExclusive));
        assert_eq!(txn.held_table_mode(8), None);

        txn.remove_table_lock(LockMode::IntentionExclusive, 7);
        assert_eq!(txn.held_table_mode(7), None);
    }

    #[test]
    fn test_row_lock_set_bookkeeping() {
        let txn = Transaction::new(3, IsolationLevel::RepeatableRead);
        let rid = Rid::new(4, 2);
        txn.insert_row_lock(LockMode::Shared, 7, rid);
        assert!(txn.holds_row_lock(7, rid, LockMode::Shared));
        assert!(txn.has_row_locks_on(7));
        assert!(!txn.has_row_locks_on(8));

        txn.remove_row_lock(LockMode::Shared, 7, rid);
        assert!(!txn.has_row_locks_on(7));
    }

    #[test]
    fn test_take_all_locks_drains_everything() {
        let txn = Transaction::new(4, IsolationLevel::RepeatableRead);
        txn.insert_table_lock(LockMode::IntentionExclusive, 1);
        txn.insert_table_lock(LockMode::Shared, 2);
        txn.insert_row_lock(LockMode::Exclusive, 1, Rid::new(9, 0));

        let (tables, rows) = txn.take_all_locks();
        assert_eq!(tables.len(), 2);
        assert_eq!(rows.len(), 1);
        assert_eq!(txn.held_table_mode(1), None);
        assert!(!txn.has_row_locks_on(1));
    }
}
