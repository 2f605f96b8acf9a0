use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stratadb::common::types::Rid;
use stratadb::transaction::concurrency::{
    AbortReason, IsolationLevel, LockManager, LockMode, TransactionManager, TransactionState,
};

const TABLE_A: u32 = 1;
const TABLE_B: u32 = 2;

fn setup() -> (Arc<LockManager>, TransactionManager) {
    let lock_manager = Arc::new(LockManager::new());
    let txn_manager = TransactionManager::new(lock_manager.clone());
    (lock_manager, txn_manager)
}

// Run `action` on its own thread and report whether it finished within `wait`
fn finishes_within<F>(wait: Duration, action: F) -> (bool, thread::JoinHandle<()>)
where
    F: FnOnce() + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    let handle = thread::spawn(move || {
        action();
        let _ = tx.send(());
    });
    let finished = rx.recv_timeout(wait).is_ok();
    (finished, handle)
}

#[test]
fn test_shared_locks_coexist() {
    let (lock_manager, txn_manager) = setup();
    let a = txn_manager.begin(IsolationLevel::RepeatableRead);
    let b = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager.lock_table(&a, LockMode::Shared, TABLE_A).unwrap();
    lock_manager.lock_table(&b, LockMode::Shared, TABLE_A).unwrap();

    assert!(a.holds_table_lock(TABLE_A, LockMode::Shared));
    assert!(b.holds_table_lock(TABLE_A, LockMode::Shared));

    txn_manager.commit(&a);
    txn_manager.commit(&b);
}

#[test]
fn test_same_mode_reacquire_is_a_no_op() {
    let (lock_manager, txn_manager) = setup();
    let a = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager.lock_table(&a, LockMode::Shared, TABLE_A).unwrap();
    lock_manager.lock_table(&a, LockMode::Shared, TABLE_A).unwrap();

    lock_manager.unlock_table(&a, TABLE_A).unwrap();
    txn_manager.commit(&a);
}

#[test]
fn test_exclusive_blocks_until_shared_released() {
    let (lock_manager, txn_manager) = setup();
    let a = txn_manager.begin(IsolationLevel::RepeatableRead);
    let b = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager.lock_table(&a, LockMode::Shared, TABLE_A).unwrap();

    let (finished, handle) = {
        let lock_manager = lock_manager.clone();
        let b = b.clone();
        finishes_within(Duration::from_millis(200), move || {
            lock_manager.lock_table(&b, LockMode::Exclusive, TABLE_A).unwrap();
        })
    };
    assert!(!finished, "X request must block behind a granted S");

    lock_manager.unlock_table(&a, TABLE_A).unwrap();
    handle.join().unwrap();
    assert!(b.holds_table_lock(TABLE_A, LockMode::Exclusive));

    // Under REPEATABLE READ, releasing S moved A to SHRINKING; any further
    // acquire aborts it.
    assert_eq!(a.state(), TransactionState::Shrinking);
    let err = lock_manager
        .lock_table(&a, LockMode::Shared, TABLE_B)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::LockOnShrinking);
    assert_eq!(a.state(), TransactionState::Aborted);

    txn_manager.abort(&a);
    txn_manager.commit(&b);
}

#[test]
fn test_intention_modes_coexist_per_matrix() {
    let (lock_manager, txn_manager) = setup();
    let a = txn_manager.begin(IsolationLevel::RepeatableRead);
    let b = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager
        .lock_table(&a, LockMode::IntentionShared, TABLE_A)
        .unwrap();
    lock_manager
        .lock_table(&b, LockMode::IntentionExclusive, TABLE_A)
        .unwrap();

    // S conflicts with the granted IX and must wait
    let c = txn_manager.begin(IsolationLevel::RepeatableRead);
    let (finished, handle) = {
        let lock_manager = lock_manager.clone();
        let c = c.clone();
        finishes_within(Duration::from_millis(200), move || {
            lock_manager.lock_table(&c, LockMode::Shared, TABLE_A).unwrap();
        })
    };
    assert!(!finished, "S must block behind a granted IX");

    txn_manager.commit(&b);
    handle.join().unwrap();
    txn_manager.commit(&a);
    txn_manager.commit(&c);
}

#[test]
fn test_upgrade_waits_for_other_holders() {
    let (lock_manager, txn_manager) = setup();
    let a = txn_manager.begin(IsolationLevel::RepeatableRead);
    let b = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager.lock_table(&a, LockMode::Shared, TABLE_A).unwrap();
    lock_manager.lock_table(&b, LockMode::Shared, TABLE_A).unwrap();

    // A's S -> X upgrade cannot be granted while B also holds S
    let (finished, handle) = {
        let lock_manager = lock_manager.clone();
        let a = a.clone();
        finishes_within(Duration::from_millis(200), move || {
            lock_manager.lock_table(&a, LockMode::Exclusive, TABLE_A).unwrap();
        })
    };
    assert!(!finished, "upgrade must wait for the other S holder");

    lock_manager.unlock_table(&b, TABLE_A).unwrap();
    handle.join().unwrap();
    assert!(a.holds_table_lock(TABLE_A, LockMode::Exclusive));
    assert!(!a.holds_table_lock(TABLE_A, LockMode::Shared));

    txn_manager.commit(&a);
    txn_manager.commit(&b);
}

#[test]
fn test_upgrade_alone_succeeds_immediately() {
    let (lock_manager, txn_manager) = setup();
    let a = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager.lock_table(&a, LockMode::Shared, TABLE_A).unwrap();
    lock_manager.lock_table(&a, LockMode::Exclusive, TABLE_A).unwrap();
    assert!(a.holds_table_lock(TABLE_A, LockMode::Exclusive));

    txn_manager.commit(&a);
}

#[test]
fn test_downgrade_is_an_incompatible_upgrade() {
    let (lock_manager, txn_manager) = setup();
    let a = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager.lock_table(&a, LockMode::Exclusive, TABLE_A).unwrap();
    let err = lock_manager
        .lock_table(&a, LockMode::Shared, TABLE_A)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::IncompatibleUpgrade);
    assert_eq!(a.state(), TransactionState::Aborted);

    txn_manager.abort(&a);
}

#[test]
fn test_read_uncommitted_rejects_shared() {
    let (lock_manager, txn_manager) = setup();

    for mode in [
        LockMode::Shared,
        LockMode::IntentionShared,
        LockMode::SharedIntentionExclusive,
    ] {
        let txn = txn_manager.begin(IsolationLevel::ReadUncommitted);
        let err = lock_manager.lock_table(&txn, mode, TABLE_A).unwrap_err();
        assert_eq!(err.reason, AbortReason::LockSharedOnReadUncommitted);
        txn_manager.abort(&txn);
    }

    // X is still allowed
    let txn = txn_manager.begin(IsolationLevel::ReadUncommitted);
    lock_manager.lock_table(&txn, LockMode::Exclusive, TABLE_A).unwrap();
    txn_manager.commit(&txn);
}

#[test]
fn test_read_committed_allows_shared_while_shrinking() {
    let (lock_manager, txn_manager) = setup();
    let txn = txn_manager.begin(IsolationLevel::ReadCommitted);

    lock_manager.lock_table(&txn, LockMode::Exclusive, TABLE_A).unwrap();
    lock_manager.unlock_table(&txn, TABLE_A).unwrap();
    assert_eq!(txn.state(), TransactionState::Shrinking);

    // S is legal while shrinking under READ COMMITTED, X is not
    lock_manager.lock_table(&txn, LockMode::Shared, TABLE_B).unwrap();
    let err = lock_manager
        .lock_table(&txn, LockMode::Exclusive, TABLE_A)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::LockOnShrinking);

    txn_manager.abort(&txn);
}

#[test]
fn test_unlock_without_lock_aborts() {
    let (lock_manager, txn_manager) = setup();
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);

    let err = lock_manager.unlock_table(&txn, TABLE_A).unwrap_err();
    assert_eq!(err.reason, AbortReason::AttemptedUnlockButNoLockHeld);
    assert_eq!(txn.state(), TransactionState::Aborted);

    txn_manager.abort(&txn);
}

#[test]
fn test_row_locks_require_table_locks() {
    let (lock_manager, txn_manager) = setup();
    let rid = Rid::new(3, 7);

    // Intention modes never apply to rows
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    let err = lock_manager
        .lock_row(&txn, LockMode::IntentionShared, TABLE_A, rid)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::IntentionLockOnRow);
    txn_manager.abort(&txn);

    // Row X without any table lock
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    let err = lock_manager
        .lock_row(&txn, LockMode::Exclusive, TABLE_A, rid)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::TableLockNotPresent);
    txn_manager.abort(&txn);

    // Row X under table IS is still insufficient
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    lock_manager
        .lock_table(&txn, LockMode::IntentionShared, TABLE_A)
        .unwrap();
    let err = lock_manager
        .lock_row(&txn, LockMode::Exclusive, TABLE_A, rid)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::TableLockNotPresent);
    txn_manager.abort(&txn);

    // Row S under table IS works; row X under table IX works
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    lock_manager
        .lock_table(&txn, LockMode::IntentionShared, TABLE_A)
        .unwrap();
    lock_manager
        .lock_row(&txn, LockMode::Shared, TABLE_A, rid)
        .unwrap();
    txn_manager.commit(&txn);

    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);
    lock_manager
        .lock_table(&txn, LockMode::IntentionExclusive, TABLE_A)
        .unwrap();
    lock_manager
        .lock_row(&txn, LockMode::Exclusive, TABLE_A, rid)
        .unwrap();
    txn_manager.commit(&txn);
}

#[test]
fn test_table_unlock_blocked_by_row_locks() {
    let (lock_manager, txn_manager) = setup();
    let rid = Rid::new(5, 1);
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager
        .lock_table(&txn, LockMode::IntentionExclusive, TABLE_A)
        .unwrap();
    lock_manager
        .lock_row(&txn, LockMode::Exclusive, TABLE_A, rid)
        .unwrap();

    let err = lock_manager.unlock_table(&txn, TABLE_A).unwrap_err();
    assert_eq!(err.reason, AbortReason::TableUnlockedBeforeUnlockingRows);

    txn_manager.abort(&txn);
}

#[test]
fn test_row_unlock_order_then_table() {
    let (lock_manager, txn_manager) = setup();
    let rid = Rid::new(5, 2);
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager
        .lock_table(&txn, LockMode::IntentionExclusive, TABLE_A)
        .unwrap();
    lock_manager
        .lock_row(&txn, LockMode::Exclusive, TABLE_A, rid)
        .unwrap();

    lock_manager.unlock_row(&txn, TABLE_A, rid).unwrap();
    // Releasing row X under REPEATABLE READ moves the transaction to
    // SHRINKING, but releasing the remaining table lock is still legal.
    assert_eq!(txn.state(), TransactionState::Shrinking);
    lock_manager.unlock_table(&txn, TABLE_A).unwrap();

    txn_manager.commit(&txn);
}

#[test]
fn test_row_upgrade_s_to_x() {
    let (lock_manager, txn_manager) = setup();
    let rid = Rid::new(6, 0);
    let txn = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager
        .lock_table(&txn, LockMode::IntentionExclusive, TABLE_A)
        .unwrap();
    lock_manager
        .lock_row(&txn, LockMode::Shared, TABLE_A, rid)
        .unwrap();
    lock_manager
        .lock_row(&txn, LockMode::Exclusive, TABLE_A, rid)
        .unwrap();

    assert!(txn.holds_row_lock(TABLE_A, rid, LockMode::Exclusive));
    assert!(!txn.holds_row_lock(TABLE_A, rid, LockMode::Shared));

    // X -> S is not a row upgrade
    let err = lock_manager
        .lock_row(&txn, LockMode::Shared, TABLE_A, rid)
        .unwrap_err();
    assert_eq!(err.reason, AbortReason::IncompatibleUpgrade);

    txn_manager.abort(&txn);
}

#[test]
fn test_commit_releases_everything() {
    let (lock_manager, txn_manager) = setup();
    let rid = Rid::new(8, 3);

    let a = txn_manager.begin(IsolationLevel::RepeatableRead);
    lock_manager
        .lock_table(&a, LockMode::IntentionExclusive, TABLE_A)
        .unwrap();
    lock_manager
        .lock_row(&a, LockMode::Exclusive, TABLE_A, rid)
        .unwrap();

    // B blocks behind A's IX with an S request
    let b = txn_manager.begin(IsolationLevel::RepeatableRead);
    let (finished, handle) = {
        let lock_manager = lock_manager.clone();
        let b = b.clone();
        finishes_within(Duration::from_millis(200), move || {
            lock_manager.lock_table(&b, LockMode::Shared, TABLE_A).unwrap();
        })
    };
    assert!(!finished);

    // Commit releases the row and table locks and wakes B
    txn_manager.commit(&a);
    handle.join().unwrap();
    assert!(b.holds_table_lock(TABLE_A, LockMode::Shared));
    txn_manager.commit(&b);
}
