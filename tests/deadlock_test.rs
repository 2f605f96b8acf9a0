use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use stratadb::transaction::concurrency::{
    AbortReason, IsolationLevel, LockManager, LockMode, TransactionManager, TransactionState,
};

const TABLE_1: u32 = 1;
const TABLE_2: u32 = 2;

fn setup() -> (Arc<LockManager>, Arc<TransactionManager>) {
    let lock_manager = Arc::new(LockManager::with_detection_interval(Duration::from_millis(10)));
    let txn_manager = Arc::new(TransactionManager::new(lock_manager.clone()));
    (lock_manager, txn_manager)
}

#[test]
fn test_two_transaction_deadlock_aborts_youngest() {
    let (lock_manager, txn_manager) = setup();
    lock_manager.start_cycle_detection();

    let a = txn_manager.begin(IsolationLevel::RepeatableRead); // id 0
    let b = txn_manager.begin(IsolationLevel::RepeatableRead); // id 1

    lock_manager.lock_table(&a, LockMode::Exclusive, TABLE_1).unwrap();
    lock_manager.lock_table(&b, LockMode::Exclusive, TABLE_2).unwrap();

    let (tx_a, rx_a) = mpsc::channel();
    let handle_a = {
        let lock_manager = lock_manager.clone();
        let txn_manager = txn_manager.clone();
        let a = a.clone();
        thread::spawn(move || {
            // A waits on T2, held by B; once B is aborted the grant arrives
            let result = lock_manager.lock_table(&a, LockMode::Exclusive, TABLE_2);
            if result.is_err() {
                txn_manager.abort(&a);
            }
            tx_a.send(result).unwrap();
        })
    };

    // Give A a moment to park on T2's queue, then close the cycle from B
    thread::sleep(Duration::from_millis(50));
    let result_b = lock_manager.lock_table(&b, LockMode::Exclusive, TABLE_1);

    // B has the larger txn id: the detector picks it as the victim
    let err = result_b.unwrap_err();
    assert_eq!(err.reason, AbortReason::Deadlock);
    assert_eq!(b.state(), TransactionState::Aborted);
    txn_manager.abort(&b);

    // The survivor's blocked request is granted once B's locks are gone
    let result_a = rx_a.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(result_a.is_ok());
    assert!(a.holds_table_lock(TABLE_2, LockMode::Exclusive));
    handle_a.join().unwrap();

    txn_manager.commit(&a);
    lock_manager.stop_cycle_detection();
}

#[test]
fn test_three_transaction_cycle_single_victim() {
    let (lock_manager, txn_manager) = setup();
    lock_manager.start_cycle_detection();

    let txns: Vec<_> = (0..3)
        .map(|_| txn_manager.begin(IsolationLevel::RepeatableRead))
        .collect();
    for (i, txn) in txns.iter().enumerate() {
        lock_manager
            .lock_table(txn, LockMode::Exclusive, i as u32 + 10)
            .unwrap();
    }

    // Each transaction requests the next one's table: 0 -> 1 -> 2 -> 0
    let (tx, rx) = mpsc::channel();
    let mut handles = Vec::new();
    for (i, txn) in txns.iter().enumerate() {
        let lock_manager = lock_manager.clone();
        let txn_manager = txn_manager.clone();
        let txn = txn.clone();
        let tx = tx.clone();
        let target = ((i + 1) % 3) as u32 + 10;
        handles.push(thread::spawn(move || {
            let result = lock_manager.lock_table(&txn, LockMode::Exclusive, target);
            if result.is_err() {
                txn_manager.abort(&txn);
            }
            tx.send((txn.id(), result.is_ok())).unwrap();
        }));
        // Stagger so requests queue up in order
        thread::sleep(Duration::from_millis(20));
    }
    drop(tx);

    // Two threads settle on their own: the victim errors out and releases,
    // which unblocks the transaction that was waiting on it.
    let mut outcomes = vec![
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        rx.recv_timeout(Duration::from_secs(5)).unwrap(),
    ];
    outcomes.sort();

    // Exactly one victim: the youngest transaction in the cycle
    let aborted: Vec<i32> = outcomes
        .iter()
        .filter(|(_, ok)| !ok)
        .map(|(id, _)| *id)
        .collect();
    assert_eq!(aborted, vec![2]);

    // Transaction 0 still waits on table 11; committing transaction 1
    // releases it and the last grant arrives.
    txn_manager.commit(&txns[1]);
    let last = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(last, (0, true));
    for handle in handles {
        handle.join().unwrap();
    }

    txn_manager.commit(&txns[0]);
    lock_manager.stop_cycle_detection();
}

#[test]
fn test_no_false_positives_without_cycle() {
    let (lock_manager, txn_manager) = setup();
    lock_manager.start_cycle_detection();

    let a = txn_manager.begin(IsolationLevel::RepeatableRead);
    let b = txn_manager.begin(IsolationLevel::RepeatableRead);

    lock_manager.lock_table(&a, LockMode::Shared, TABLE_1).unwrap();
    lock_manager.lock_table(&b, LockMode::Shared, TABLE_1).unwrap();

    // A plain waiter is not a deadlock; let several detector passes run
    let c = txn_manager.begin(IsolationLevel::RepeatableRead);
    let (tx, rx) = mpsc::channel();
    let handle = {
        let lock_manager = lock_manager.clone();
        let c = c.clone();
        thread::spawn(move || {
            let result = lock_manager.lock_table(&c, LockMode::Exclusive, TABLE_1);
            tx.send(result).unwrap();
        })
    };
    thread::sleep(Duration::from_millis(100));
    assert_eq!(a.state(), TransactionState::Growing);
    assert_eq!(b.state(), TransactionState::Growing);
    assert_eq!(c.state(), TransactionState::Growing);

    txn_manager.commit(&a);
    txn_manager.commit(&b);
    let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(result.is_ok());
    handle.join().unwrap();
    txn_manager.commit(&c);
    lock_manager.stop_cycle_detection();
}
