use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TableOid, TxnId, INVALID_TXN_ID};
use crate::transaction::concurrency::error::{AbortReason, TransactionAbort};
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionState,
};
use crate::transaction::concurrency::waits_for::WaitsForGraph;

/// Lock modes for multi-granularity locking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

/// May two granted locks of these modes coexist on the same object?
pub(crate) fn compatible(a: LockMode, b: LockMode) -> bool {
    use LockMode::*;
    match (a, b) {
        (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
        (IntentionShared, _) | (_, IntentionShared) => true,
        (IntentionExclusive, IntentionExclusive) => true,
        (Shared, Shared) => true,
        _ => false,
    }
}

/// The table-lock upgrade graph: IS -> {S, X, IX, SIX}, S -> {X, SIX},
/// IX -> {X, SIX}, SIX -> {X}
pub(crate) fn can_upgrade(from: LockMode, to: LockMode) -> bool {
    use LockMode::*;
    matches!(
        (from, to),
        (IntentionShared, Shared)
            | (IntentionShared, Exclusive)
            | (IntentionShared, IntentionExclusive)
            | (IntentionShared, SharedIntentionExclusive)
            | (Shared, Exclusive)
            | (Shared, SharedIntentionExclusive)
            | (IntentionExclusive, Exclusive)
            | (IntentionExclusive, SharedIntentionExclusive)
            | (SharedIntentionExclusive, Exclusive)
    )
}

struct LockRequest {
    txn: Arc<Transaction>,
    mode: LockMode,
    oid: TableOid,
    #[allow(dead_code)]
    rid: Option<Rid>,
    granted: bool,
}

struct QueueState {
    requests: Vec<LockRequest>,
    /// The single transaction currently upgrading on this object, if any
    upgrading: TxnId,
}

impl Default for QueueState {
    fn default() -> Self {
        Self {
            requests: Vec::new(),
            upgrading: INVALID_TXN_ID,
        }
    }
}

/// Per-object FIFO queue of lock requests plus the condition variable its
/// waiters block on
#[derive(Default)]
struct LockRequestQueue {
    state: Mutex<QueueState>,
    cv: Condvar,
}

/// A request can be granted when it is compatible with every granted holder
/// and sits at the head of the ungranted region of the queue
fn can_grant(state: &QueueState, txn_id: TxnId) -> bool {
    let Some(target) = state.requests.iter().find(|r| r.txn.id() == txn_id) else {
        return false;
    };
    for request in &state.requests {
        if request.granted {
            if !compatible(target.mode, request.mode) {
                return false;
            }
        } else {
            return request.txn.id() == txn_id;
        }
    }
    false
}

/// Multi-granularity two-phase lock manager with table and row locks, lock
/// upgrades and background deadlock detection.
///
/// Locking discipline: take a map latch, locate or insert the queue, take the
/// queue latch, release the map latch. Neither map latch is ever held while
/// waiting on a queue's condition variable.
pub struct LockManager {
    table_lock_map: Mutex<HashMap<TableOid, Arc<LockRequestQueue>>>,
    row_lock_map: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
    detection_interval: Duration,
    detection_running: AtomicBool,
    detection_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        Self::with_detection_interval(Duration::from_millis(50))
    }

    pub fn with_detection_interval(interval: Duration) -> Self {
        Self {
            table_lock_map: Mutex::new(HashMap::new()),
            row_lock_map: Mutex::new(HashMap::new()),
            detection_interval: interval,
            detection_running: AtomicBool::new(false),
            detection_thread: Mutex::new(None),
        }
    }

    /// Acquire a table lock, blocking until it is grantable. Re-requesting
    /// the held mode succeeds immediately; requesting a different mode is an
    /// upgrade.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
    ) -> Result<(), TransactionAbort> {
        self.check_isolation(txn, mode)?;

        let queue = self.table_queue(oid);
        let mut state = queue.state.lock();

        let mut is_upgrade = false;
        if let Some(pos) = state.requests.iter().position(|r| r.txn.id() == txn.id()) {
            let held = state.requests[pos].mode;
            if held == mode {
                return Ok(());
            }
            if !can_upgrade(held, mode) {
                drop(state);
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }
            if state.upgrading != INVALID_TXN_ID {
                drop(state);
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            state.requests.remove(pos);
            txn.remove_table_lock(held, oid);
            state.upgrading = txn.id();
            is_upgrade = true;
        }

        let request = LockRequest {
            txn: txn.clone(),
            mode,
            oid,
            rid: None,
            granted: false,
        };
        enqueue(&mut state, request, is_upgrade);

        while !can_grant(&state, txn.id()) {
            queue.cv.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                if state.upgrading == txn.id() {
                    state.upgrading = INVALID_TXN_ID;
                }
                state.requests.retain(|r| r.txn.id() != txn.id());
                queue.cv.notify_all();
                return Err(TransactionAbort::new(txn.id(), AbortReason::Deadlock));
            }
        }

        let request = state
            .requests
            .iter_mut()
            .find(|r| r.txn.id() == txn.id())
            .expect("granted request is still queued");
        request.granted = true;
        if state.upgrading == txn.id() {
            state.upgrading = INVALID_TXN_ID;
        }
        txn.insert_table_lock(mode, oid);
        debug!("txn {} granted {:?} on table {}", txn.id(), mode, oid);
        if mode != LockMode::Exclusive {
            queue.cv.notify_all();
        }
        Ok(())
    }

    /// Release a table lock. Every row lock on the table must already be
    /// released; the transaction may move to SHRINKING per its isolation
    /// level.
    pub fn unlock_table(&self, txn: &Arc<Transaction>, oid: TableOid) -> Result<(), TransactionAbort> {
        let queue = self.table_lock_map.lock().get(&oid).cloned();
        let Some(queue) = queue else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        if txn.has_row_locks_on(oid) {
            return Err(self.abort(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let mut state = queue.state.lock();
        let pos = state
            .requests
            .iter()
            .position(|r| r.txn.id() == txn.id() && r.granted);
        let Some(pos) = pos else {
            drop(state);
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let request = state.requests.remove(pos);
        queue.cv.notify_all();
        drop(state);

        txn.remove_table_lock(request.mode, oid);
        self.apply_shrink(txn, request.mode);
        Ok(())
    }

    /// Acquire a row lock. Rows take only S or X; the required table lock
    /// must already be held, and the only row upgrade is S -> X.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        oid: TableOid,
        rid: Rid,
    ) -> Result<(), TransactionAbort> {
        if !matches!(mode, LockMode::Shared | LockMode::Exclusive) {
            return Err(self.abort(txn, AbortReason::IntentionLockOnRow));
        }
        self.check_isolation(txn, mode)?;

        let table_ok = match mode {
            LockMode::Exclusive => {
                txn.holds_table_lock(oid, LockMode::Exclusive)
                    || txn.holds_table_lock(oid, LockMode::IntentionExclusive)
                    || txn.holds_table_lock(oid, LockMode::SharedIntentionExclusive)
            }
            _ => txn.held_table_mode(oid).is_some(),
        };
        if !table_ok {
            return Err(self.abort(txn, AbortReason::TableLockNotPresent));
        }

        let queue = self.row_queue(rid);
        let mut state = queue.state.lock();

        let mut is_upgrade = false;
        if let Some(pos) = state
            .requests
            .iter()
            .position(|r| r.txn.id() == txn.id() && r.oid == oid)
        {
            let held = state.requests[pos].mode;
            if held == mode {
                return Ok(());
            }
            if !(held == LockMode::Shared && mode == LockMode::Exclusive) {
                drop(state);
                return Err(self.abort(txn, AbortReason::IncompatibleUpgrade));
            }
            if state.upgrading != INVALID_TXN_ID {
                drop(state);
                return Err(self.abort(txn, AbortReason::UpgradeConflict));
            }
            state.requests.remove(pos);
            txn.remove_row_lock(held, oid, rid);
            state.upgrading = txn.id();
            is_upgrade = true;
        }

        let request = LockRequest {
            txn: txn.clone(),
            mode,
            oid,
            rid: Some(rid),
            granted: false,
        };
        enqueue(&mut state, request, is_upgrade);

        while !can_grant(&state, txn.id()) {
            queue.cv.wait(&mut state);
            if txn.state() == TransactionState::Aborted {
                if state.upgrading == txn.id() {
                    state.upgrading = INVALID_TXN_ID;
                }
                state.requests.retain(|r| r.txn.id() != txn.id());
                queue.cv.notify_all();
                return Err(TransactionAbort::new(txn.id(), AbortReason::Deadlock));
            }
        }

        let request = state
            .requests
            .iter_mut()
            .find(|r| r.txn.id() == txn.id())
            .expect("granted request is still queued");
        request.granted = true;
        if state.upgrading == txn.id() {
            state.upgrading = INVALID_TXN_ID;
        }
        txn.insert_row_lock(mode, oid, rid);
        debug!("txn {} granted {:?} on row {:?}", txn.id(), mode, rid);
        if mode != LockMode::Exclusive {
            queue.cv.notify_all();
        }
        Ok(())
    }

    /// Release a row lock
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        oid: TableOid,
        rid: Rid,
    ) -> Result<(), TransactionAbort> {
        let queue = self.row_lock_map.lock().get(&rid).cloned();
        let Some(queue) = queue else {
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };

        let mut state = queue.state.lock();
        let pos = state
            .requests
            .iter()
            .position(|r| r.txn.id() == txn.id() && r.oid == oid && r.granted);
        let Some(pos) = pos else {
            drop(state);
            return Err(self.abort(txn, AbortReason::AttemptedUnlockButNoLockHeld));
        };
        let request = state.requests.remove(pos);
        queue.cv.notify_all();
        drop(state);

        txn.remove_row_lock(request.mode, oid, rid);
        self.apply_shrink(txn, request.mode);
        Ok(())
    }

    /// Unconditional release of every lock the transaction holds, used at
    /// commit/abort. No SHRINKING transition and no validation; every
    /// affected queue is notified.
    pub fn release_all(&self, txn: &Arc<Transaction>) {
        let (tables, rows) = txn.take_all_locks();

        for (oid, rid, _mode) in rows {
            let queue = self.row_lock_map.lock().get(&rid).cloned();
            if let Some(queue) = queue {
                let mut state = queue.state.lock();
                state
                    .requests
                    .retain(|r| !(r.txn.id() == txn.id() && r.oid == oid));
                queue.cv.notify_all();
            }
        }
        for (oid, _mode) in tables {
            let queue = self.table_lock_map.lock().get(&oid).cloned();
            if let Some(queue) = queue {
                let mut state = queue.state.lock();
                if state.upgrading == txn.id() {
                    state.upgrading = INVALID_TXN_ID;
                }
                state.requests.retain(|r| r.txn.id() != txn.id());
                queue.cv.notify_all();
            }
        }
    }

    /// Spawn the background deadlock detector. Idempotent; the thread stops
    /// when [`stop_cycle_detection`](Self::stop_cycle_detection) is called or
    /// the manager is dropped.
    pub fn start_cycle_detection(self: &Arc<Self>) {
        if self.detection_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(self);
        let interval = self.detection_interval;
        let handle = std::thread::spawn(move || loop {
            std::thread::sleep(interval);
            let Some(manager) = weak.upgrade() else {
                break;
            };
            if !manager.detection_running.load(Ordering::SeqCst) {
                break;
            }
            manager.run_detection_pass();
        });
        *self.detection_thread.lock() = Some(handle);
    }

    pub fn stop_cycle_detection(&self) {
        self.detection_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.detection_thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// One detection pass: under both map latches, build the waits-for graph
    /// (each ungranted request waits on every granted holder it conflicts
    /// with), abort the youngest transaction of every cycle, and wake all
    /// queues if anything was aborted.
    fn run_detection_pass(&self) {
        let table_map = self.table_lock_map.lock();
        let row_map = self.row_lock_map.lock();

        let mut graph = WaitsForGraph::default();
        let mut txns: HashMap<TxnId, Arc<Transaction>> = HashMap::new();
        for queue in table_map.values().chain(row_map.values()) {
            let state = queue.state.lock();
            for waiter in state.requests.iter().filter(|r| !r.granted) {
                for holder in state.requests.iter().filter(|r| r.granted) {
                    if !compatible(waiter.mode, holder.mode) {
                        graph.add_edge(waiter.txn.id(), holder.txn.id());
                        txns.insert(waiter.txn.id(), waiter.txn.clone());
                        txns.insert(holder.txn.id(), holder.txn.clone());
                    }
                }
            }
        }

        let mut aborted_any = false;
        while let Some(victim) = graph.find_victim() {
            warn!("deadlock detected; aborting txn {}", victim);
            graph.remove_txn(victim);
            if let Some(txn) = txns.get(&victim) {
                txn.set_state(TransactionState::Aborted);
            }
            aborted_any = true;
        }
        if aborted_any {
            for queue in table_map.values().chain(row_map.values()) {
                queue.cv.notify_all();
            }
        }
    }

    fn table_queue(&self, oid: TableOid) -> Arc<LockRequestQueue> {
        self.table_lock_map.lock().entry(oid).or_default().clone()
    }

    fn row_queue(&self, rid: Rid) -> Arc<LockRequestQueue> {
        self.row_lock_map.lock().entry(rid).or_default().clone()
    }

    /// Abort the transaction and surface the reason to the caller
    fn abort(&self, txn: &Arc<Transaction>, reason: AbortReason) -> TransactionAbort {
        debug!("aborting txn {}: {}", txn.id(), reason);
        txn.set_state(TransactionState::Aborted);
        TransactionAbort::new(txn.id(), reason)
    }

    /// Isolation-level legality of an acquire, validated on every request
    fn check_isolation(&self, txn: &Arc<Transaction>, mode: LockMode) -> Result<(), TransactionAbort> {
        use LockMode::*;
        let state = txn.state();
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(mode, Shared | IntentionShared | SharedIntentionExclusive) {
                    return Err(self.abort(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if state == TransactionState::Shrinking
                    && matches!(mode, Exclusive | IntentionExclusive)
                {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if state == TransactionState::Shrinking
                    && matches!(mode, Exclusive | IntentionExclusive | SharedIntentionExclusive)
                {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if state == TransactionState::Shrinking {
                    return Err(self.abort(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    /// GROWING -> SHRINKING on releases the isolation level counts:
    /// REPEATABLE READ shrinks on S or X, the others only on X
    fn apply_shrink(&self, txn: &Arc<Transaction>, released: LockMode) {
        let shrinks = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(released, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                released == LockMode::Exclusive
            }
        };
        if shrinks && txn.state() == TransactionState::Growing {
            txn.set_state(TransactionState::Shrinking);
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        // The detector thread holds only a Weak reference and exits on its
        // next tick once this flag clears or the upgrade fails.
        self.detection_running.store(false, Ordering::SeqCst);
    }
}

/// Upgrades enter at the head of the ungranted region; everything else joins
/// the tail
fn enqueue(state: &mut QueueState, request: LockRequest, is_upgrade: bool) {
    if is_upgrade {
        let at = state
            .requests
            .iter()
            .position(|r| !r.granted)
            .unwrap_or(state.requests.len());
        state.requests.insert(at, request);
    } else {
        state.requests.push(request);
    }
}
