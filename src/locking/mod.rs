//! C4: RecordLocker — per-record SHARED/EXCLUSIVE locking with deadlock
//! avoidance (§5).
//!
//! Grounded on the teacher's `transaction::lock_manager` (lock table shape,
//! FIFO wait queues, timeout handling) and `transaction::deadlock` (wait-for
//! graph, DFS cycle detection, victim selection), generalized from
//! `parking_lot::Condvar` blocking waits to `tokio::sync::Notify` so
//! `acquire` is a cancellable async operation per §5's requirement that
//! every blocking point in this crate be explicit and bounded.

mod deadlock;

pub use deadlock::{DeadlockDetector, DeadlockDetectorConfig, VictimSelectionPolicy};

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::timeout as tokio_timeout;

use crate::clock::{Clock, IdGenerator};
use crate::common::TransactionId;
use crate::events::{names, Event, EventBus};
use crate::store::model::{Lock, LockMode};
use crate::store::Store;
use crate::{CoreError, Result};

/// Policy knobs for lock acquisition (§5).
#[derive(Debug, Clone, Copy)]
pub struct LockingConfig {
    pub lock_expiration: Duration,
    pub renewal_interval: Duration,
    pub max_wait: Duration,
    pub detector: DeadlockDetectorConfig,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            lock_expiration: Duration::from_secs(30),
            renewal_interval: Duration::from_secs(10),
            max_wait: Duration::from_secs(30),
            detector: DeadlockDetectorConfig::default(),
        }
    }
}

struct Waiter {
    txn_id: TransactionId,
    notify: Arc<Notify>,
}

/// A held lock, returned by `RecordLocker::acquire`. Dropping it without
/// calling `release` leaks the in-memory waiter bookkeeping until expiry —
/// callers should always release explicitly; this type does not implement
/// `Drop` because release is async and cannot run from a synchronous drop.
#[derive(Debug)]
pub struct LockGuard {
    pub lock_id: String,
    pub resource_id: String,
    pub txn_id: TransactionId,
    pub mode: LockMode,
}

/// Per-record locking with FIFO fairness and proactive deadlock avoidance.
pub struct RecordLocker {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    config: LockingConfig,
    waiters: Mutex<std::collections::HashMap<String, VecDeque<Arc<Waiter>>>>,
    detector: DeadlockDetector,
}

impl RecordLocker {
    pub fn new(
        store: Arc<dyn Store>,
        events: Arc<EventBus>,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        config: LockingConfig,
    ) -> Self {
        let detector = DeadlockDetector::new(config.detector);
        Self {
            store,
            events,
            clock,
            ids,
            config,
            waiters: Mutex::new(std::collections::HashMap::new()),
            detector,
        }
    }

    /// Acquires `mode` on `resource_id` for `txn_id`, waiting up to
    /// `LockingConfig::max_wait` and proactively failing fast if granting the
    /// wait would close a cycle in the wait-for graph (§5 deadlock
    /// avoidance — a transaction never blocks behind its own dependents).
    pub async fn acquire(&self, resource_id: &str, txn_id: TransactionId, mode: LockMode) -> Result<LockGuard> {
        let deadline = self.clock.now() + self.config.max_wait;
        loop {
            let holders = self.live_holders(resource_id).await?;
            let blocking: Vec<TransactionId> = holders
                .iter()
                .filter(|l| l.holder != txn_id && !l.mode.compatible_with(mode))
                .map(|l| l.holder)
                .collect();

            if blocking.is_empty() {
                let lock = Lock {
                    lock_id: self.ids.new_lock_id(),
                    resource_id: resource_id.to_string(),
                    mode,
                    holder: txn_id,
                    acquired_at: Utc::now(),
                    expires_at: Utc::now()
                        + chrono::Duration::from_std(self.config.lock_expiration).unwrap_or(chrono::Duration::zero()),
                };
                self.store.put_lock(lock.clone()).await?;
                self.detector.remove_wait(txn_id);
                self.events
                    .publish(Event::new(
                        names::LOCK_ACQUIRED,
                        Some(txn_id),
                        serde_json::json!({"resourceId": resource_id, "mode": format!("{mode:?}"), "lockId": lock.lock_id}),
                    ))
                    .await;
                return Ok(LockGuard {
                    lock_id: lock.lock_id,
                    resource_id: resource_id.to_string(),
                    txn_id,
                    mode,
                });
            }

            for holder in &blocking {
                self.detector.add_wait(txn_id, *holder);
            }

            if let Some(cycle) = self.detector.detect_deadlock() {
                if cycle.contains(&txn_id) {
                    self.detector.remove_wait(txn_id);
                    return Err(CoreError::deadlock(cycle));
                }
            }

            let notify = Arc::new(Notify::new());
            self.register_waiter(resource_id, txn_id, notify.clone());

            let now = self.clock.now();
            if now >= deadline {
                self.detector.remove_wait(txn_id);
                self.deregister_waiter(resource_id, txn_id);
                return Err(CoreError::lock_timeout(resource_id));
            }
            let remaining = deadline.duration_since(now).unwrap_or(Duration::ZERO);

            if tokio_timeout(remaining, notify.notified()).await.is_err() {
                self.detector.remove_wait(txn_id);
                self.deregister_waiter(resource_id, txn_id);
                return Err(CoreError::lock_timeout(resource_id));
            }
        }
    }

    /// Releases a previously acquired lock and wakes the next compatible
    /// FIFO waiter(s) on the resource.
    pub async fn release(&self, guard: &LockGuard) -> Result<()> {
        self.store.remove_lock(&guard.resource_id, &guard.lock_id).await?;
        self.detector.remove_wait(guard.txn_id);
        self.events
            .publish(Event::new(
                names::LOCK_RELEASED,
                Some(guard.txn_id),
                serde_json::json!({"resourceId": guard.resource_id, "lockId": guard.lock_id}),
            ))
            .await;
        self.wake_waiters(&guard.resource_id);
        Ok(())
    }

    /// §4.1 `ReleaseTxn(txnId) -> count`: releases every lock `txn_id` holds,
    /// across every resource, without the caller needing to know which
    /// resources it touched. Used on commit/abort/rollback so a
    /// transaction's locks never outlive it.
    pub async fn release_txn(&self, txn_id: TransactionId) -> Result<usize> {
        let locks = self.store.list_locks_by_holder(txn_id).await?;
        let mut resources: std::collections::HashSet<String> = std::collections::HashSet::new();
        let count = locks.len();
        for lock in &locks {
            self.store.remove_lock(&lock.resource_id, &lock.lock_id).await?;
            resources.insert(lock.resource_id.clone());
            self.events
                .publish(Event::new(
                    names::LOCK_RELEASED,
                    Some(txn_id),
                    serde_json::json!({"resourceId": lock.resource_id, "lockId": lock.lock_id}),
                ))
                .await;
        }
        for resource_id in &resources {
            self.wake_waiters(resource_id);
        }
        self.detector.remove_wait(txn_id);
        Ok(count)
    }

    /// §4.1 `Upgrade(lockId)`: promotes a held SHARED lock to EXCLUSIVE,
    /// failing if any other lock is held on the same resource (another
    /// reader, or a writer). Succeeds as a no-op if `guard` is already
    /// EXCLUSIVE.
    pub async fn upgrade(&self, guard: &LockGuard) -> Result<LockGuard> {
        if guard.mode == LockMode::Exclusive {
            return Ok(LockGuard {
                lock_id: guard.lock_id.clone(),
                resource_id: guard.resource_id.clone(),
                txn_id: guard.txn_id,
                mode: LockMode::Exclusive,
            });
        }

        let holders = self.live_holders(&guard.resource_id).await?;
        if holders.iter().any(|l| l.lock_id != guard.lock_id) {
            return Err(CoreError::new(
                crate::ErrorKind::TransactionLocked,
                format!("cannot upgrade lock {} on {}: other locks are held", guard.lock_id, guard.resource_id),
            ));
        }

        self.store.remove_lock(&guard.resource_id, &guard.lock_id).await?;
        let upgraded = Lock {
            lock_id: self.ids.new_lock_id(),
            resource_id: guard.resource_id.clone(),
            mode: LockMode::Exclusive,
            holder: guard.txn_id,
            acquired_at: Utc::now(),
            expires_at: Utc::now()
                + chrono::Duration::from_std(self.config.lock_expiration).unwrap_or(chrono::Duration::zero()),
        };
        self.store.put_lock(upgraded.clone()).await?;
        self.events
            .publish(Event::new(
                names::LOCK_UPGRADED,
                Some(guard.txn_id),
                serde_json::json!({
                    "resourceId": guard.resource_id,
                    "oldLockId": guard.lock_id,
                    "newLockId": upgraded.lock_id,
                }),
            ))
            .await;
        Ok(LockGuard {
            lock_id: upgraded.lock_id,
            resource_id: guard.resource_id.clone(),
            txn_id: guard.txn_id,
            mode: LockMode::Exclusive,
        })
    }

    /// §4.1 `ForceRelease(resourceType, id)`: administrative override that
    /// clears every lock on `resource_id` regardless of holder and wakes all
    /// waiters. Used to break a stuck resource out of band; callers should
    /// prefer `release`/`release_txn` in the normal path.
    pub async fn force_release(&self, resource_id: &str) -> Result<usize> {
        let locks = self.store.get_locks(resource_id).await?;
        let count = locks.len();
        for lock in &locks {
            self.store.remove_lock(resource_id, &lock.lock_id).await?;
            self.events
                .publish(Event::new(
                    names::LOCK_RELEASED,
                    Some(lock.holder),
                    serde_json::json!({"resourceId": resource_id, "lockId": lock.lock_id, "forced": true}),
                ))
                .await;
        }
        self.wake_waiters(resource_id);
        Ok(count)
    }

    /// Extends a held lock's expiry by `lock_expiration`, the renewal half
    /// of the expiry/renewal protocol (§5). Callers are expected to invoke
    /// this on an interval of roughly half `renewal_interval` while the
    /// lock is still needed.
    pub async fn renew(&self, guard: &LockGuard) -> Result<()> {
        let mut locks = self.store.get_locks(&guard.resource_id).await?;
        if let Some(lock) = locks.iter_mut().find(|l| l.lock_id == guard.lock_id) {
            lock.expires_at = Utc::now()
                + chrono::Duration::from_std(self.config.lock_expiration).unwrap_or(chrono::Duration::zero());
            self.store.put_lock(lock.clone()).await?;
            Ok(())
        } else {
            Err(CoreError::new(
                crate::ErrorKind::Internal,
                format!("lock {} on {} no longer held", guard.lock_id, guard.resource_id),
            ))
        }
    }

    async fn live_holders(&self, resource_id: &str) -> Result<Vec<Lock>> {
        let now = Utc::now();
        let all = self.store.get_locks(resource_id).await?;
        let mut live = Vec::new();
        for lock in all {
            if lock.expires_at <= now {
                self.store.remove_lock(resource_id, &lock.lock_id).await?;
                self.events
                    .publish(Event::new(
                        names::LOCK_EXPIRED,
                        Some(lock.holder),
                        serde_json::json!({"resourceId": resource_id, "lockId": lock.lock_id}),
                    ))
                    .await;
            } else {
                live.push(lock);
            }
        }
        Ok(live)
    }

    fn register_waiter(&self, resource_id: &str, txn_id: TransactionId, notify: Arc<Notify>) {
        self.waiters
            .lock()
            .entry(resource_id.to_string())
            .or_default()
            .push_back(Arc::new(Waiter { txn_id, notify }));
    }

    fn deregister_waiter(&self, resource_id: &str, txn_id: TransactionId) {
        if let Some(queue) = self.waiters.lock().get_mut(resource_id) {
            queue.retain(|w| w.txn_id != txn_id);
        }
    }

    fn wake_waiters(&self, resource_id: &str) {
        let mut waiters = self.waiters.lock();
        if let Some(queue) = waiters.get_mut(resource_id) {
            // Wake the whole FIFO queue: each waiter re-checks compatibility
            // itself on wakeup, so over-waking only costs a spurious retry.
            for waiter in queue.drain(..) {
                waiter.notify.notify_one();
            }
        }
    }
}
