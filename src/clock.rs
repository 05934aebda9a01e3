//! C1: Clock & Id.
//!
//! A thin seam over wall-clock time and identifier generation so tests can
//! run deterministically (mirrors the teacher's use of `SystemTime` deadlines
//! in `transaction/timeout.rs`, generalized behind a trait so recovery/retry
//! timing logic is testable without real sleeps).

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::common::TransactionId;

/// Monotonic-enough clock abstraction. Implementations must be safe to call
/// concurrently from any number of threads.
pub trait Clock: Send + Sync {
    /// Current wall-clock time.
    fn now(&self) -> SystemTime;
}

/// Real wall-clock implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that can be advanced manually, for deterministic tests of
/// expiry/backoff/retry-due-at logic.
pub struct FixedClock {
    millis_since_epoch: AtomicI64,
}

impl FixedClock {
    pub fn new(at: SystemTime) -> Self {
        let millis = at
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Self {
            millis_since_epoch: AtomicI64::new(millis),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis_since_epoch
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> SystemTime {
        let millis = self.millis_since_epoch.load(Ordering::SeqCst);
        UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
    }
}

/// Generates opaque 128-bit transaction ids and other identifiers.
pub trait IdGenerator: Send + Sync {
    fn new_transaction_id(&self) -> TransactionId;
    fn new_lock_id(&self) -> String;
    fn new_operation_id(&self) -> String;
}

/// UUIDv4-backed id generator, used in production.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidGenerator;

impl IdGenerator for UuidGenerator {
    fn new_transaction_id(&self) -> TransactionId {
        uuid::Uuid::new_v4()
    }

    fn new_lock_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }

    fn new_operation_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_advances() {
        let start = UNIX_EPOCH + Duration::from_secs(1_000);
        let clock = FixedClock::new(start);
        assert_eq!(clock.now(), start);
        clock.advance(Duration::from_secs(30));
        assert_eq!(clock.now(), start + Duration::from_secs(30));
    }

    #[test]
    fn uuid_generator_produces_distinct_ids() {
        let gen = UuidGenerator;
        assert_ne!(gen.new_transaction_id(), gen.new_transaction_id());
    }
}
