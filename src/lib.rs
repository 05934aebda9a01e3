//! Core transaction orchestration engine for payment processing.
//!
//! Wires idempotency, per-record locking, retry/recovery and saga
//! compensation around a durable transaction state machine. See
//! `DESIGN.md` for how each module is grounded and `SPEC_FULL.md` for the
//! full requirements this crate implements.

pub mod clock;
pub mod common;
pub mod compensation;
pub mod dlq;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod locking;
pub mod provider;
pub mod reconciler;
pub mod recovery;
pub mod retry;
pub mod store;
pub mod transaction;

pub use error::{CoreError, ErrorKind, Result};

use std::time::Duration;

/// Root configuration, covering every policy knob named across §4/§5/§10.3.
#[derive(Debug, Clone)]
pub struct Config {
    pub locking: locking::LockingConfig,
    pub idempotency: idempotency::IdempotencyConfig,
    pub retry: retry::RetryPolicy,
    pub recovery: recovery::RecoveryConfig,
    /// How often the reconciler sweep runs in a hosted deployment.
    pub reconciliation_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            locking: locking::LockingConfig::default(),
            idempotency: idempotency::IdempotencyConfig::default(),
            retry: retry::RetryPolicy::default(),
            recovery: recovery::RecoveryConfig::default(),
            reconciliation_interval: Duration::from_secs(300),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_builds() {
        let config = Config::default();
        assert_eq!(config.retry.max_attempts, 3);
    }
}
