//! C9: RecoveryManager (§4.4 unknown-outcome recovery).
//!
//! Generalizes the teacher's `Recoverable` trait (`common::mod`) into a
//! pluggable strategy registry: each `RecoveryStrategy` claims the error
//! kinds it knows how to resolve by querying the provider for the true
//! outcome, with a general fallback strategy tried last.

mod strategies;

pub use strategies::{GeneralRecovery, NetworkRecovery, TimeoutRecovery};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::common::{ExternalRef, TransactionId};
use crate::error::CoreError;
use crate::events::{names, Event, EventBus};
use crate::provider::ProviderPort;
use crate::{ErrorKind, Result};

/// What a strategy learned when it queried the provider for ground truth.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryOutcome {
    Completed { external_ref: ExternalRef },
    Failed,
    StillUnknown,
}

/// Everything a strategy needs to resolve one transaction's true outcome.
/// `started_at` is when the transaction entered the state that triggered
/// recovery — `TimeoutRecovery` uses it to bound its settlement wait against
/// `RecoveryConfig::max_wait_time`.
pub struct RecoveryContext {
    pub transaction_id: TransactionId,
    pub external_ref: Option<ExternalRef>,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
}

/// A pluggable recovery strategy (§4.4). `can_handle` lets the manager route
/// by error kind; `is_general` marks fallback strategies that are only
/// tried once no specific strategy claims the error. `max_wait_time` is
/// `RecoveryConfig::max_wait_time`, passed through so a strategy can bound
/// how long it waits for late settlement.
#[async_trait]
pub trait RecoveryStrategy: Send + Sync {
    fn name(&self) -> &'static str;
    fn can_handle(&self, error_kind: ErrorKind) -> bool;
    fn is_general(&self) -> bool {
        false
    }
    async fn execute(&self, ctx: &RecoveryContext, provider: &dyn ProviderPort, max_wait_time: Duration) -> Result<RecoveryOutcome>;
}

#[derive(Debug, Clone, Copy)]
pub struct RecoveryConfig {
    pub max_attempts: u32,
    pub max_wait_time: Duration,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self { max_attempts: 5, max_wait_time: Duration::from_secs(60) }
    }
}

pub struct RecoveryManager {
    strategies: Vec<Arc<dyn RecoveryStrategy>>,
    provider: Arc<dyn ProviderPort>,
    events: Arc<EventBus>,
    config: RecoveryConfig,
}

impl RecoveryManager {
    pub fn new(provider: Arc<dyn ProviderPort>, events: Arc<EventBus>, config: RecoveryConfig) -> Self {
        Self {
            strategies: vec![Arc::new(NetworkRecovery), Arc::new(TimeoutRecovery), Arc::new(GeneralRecovery)],
            provider,
            events,
            config,
        }
    }

    pub fn with_strategies(mut self, strategies: Vec<Arc<dyn RecoveryStrategy>>) -> Self {
        self.strategies = strategies;
        self
    }

    /// Dispatches to the first specific strategy that claims `error_kind`,
    /// falling back to a general strategy if none does. Bounded by
    /// `RecoveryConfig::max_attempts`.
    pub async fn run(&self, ctx: RecoveryContext, error_kind: ErrorKind) -> Result<RecoveryOutcome> {
        if ctx.attempt >= self.config.max_attempts {
            return Err(CoreError::new(
                ErrorKind::RecoveryLimitExceeded,
                format!("transaction {} exceeded {} recovery attempts", ctx.transaction_id, self.config.max_attempts),
            ));
        }

        self.events
            .publish(Event::new(
                names::TRANSACTION_RECOVERY_STARTED,
                Some(ctx.transaction_id),
                serde_json::json!({"attempt": ctx.attempt}),
            ))
            .await;

        let strategy = self
            .strategies
            .iter()
            .find(|s| !s.is_general() && s.can_handle(error_kind))
            .or_else(|| self.strategies.iter().find(|s| s.is_general()))
            .ok_or_else(|| CoreError::internal("no recovery strategy available"))?;

        let outcome = strategy.execute(&ctx, self.provider.as_ref(), self.config.max_wait_time).await?;

        self.events
            .publish(Event::new(
                names::TRANSACTION_RECOVERY_COMPLETED,
                Some(ctx.transaction_id),
                serde_json::json!({"strategy": strategy.name(), "outcome": format!("{outcome:?}")}),
            ))
            .await;

        Ok(outcome)
    }
}
