//! Built-in recovery strategies (§4.4).

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::provider::ProviderPort;
use crate::{ErrorKind, Result};

use super::{RecoveryContext, RecoveryOutcome, RecoveryStrategy};

/// Resolves transactions that failed with a communication error by asking
/// the provider for the transaction's true status.
pub struct NetworkRecovery;

#[async_trait]
impl RecoveryStrategy for NetworkRecovery {
    fn name(&self) -> &'static str {
        "network_recovery"
    }

    fn can_handle(&self, error_kind: ErrorKind) -> bool {
        error_kind == ErrorKind::ProviderCommunication
    }

    async fn execute(&self, ctx: &RecoveryContext, provider: &dyn ProviderPort, _max_wait_time: Duration) -> Result<RecoveryOutcome> {
        resolve_via_status(ctx, provider).await
    }
}

/// Resolves transactions that failed with a timeout. Unlike `NetworkRecovery`,
/// the request may simply be slow rather than lost: this strategy first waits
/// `min(3s, max_wait_time - elapsed)` for the provider to settle before
/// querying, and declares abandonment (resolves as `Failed`) once
/// `max_wait_time` has already elapsed since the transaction entered recovery.
pub struct TimeoutRecovery;

const SETTLEMENT_WAIT_CAP: Duration = Duration::from_secs(3);

#[async_trait]
impl RecoveryStrategy for TimeoutRecovery {
    fn name(&self) -> &'static str {
        "timeout_recovery"
    }

    fn can_handle(&self, error_kind: ErrorKind) -> bool {
        error_kind == ErrorKind::Timeout
    }

    async fn execute(&self, ctx: &RecoveryContext, provider: &dyn ProviderPort, max_wait_time: Duration) -> Result<RecoveryOutcome> {
        let elapsed = (Utc::now() - ctx.started_at).to_std().unwrap_or(Duration::ZERO);
        if elapsed >= max_wait_time {
            return Ok(RecoveryOutcome::Failed);
        }
        let wait = SETTLEMENT_WAIT_CAP.min(max_wait_time - elapsed);
        tokio::time::sleep(wait).await;
        resolve_via_status(ctx, provider).await
    }
}

async fn resolve_via_status(ctx: &RecoveryContext, provider: &dyn ProviderPort) -> Result<RecoveryOutcome> {
    let Some(external_ref) = ctx.external_ref.clone() else {
        return Ok(RecoveryOutcome::StillUnknown);
    };
    let status = provider.get_transaction_status(&external_ref).await?;
    if status.is_success() {
        Ok(RecoveryOutcome::Completed { external_ref })
    } else if status.is_failure() {
        Ok(RecoveryOutcome::Failed)
    } else {
        Ok(RecoveryOutcome::StillUnknown)
    }
}

/// Fallback strategy tried when no specific strategy claims the error kind.
/// Defers the decision rather than guessing, leaving the transaction to the
/// retry/DLQ path.
pub struct GeneralRecovery;

#[async_trait]
impl RecoveryStrategy for GeneralRecovery {
    fn name(&self) -> &'static str {
        "general_recovery"
    }

    fn can_handle(&self, _error_kind: ErrorKind) -> bool {
        true
    }

    fn is_general(&self) -> bool {
        true
    }

    async fn execute(&self, _ctx: &RecoveryContext, _provider: &dyn ProviderPort, _max_wait_time: Duration) -> Result<RecoveryOutcome> {
        Ok(RecoveryOutcome::StillUnknown)
    }
}
