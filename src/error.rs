//! Crate-wide error type.
//!
//! The taxonomy follows §7 of the specification: every error crossing a
//! component boundary carries a `kind`, a message, optional context, and
//! (optionally) the error that caused it. Retry/recovery decisions read only
//! `kind`'s `retryable()`/`recoverable()` — never a string match on the
//! message.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Error kind taxonomy (§7). Each variant has a fixed `retryable`/
/// `recoverable` classification; `CoreError::retryable`/`recoverable` read
/// these unless overridden by an explicit flag on the error value (used by
/// `ProviderError` so provider adapters can mark an error retryable even
/// when the generic kind would not be).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    DuplicateRequest,
    IdempotencyReplay,
    TransactionNotFound,
    TransactionInvalidState,
    TransactionLocked,
    LockTimeout,
    DeadlockDetected,
    ProviderCommunication,
    ProviderDecline,
    Timeout,
    RetryLimitExceeded,
    RecoveryLimitExceeded,
    Internal,
}

impl ErrorKind {
    /// Default retryability per §7's table.
    pub fn default_retryable(self) -> bool {
        matches!(
            self,
            ErrorKind::TransactionLocked
                | ErrorKind::LockTimeout
                | ErrorKind::DeadlockDetected
                | ErrorKind::ProviderCommunication
                | ErrorKind::Timeout
        )
    }

    /// Default recoverability per §7's table (errors whose true outcome is
    /// unknown and must be resolved by a `RecoveryStrategy`).
    pub fn default_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::TransactionLocked
                | ErrorKind::LockTimeout
                | ErrorKind::DeadlockDetected
                | ErrorKind::ProviderCommunication
                | ErrorKind::Timeout
        )
    }

    /// HTTP-shaped status an outer transport layer would surface; carried
    /// here only as metadata, never used for control flow inside the core.
    pub fn http_status(self) -> u16 {
        match self {
            ErrorKind::Validation => 400,
            ErrorKind::DuplicateRequest => 409,
            ErrorKind::IdempotencyReplay => 409,
            ErrorKind::TransactionNotFound => 404,
            ErrorKind::TransactionInvalidState => 409,
            ErrorKind::TransactionLocked => 409,
            ErrorKind::LockTimeout => 503,
            ErrorKind::DeadlockDetected => 409,
            ErrorKind::ProviderCommunication => 502,
            ErrorKind::ProviderDecline => 402,
            ErrorKind::Timeout => 504,
            ErrorKind::RetryLimitExceeded => 500,
            ErrorKind::RecoveryLimitExceeded => 500,
            ErrorKind::Internal => 500,
        }
    }
}

/// Crate-wide error. Every variant crossing a component boundary is wrapped
/// in one of these, preserving the originating error via `source`.
#[derive(Debug, Error)]
#[error("{kind:?}: {message}{}", self.context_suffix())]
pub struct CoreError {
    pub kind: ErrorKind,
    pub message: String,
    pub context: Option<String>,
    pub retryable_override: Option<bool>,
    #[source]
    pub source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl CoreError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            context: None,
            retryable_override: None,
            source: None,
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub fn retryable(&self) -> bool {
        self.retryable_override.unwrap_or(self.kind.default_retryable())
    }

    pub fn recoverable(&self) -> bool {
        self.kind.default_recoverable()
    }

    fn context_suffix(&self) -> String {
        match &self.context {
            Some(c) => format!(" ({c})"),
            None => String::new(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn duplicate_request(key: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::DuplicateRequest,
            format!("request with idempotency key '{key}' is already in progress"),
        )
    }

    pub fn idempotency_replay(key: impl std::fmt::Display) -> Self {
        Self::new(
            ErrorKind::IdempotencyReplay,
            format!("idempotency key '{key}' reused with a different request body"),
        )
    }

    pub fn transaction_not_found(id: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::TransactionNotFound, format!("transaction {id} not found"))
    }

    pub fn invalid_state(id: impl std::fmt::Display, from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        Self::new(
            ErrorKind::TransactionInvalidState,
            format!("transaction {id} cannot transition from {from:?} to {to:?}"),
        )
    }

    pub fn lock_timeout(resource: impl std::fmt::Display) -> Self {
        Self::new(ErrorKind::LockTimeout, format!("timed out waiting for lock on '{resource}'"))
    }

    pub fn deadlock(cycle: impl std::fmt::Debug) -> Self {
        Self::new(ErrorKind::DeadlockDetected, format!("deadlock detected: cycle {cycle:?}"))
    }

    pub fn provider_communication(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProviderCommunication, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::new(ErrorKind::Internal, format!("serialization error: {err}")).with_source(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_communication_is_retryable_and_recoverable() {
        let err = CoreError::provider_communication("connection reset");
        assert!(err.retryable());
        assert!(err.recoverable());
        assert_eq!(err.kind.http_status(), 502);
    }

    #[test]
    fn validation_is_neither() {
        let err = CoreError::validation("amount must be positive");
        assert!(!err.retryable());
        assert!(!err.recoverable());
    }

    #[test]
    fn retryable_override_wins() {
        let mut err = CoreError::validation("x");
        err.retryable_override = Some(true);
        assert!(err.retryable());
    }
}
