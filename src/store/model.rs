//! Data model (§3): the record shapes every component reads and writes
//! through the `Store` port. These are plain serializable structs, not
//! behaviour — the state machine, locking and retry logic live in their own
//! modules and operate on these types via `Store`.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::common::{ExternalRef, IdempotencyKey, OpaqueMetadata, TransactionId};
use crate::error::ErrorKind;

/// Broad category of payment operation a transaction represents (§3). The
/// core does not special-case behaviour per type beyond what §4 describes;
/// new variants are additive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionType {
    Payment,
    Refund,
    Chargeback,
}

/// Transaction lifecycle state (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    RolledBack,
    RecoveryPending,
    RecoveryInProgress,
}

impl TransactionStatus {
    /// Valid forward transitions per §4.3's state machine. Used by
    /// `TransactionManager` to reject illegal transitions before ever
    /// touching the store.
    ///
    /// `RecoveryPending -> Processing` is not in §4.3's summary table but is
    /// required by §4.4's retry dispatch loop ("Else set PROCESSING, invoke
    /// the provider-facing re-attempt") — the more operationally specific
    /// text wins; see DESIGN.md.
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Failed)
                | (Pending, RolledBack)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, RecoveryPending)
                | (Processing, RolledBack)
                | (RecoveryPending, RecoveryInProgress)
                | (RecoveryPending, Failed)
                | (RecoveryPending, Processing)
                | (RecoveryInProgress, Completed)
                | (RecoveryInProgress, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransactionStatus::Completed | TransactionStatus::Failed | TransactionStatus::RolledBack)
    }
}

/// Captured error context attached to a transaction on failure (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKindLabel,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub retryable: bool,
    pub recoverable: bool,
}

/// Serializable mirror of `ErrorKind` (the real enum isn't `Serialize`
/// because it's a pure in-process taxonomy; this is the wire/storage form).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKindLabel {
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

impl From<ErrorKindLabel> for ErrorKind {
    fn from(label: ErrorKindLabel) -> Self {
        match label {
            ErrorKindLabel::Validation => ErrorKind::Validation,
            ErrorKindLabel::DuplicateRequest => ErrorKind::DuplicateRequest,
            ErrorKindLabel::IdempotencyReplay => ErrorKind::IdempotencyReplay,
            ErrorKindLabel::TransactionNotFound => ErrorKind::TransactionNotFound,
            ErrorKindLabel::TransactionInvalidState => ErrorKind::TransactionInvalidState,
            ErrorKindLabel::TransactionLocked => ErrorKind::TransactionLocked,
            ErrorKindLabel::LockTimeout => ErrorKind::LockTimeout,
            ErrorKindLabel::DeadlockDetected => ErrorKind::DeadlockDetected,
            ErrorKindLabel::ProviderCommunication => ErrorKind::ProviderCommunication,
            ErrorKindLabel::ProviderDecline => ErrorKind::ProviderDecline,
            ErrorKindLabel::Timeout => ErrorKind::Timeout,
            ErrorKindLabel::RetryLimitExceeded => ErrorKind::RetryLimitExceeded,
            ErrorKindLabel::RecoveryLimitExceeded => ErrorKind::RecoveryLimitExceeded,
            ErrorKindLabel::Internal => ErrorKind::Internal,
        }
    }
}

impl From<ErrorKind> for ErrorKindLabel {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::Validation => ErrorKindLabel::Validation,
            ErrorKind::DuplicateRequest => ErrorKindLabel::DuplicateRequest,
            ErrorKind::IdempotencyReplay => ErrorKindLabel::IdempotencyReplay,
            ErrorKind::TransactionNotFound => ErrorKindLabel::TransactionNotFound,
            ErrorKind::TransactionInvalidState => ErrorKindLabel::TransactionInvalidState,
            ErrorKind::TransactionLocked => ErrorKindLabel::TransactionLocked,
            ErrorKind::LockTimeout => ErrorKindLabel::LockTimeout,
            ErrorKind::DeadlockDetected => ErrorKindLabel::DeadlockDetected,
            ErrorKind::ProviderCommunication => ErrorKindLabel::ProviderCommunication,
            ErrorKind::ProviderDecline => ErrorKindLabel::ProviderDecline,
            ErrorKind::Timeout => ErrorKindLabel::Timeout,
            ErrorKind::RetryLimitExceeded => ErrorKindLabel::RetryLimitExceeded,
            ErrorKind::RecoveryLimitExceeded => ErrorKindLabel::RecoveryLimitExceeded,
            ErrorKind::Internal => ErrorKindLabel::Internal,
        }
    }
}

impl From<&crate::CoreError> for ErrorInfo {
    fn from(err: &crate::CoreError) -> Self {
        ErrorInfo {
            kind: err.kind.into(),
            message: err.message.clone(),
            occurred_at: Utc::now(),
            retryable: err.retryable(),
            recoverable: err.recoverable(),
        }
    }
}

/// Durable transaction record (§3, §4.3). `amount`/`currency`/`customer_id`/
/// `payment_method_ref` are first-class typed columns, not metadata — §3
/// names them as fields with their own invariants (`amount > 0`;
/// `completed_at` set iff `Completed`; `failed_at` set iff `Failed` or
/// `RolledBack`), which an untyped `metadata` blob cannot enforce or query
/// on (e.g. `TransactionManager::list(customerId, ..)`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub transaction_type: TransactionType,
    pub status: TransactionStatus,
    pub amount: Decimal,
    pub currency: String,
    pub customer_id: String,
    pub payment_method_ref: String,
    pub idempotency_key: Option<IdempotencyKey>,
    pub external_ref: Option<ExternalRef>,
    pub metadata: OpaqueMetadata,
    pub error: Option<ErrorInfo>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    /// Optimistic concurrency token, bumped on every `compare_and_set_status`.
    pub version: u64,
}

/// Idempotency key record (§4.2).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdempotencyStatus {
    Locked,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub key: IdempotencyKey,
    pub transaction_id: TransactionId,
    pub fingerprint: String,
    pub status: IdempotencyStatus,
    pub resource_ref: Option<ExternalRef>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Lock mode, SHARED permits concurrent readers, EXCLUSIVE is exclusive
/// against every other mode including itself (§5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    pub fn compatible_with(self, other: LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

/// A granted lock record (§5). `lock_id` distinguishes separate grants to
/// the same holder/resource pair (e.g. shared re-entry).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lock {
    pub lock_id: String,
    pub resource_id: String,
    pub mode: LockMode,
    pub holder: TransactionId,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Entry in the retry queue (§4.6), ordered by `(due_at, transaction_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryEntry {
    pub transaction_id: TransactionId,
    pub due_at: DateTime<Utc>,
    pub attempt: u32,
    pub last_error: Option<ErrorInfo>,
}

/// Entry moved to the dead letter queue once retries are exhausted (§4.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub transaction_id: TransactionId,
    pub reason: String,
    pub attempts: u32,
    pub payload: serde_json::Value,
    pub moved_at: DateTime<Utc>,
}

/// Compensation status (§4.4 Saga model).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompensationStatus {
    Pending,
    Executing,
    Completed,
    Failed,
    Skipped,
}

/// A single compensating (inverse) operation registered against a
/// transaction. `depends_on` names other operation ids within the same
/// transaction that must compensate first (§4.4 reverse-dependency order).
/// `execution_order` is the forward-flow sequence number the operation was
/// registered at, `original_state` is the pre-operation snapshot a handler
/// may need to restore, and `retry_count`/`max_retries` bound the
/// exponential-backoff retry loop `CompensationLedger::execute_compensation`
/// runs before marking the operation `Failed` (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompensatingOperation {
    pub id: String,
    pub transaction_id: TransactionId,
    pub kind: String,
    pub execution_order: u32,
    pub depends_on: Vec<String>,
    pub status: CompensationStatus,
    pub params: serde_json::Value,
    pub original_state: Option<serde_json::Value>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
}
