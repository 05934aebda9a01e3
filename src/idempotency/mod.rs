//! C5: IdempotencyManager (§4.2).
//!
//! Grounded on the Postgres idempotency store pattern in the pack's
//! settlement-engine example (`try_acquire` / `find_by_key` / `mark_completed`)
//! and the teacher's record-expiry convention in `transaction::timeout`
//! (`TimeoutEntry` deadline tracking), adapted to the five-case
//! check-and-lock contract §4.2 specifies.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::clock::Clock;
use crate::common::{ExternalRef, IdempotencyKey, TransactionId};
use crate::events::{names, Event, EventBus};
use crate::store::model::{IdempotencyRecord, IdempotencyStatus};
use crate::store::Store;
use crate::{CoreError, Result};

#[derive(Debug, Clone, Copy)]
pub struct IdempotencyConfig {
    /// How long a full record (terminal or not) is retained before the
    /// sweep reclaims it.
    pub record_expiration: Duration,
    /// How long a `Locked` record is honoured before a retry is allowed to
    /// steal it — guards against a crashed worker permanently wedging a key.
    pub stale_request_timeout: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            record_expiration: Duration::from_secs(24 * 3600),
            stale_request_timeout: Duration::from_secs(3600),
        }
    }
}

/// Outcome of `check_and_lock`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// No prior record, or the prior lock was stale and has been stolen:
    /// caller should proceed with `transaction_id`.
    Proceed { transaction_id: TransactionId },
    /// A terminal record already exists for this exact request body: caller
    /// should return the cached result without doing the work again.
    Replay {
        transaction_id: TransactionId,
        resource_ref: Option<ExternalRef>,
    },
}

pub struct IdempotencyManager {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    config: IdempotencyConfig,
}

impl IdempotencyManager {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>, clock: Arc<dyn Clock>, config: IdempotencyConfig) -> Self {
        Self { store, events, clock, config }
    }

    /// Implements the five-case contract from §4.2:
    /// 1. no record -> create + proceed
    /// 2. record locked, fresh -> duplicate in-flight request
    /// 3. record locked, stale -> steal the lock and proceed
    /// 4. record terminal, fingerprint matches -> replay cached result
    /// 5. record terminal, fingerprint differs -> reject as replay-with-divergent-body
    pub async fn check_and_lock(
        &self,
        key: &IdempotencyKey,
        fingerprint: &str,
        new_transaction_id: TransactionId,
    ) -> Result<CheckOutcome> {
        Self::validate_key(key)?;
        match self.store.get_idempotency_record(key).await? {
            None => {
                self.create_locked(key, fingerprint, new_transaction_id).await?;
                Ok(CheckOutcome::Proceed { transaction_id: new_transaction_id })
            }
            Some(existing) if existing.status == IdempotencyStatus::Locked => {
                let now = chrono::DateTime::<Utc>::from(self.clock.now());
                let stale = existing.created_at
                    + chrono::Duration::from_std(self.config.stale_request_timeout).unwrap_or(chrono::Duration::zero())
                    <= now;
                if stale {
                    self.events
                        .publish(Event::new(
                            names::IDEMPOTENCY_LOCK_RELEASED,
                            Some(existing.transaction_id),
                            serde_json::json!({"key": key, "reason": "stale"}),
                        ))
                        .await;
                    self.create_locked(key, fingerprint, new_transaction_id).await?;
                    Ok(CheckOutcome::Proceed { transaction_id: new_transaction_id })
                } else {
                    self.events
                        .publish(Event::new(
                            names::IDEMPOTENCY_DUPLICATE_REQUEST,
                            Some(existing.transaction_id),
                            serde_json::json!({"key": key}),
                        ))
                        .await;
                    Err(CoreError::duplicate_request(key))
                }
            }
            Some(existing) if existing.fingerprint == fingerprint => {
                self.events
                    .publish(Event::new(
                        names::IDEMPOTENCY_REPLAY_DETECTED,
                        Some(existing.transaction_id),
                        serde_json::json!({"key": key, "divergent": false}),
                    ))
                    .await;
                Ok(CheckOutcome::Replay {
                    transaction_id: existing.transaction_id,
                    resource_ref: existing.resource_ref,
                })
            }
            Some(existing) => {
                self.events
                    .publish(Event::new(
                        names::IDEMPOTENCY_REPLAY_DETECTED,
                        Some(existing.transaction_id),
                        serde_json::json!({"key": key, "divergent": true}),
                    ))
                    .await;
                Err(CoreError::idempotency_replay(key))
            }
        }
    }

    /// §4.2 key validation: at least 8 characters, alphanumerics plus `-`
    /// and `_` only. Called at the top of `check_and_lock` so a malformed
    /// key never reaches the store.
    fn validate_key(key: &IdempotencyKey) -> Result<()> {
        if key.len() < 8 || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(CoreError::validation(format!(
                "idempotency key '{key}' must be at least 8 characters of alphanumerics, '-' or '_'"
            )));
        }
        Ok(())
    }

    /// Marks a locked record terminal, attaching the resource reference
    /// future replays should return.
    pub async fn complete(&self, key: &IdempotencyKey, resource_ref: Option<ExternalRef>) -> Result<()> {
        self.finish(key, IdempotencyStatus::Completed, resource_ref).await
    }

    pub async fn fail(&self, key: &IdempotencyKey) -> Result<()> {
        self.finish(key, IdempotencyStatus::Failed, None).await
    }

    /// Unlocks a key without associating a resource, for callers who decide
    /// the work never actually started (distinct from `fail`, which pins a
    /// terminal failure result for future replays to see).
    pub async fn release_lock(&self, key: &IdempotencyKey) -> Result<()> {
        self.store.delete_idempotency_record(key).await?;
        self.events
            .publish(Event::new(names::IDEMPOTENCY_LOCK_RELEASED, None, serde_json::json!({"key": key, "reason": "released"})))
            .await;
        Ok(())
    }

    async fn finish(&self, key: &IdempotencyKey, status: IdempotencyStatus, resource_ref: Option<ExternalRef>) -> Result<()> {
        let mut record = self
            .store
            .get_idempotency_record(key)
            .await?
            .ok_or_else(|| CoreError::new(crate::ErrorKind::Internal, format!("idempotency key '{key}' missing at completion")))?;
        record.status = status;
        record.resource_ref = resource_ref;
        self.store.put_idempotency_record(record).await
    }

    async fn create_locked(&self, key: &IdempotencyKey, fingerprint: &str, transaction_id: TransactionId) -> Result<()> {
        let now = chrono::DateTime::<Utc>::from(self.clock.now());
        let record = IdempotencyRecord {
            key: key.clone(),
            transaction_id,
            fingerprint: fingerprint.to_string(),
            status: IdempotencyStatus::Locked,
            resource_ref: None,
            created_at: now,
            expires_at: now
                + chrono::Duration::from_std(self.config.record_expiration).unwrap_or(chrono::Duration::zero()),
        };
        self.store.put_idempotency_record(record).await?;
        self.events
            .publish(Event::new(names::IDEMPOTENCY_KEY_CREATED, Some(transaction_id), serde_json::json!({"key": key})))
            .await;
        Ok(())
    }

    /// Background sweep: reclaims records past `record_expiration`. Intended
    /// to run roughly hourly (§4.2).
    pub async fn sweep_expired(&self) -> Result<usize> {
        let now = chrono::DateTime::<Utc>::from(self.clock.now());
        let expired = self.store.list_expired_idempotency_records(now).await?;
        let count = expired.len();
        for record in expired {
            self.store.delete_idempotency_record(&record.key).await?;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::events::NullSink;
    use crate::store::InMemoryStore;

    fn manager() -> IdempotencyManager {
        IdempotencyManager::new(
            Arc::new(InMemoryStore::new()),
            Arc::new(EventBus::new(Arc::new(NullSink))),
            Arc::new(SystemClock),
            IdempotencyConfig::default(),
        )
    }

    #[tokio::test]
    async fn first_request_proceeds() {
        let mgr = manager();
        let txn = uuid::Uuid::new_v4();
        let outcome = mgr.check_and_lock(&"key-0001".to_string(), "fp-a", txn).await.unwrap();
        assert_eq!(outcome, CheckOutcome::Proceed { transaction_id: txn });
    }

    #[tokio::test]
    async fn concurrent_duplicate_is_rejected() {
        let mgr = manager();
        let txn = uuid::Uuid::new_v4();
        mgr.check_and_lock(&"key-0002".to_string(), "fp-a", txn).await.unwrap();

        let err = mgr
            .check_and_lock(&"key-0002".to_string(), "fp-a", uuid::Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::DuplicateRequest);
    }

    #[tokio::test]
    async fn terminal_replay_with_same_fingerprint_returns_cached_result() {
        let mgr = manager();
        let txn = uuid::Uuid::new_v4();
        mgr.check_and_lock(&"key-0003".to_string(), "fp-a", txn).await.unwrap();
        mgr.complete(&"key-0003".to_string(), Some("charge_123".to_string())).await.unwrap();

        let outcome = mgr
            .check_and_lock(&"key-0003".to_string(), "fp-a", uuid::Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            CheckOutcome::Replay { transaction_id: txn, resource_ref: Some("charge_123".to_string()) }
        );
    }

    #[tokio::test]
    async fn terminal_replay_with_different_fingerprint_is_rejected() {
        let mgr = manager();
        let txn = uuid::Uuid::new_v4();
        mgr.check_and_lock(&"key-0004".to_string(), "fp-a", txn).await.unwrap();
        mgr.complete(&"key-0004".to_string(), None).await.unwrap();

        let err = mgr
            .check_and_lock(&"key-0004".to_string(), "fp-b", uuid::Uuid::new_v4())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::IdempotencyReplay);
    }

    #[tokio::test]
    async fn short_key_is_rejected() {
        let mgr = manager();
        let err = mgr.check_and_lock(&"short".to_string(), "fp-a", uuid::Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Validation);
    }

    #[tokio::test]
    async fn key_with_illegal_characters_is_rejected() {
        let mgr = manager();
        let err = mgr.check_and_lock(&"bad key!!".to_string(), "fp-a", uuid::Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::Validation);
    }
}
