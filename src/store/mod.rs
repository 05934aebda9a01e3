//! C3: Store — the durable-state port (§3 Data Model) and an in-memory
//! implementation used by every test in this crate.
//!
//! Every other component reaches persistent state only through this trait;
//! nothing downstream holds a raw `HashMap`. Mirrors the split the teacher
//! uses for its storage engine: a narrow trait describing the operations a
//! caller needs, with the concrete backend swappable behind `Arc<dyn Store>`.

pub mod model;

use async_trait::async_trait;

use crate::common::{IdempotencyKey, TransactionId};
use crate::Result;
use model::{CompensatingOperation, DeadLetterEntry, IdempotencyRecord, Lock, RetryEntry, Transaction, TransactionStatus};

/// Durable storage port. All methods are async so a real backend (database,
/// durable queue) can perform I/O without blocking a worker thread; the
/// in-memory implementation below never actually awaits anything but keeps
/// the same signatures so callers don't change when the backend does.
#[async_trait]
pub trait Store: Send + Sync {
    // --- Transaction ---
    async fn put_transaction(&self, txn: Transaction) -> Result<()>;
    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>>;
    /// Atomically swaps `status` only if the stored transaction's `version`
    /// still matches `expected_version`, returning the updated record.
    /// This is the compare-and-set primitive the state machine (§4.3) relies
    /// on to make concurrent status transitions safe without the caller
    /// holding the record lock across an I/O round trip.
    async fn compare_and_set_status(
        &self,
        id: TransactionId,
        expected_version: u64,
        new_status: TransactionStatus,
    ) -> Result<Transaction>;
    async fn list_transactions_by_status(&self, status: TransactionStatus) -> Result<Vec<Transaction>>;
    /// Backs §4.3 `List(customerId, filters)`: every transaction for a
    /// customer, newest first. Callers apply `filters` (status, type, date
    /// range) over the result themselves via `TransactionManager::list`.
    async fn list_transactions_by_customer(&self, customer_id: &str) -> Result<Vec<Transaction>>;

    // --- Idempotency ---
    async fn put_idempotency_record(&self, record: IdempotencyRecord) -> Result<()>;
    async fn get_idempotency_record(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>>;
    async fn delete_idempotency_record(&self, key: &IdempotencyKey) -> Result<()>;
    async fn list_expired_idempotency_records(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<IdempotencyRecord>>;

    // --- Locks ---
    async fn put_lock(&self, lock: Lock) -> Result<()>;
    async fn get_locks(&self, resource_id: &str) -> Result<Vec<Lock>>;
    async fn remove_lock(&self, resource_id: &str, lock_id: &str) -> Result<()>;
    /// Every lock held by `holder`, across every resource — backs §4.1
    /// `ReleaseTxn(txnId)`, which must release a transaction's locks
    /// without the caller enumerating which resources it touched.
    async fn list_locks_by_holder(&self, holder: TransactionId) -> Result<Vec<Lock>>;

    // --- Retry queue ---
    async fn put_retry_entry(&self, entry: RetryEntry) -> Result<()>;
    async fn remove_retry_entry(&self, transaction_id: TransactionId) -> Result<()>;
    async fn list_due_retry_entries(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<RetryEntry>>;

    // --- Dead letter queue ---
    async fn put_dead_letter(&self, entry: DeadLetterEntry) -> Result<()>;
    async fn get_dead_letter(&self, transaction_id: TransactionId) -> Result<Option<DeadLetterEntry>>;
    async fn remove_dead_letter(&self, transaction_id: TransactionId) -> Result<()>;
    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>>;

    // --- Compensation ledger ---
    async fn put_compensating_operation(&self, op: CompensatingOperation) -> Result<()>;
    async fn list_compensating_operations(&self, transaction_id: TransactionId) -> Result<Vec<CompensatingOperation>>;
}

/// In-memory `Store`, the test double used throughout this crate's test
/// suite and by `tests/`. Not durable across process restarts by design.
#[derive(Default)]
pub struct InMemoryStore {
    transactions: parking_lot::RwLock<std::collections::HashMap<TransactionId, Transaction>>,
    idempotency: parking_lot::RwLock<std::collections::HashMap<IdempotencyKey, IdempotencyRecord>>,
    locks: parking_lot::RwLock<std::collections::HashMap<String, Vec<Lock>>>,
    retry_entries: parking_lot::RwLock<std::collections::HashMap<TransactionId, RetryEntry>>,
    dead_letters: parking_lot::RwLock<std::collections::HashMap<TransactionId, DeadLetterEntry>>,
    compensations: parking_lot::RwLock<std::collections::HashMap<TransactionId, Vec<CompensatingOperation>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn put_transaction(&self, txn: Transaction) -> Result<()> {
        self.transactions.write().insert(txn.id, txn);
        Ok(())
    }

    async fn get_transaction(&self, id: TransactionId) -> Result<Option<Transaction>> {
        Ok(self.transactions.read().get(&id).cloned())
    }

    async fn compare_and_set_status(
        &self,
        id: TransactionId,
        expected_version: u64,
        new_status: TransactionStatus,
    ) -> Result<Transaction> {
        let mut guard = self.transactions.write();
        let txn = guard
            .get_mut(&id)
            .ok_or_else(|| crate::CoreError::transaction_not_found(id))?;
        if txn.version != expected_version {
            return Err(crate::CoreError::new(
                crate::ErrorKind::TransactionInvalidState,
                format!("transaction {id} version mismatch: expected {expected_version}, found {}", txn.version),
            ));
        }
        txn.status = new_status;
        txn.version += 1;
        let now = chrono::Utc::now();
        txn.updated_at = now;
        match new_status {
            TransactionStatus::Completed => txn.completed_at = Some(now),
            TransactionStatus::Failed | TransactionStatus::RolledBack => txn.failed_at = Some(now),
            _ => {}
        }
        Ok(txn.clone())
    }

    async fn list_transactions_by_status(&self, status: TransactionStatus) -> Result<Vec<Transaction>> {
        Ok(self
            .transactions
            .read()
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn list_transactions_by_customer(&self, customer_id: &str) -> Result<Vec<Transaction>> {
        let mut txns: Vec<Transaction> = self
            .transactions
            .read()
            .values()
            .filter(|t| t.customer_id == customer_id)
            .cloned()
            .collect();
        txns.sort_by_key(|t| std::cmp::Reverse(t.created_at));
        Ok(txns)
    }

    async fn put_idempotency_record(&self, record: IdempotencyRecord) -> Result<()> {
        self.idempotency.write().insert(record.key.clone(), record);
        Ok(())
    }

    async fn get_idempotency_record(&self, key: &IdempotencyKey) -> Result<Option<IdempotencyRecord>> {
        Ok(self.idempotency.read().get(key).cloned())
    }

    async fn delete_idempotency_record(&self, key: &IdempotencyKey) -> Result<()> {
        self.idempotency.write().remove(key);
        Ok(())
    }

    async fn list_expired_idempotency_records(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<IdempotencyRecord>> {
        Ok(self
            .idempotency
            .read()
            .values()
            .filter(|r| r.expires_at <= now)
            .cloned()
            .collect())
    }

    async fn put_lock(&self, lock: Lock) -> Result<()> {
        self.locks.write().entry(lock.resource_id.clone()).or_default().push(lock);
        Ok(())
    }

    async fn get_locks(&self, resource_id: &str) -> Result<Vec<Lock>> {
        Ok(self.locks.read().get(resource_id).cloned().unwrap_or_default())
    }

    async fn remove_lock(&self, resource_id: &str, lock_id: &str) -> Result<()> {
        if let Some(entries) = self.locks.write().get_mut(resource_id) {
            entries.retain(|l| l.lock_id != lock_id);
        }
        Ok(())
    }

    async fn list_locks_by_holder(&self, holder: TransactionId) -> Result<Vec<Lock>> {
        Ok(self
            .locks
            .read()
            .values()
            .flatten()
            .filter(|l| l.holder == holder)
            .cloned()
            .collect())
    }

    async fn put_retry_entry(&self, entry: RetryEntry) -> Result<()> {
        self.retry_entries.write().insert(entry.transaction_id, entry);
        Ok(())
    }

    async fn remove_retry_entry(&self, transaction_id: TransactionId) -> Result<()> {
        self.retry_entries.write().remove(&transaction_id);
        Ok(())
    }

    async fn list_due_retry_entries(&self, now: chrono::DateTime<chrono::Utc>) -> Result<Vec<RetryEntry>> {
        let mut due: Vec<RetryEntry> = self
            .retry_entries
            .read()
            .values()
            .filter(|e| e.due_at <= now)
            .cloned()
            .collect();
        due.sort_by(|a, b| a.due_at.cmp(&b.due_at).then(a.transaction_id.cmp(&b.transaction_id)));
        Ok(due)
    }

    async fn put_dead_letter(&self, entry: DeadLetterEntry) -> Result<()> {
        self.dead_letters.write().insert(entry.transaction_id, entry);
        Ok(())
    }

    async fn get_dead_letter(&self, transaction_id: TransactionId) -> Result<Option<DeadLetterEntry>> {
        Ok(self.dead_letters.read().get(&transaction_id).cloned())
    }

    async fn remove_dead_letter(&self, transaction_id: TransactionId) -> Result<()> {
        self.dead_letters.write().remove(&transaction_id);
        Ok(())
    }

    async fn list_dead_letters(&self) -> Result<Vec<DeadLetterEntry>> {
        Ok(self.dead_letters.read().values().cloned().collect())
    }

    async fn put_compensating_operation(&self, op: CompensatingOperation) -> Result<()> {
        self.compensations.write().entry(op.transaction_id).or_default().push(op);
        Ok(())
    }

    async fn list_compensating_operations(&self, transaction_id: TransactionId) -> Result<Vec<CompensatingOperation>> {
        Ok(self.compensations.read().get(&transaction_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::*;

    fn sample_txn() -> Transaction {
        Transaction {
            id: uuid::Uuid::new_v4(),
            transaction_type: TransactionType::Payment,
            status: TransactionStatus::Pending,
            amount: rust_decimal::Decimal::new(1099, 2),
            currency: "USD".to_string(),
            customer_id: "cust_1".to_string(),
            payment_method_ref: "pm_1".to_string(),
            idempotency_key: None,
            external_ref: None,
            metadata: Default::default(),
            error: None,
            retry_count: 0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
            completed_at: None,
            failed_at: None,
            version: 0,
        }
    }

    #[tokio::test]
    async fn compare_and_set_rejects_stale_version() {
        let store = InMemoryStore::new();
        let txn = sample_txn();
        let id = txn.id;
        store.put_transaction(txn).await.unwrap();

        let updated = store
            .compare_and_set_status(id, 0, TransactionStatus::Processing)
            .await
            .unwrap();
        assert_eq!(updated.version, 1);

        let err = store
            .compare_and_set_status(id, 0, TransactionStatus::Completed)
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::TransactionInvalidState);
    }

    #[tokio::test]
    async fn due_retry_entries_are_sorted() {
        let store = InMemoryStore::new();
        let now = chrono::Utc::now();
        let later_id = uuid::Uuid::new_v4();
        let earlier_id = uuid::Uuid::new_v4();
        store
            .put_retry_entry(RetryEntry {
                transaction_id: later_id,
                due_at: now,
                attempt: 1,
                last_error: None,
            })
            .await
            .unwrap();
        store
            .put_retry_entry(RetryEntry {
                transaction_id: earlier_id,
                due_at: now - chrono::Duration::seconds(5),
                attempt: 1,
                last_error: None,
            })
            .await
            .unwrap();

        let due = store.list_due_retry_entries(now).await.unwrap();
        assert_eq!(due[0].transaction_id, earlier_id);
        assert_eq!(due[1].transaction_id, later_id);
    }
}
