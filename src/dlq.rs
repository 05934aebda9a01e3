//! C7: DeadLetterQueue (§4.5). A durable bin for transactions that
//! exhausted retries or recovery, keyed by transaction id, with an explicit
//! reprocess path back into the retry queue.

use std::sync::Arc;

use chrono::Utc;

use crate::common::TransactionId;
use crate::events::{names, Event, EventBus};
use crate::store::model::DeadLetterEntry;
use crate::store::Store;
use crate::{CoreError, Result};

pub struct DeadLetterQueue {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>) -> Self {
        Self { store, events }
    }

    pub async fn enqueue(&self, transaction_id: TransactionId, reason: impl Into<String>, attempts: u32, payload: serde_json::Value) -> Result<()> {
        let entry = DeadLetterEntry {
            transaction_id,
            reason: reason.into(),
            attempts,
            payload,
            moved_at: Utc::now(),
        };
        self.store.put_dead_letter(entry).await?;
        self.events
            .publish(Event::new(
                names::TRANSACTION_MOVED_TO_DLQ,
                Some(transaction_id),
                serde_json::json!({"attempts": attempts}),
            ))
            .await;
        Ok(())
    }

    pub async fn get(&self, transaction_id: TransactionId) -> Result<Option<DeadLetterEntry>> {
        self.store.get_dead_letter(transaction_id).await
    }

    pub async fn list(&self) -> Result<Vec<DeadLetterEntry>> {
        self.store.list_dead_letters().await
    }

    /// Removes an entry from the DLQ so it can be retried, emitting
    /// `transaction.reprocessing`. Callers re-drive the transaction through
    /// the normal retry/recovery path after this returns.
    pub async fn reprocess(&self, transaction_id: TransactionId) -> Result<DeadLetterEntry> {
        let entry = self
            .store
            .get_dead_letter(transaction_id)
            .await?
            .ok_or_else(|| CoreError::transaction_not_found(transaction_id))?;
        self.store.remove_dead_letter(transaction_id).await?;
        self.events
            .publish(Event::new(names::TRANSACTION_REPROCESSING, Some(transaction_id), serde_json::json!({})))
            .await;
        Ok(entry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullSink;
    use crate::store::InMemoryStore;

    #[tokio::test]
    async fn enqueue_then_reprocess_round_trips() {
        let dlq = DeadLetterQueue::new(Arc::new(InMemoryStore::new()), Arc::new(EventBus::new(Arc::new(NullSink))));
        let txn = uuid::Uuid::new_v4();
        dlq.enqueue(txn, "retries exhausted", 3, serde_json::json!({"amount": 100})).await.unwrap();

        assert!(dlq.get(txn).await.unwrap().is_some());
        let entry = dlq.reprocess(txn).await.unwrap();
        assert_eq!(entry.attempts, 3);
        assert!(dlq.get(txn).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reprocess_unknown_errors() {
        let dlq = DeadLetterQueue::new(Arc::new(InMemoryStore::new()), Arc::new(EventBus::new(Arc::new(NullSink))));
        let err = dlq.reprocess(uuid::Uuid::new_v4()).await.unwrap_err();
        assert_eq!(err.kind, crate::ErrorKind::TransactionNotFound);
    }
}
