//! Durable retry queue, ordered by `(due_at, transaction_id)`. Backed
//! directly by `Store` rather than an in-process `BinaryHeap` so a restart
//! never loses a scheduled retry; `Store::list_due_retry_entries` already
//! returns entries sorted the way a heap's `pop` would.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::common::TransactionId;
use crate::store::model::RetryEntry;
use crate::store::Store;
use crate::Result;

pub struct RetryQueue {
    store: Arc<dyn Store>,
}

impl RetryQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn push(&self, entry: RetryEntry) -> Result<()> {
        self.store.put_retry_entry(entry).await
    }

    pub async fn cancel(&self, transaction_id: TransactionId) -> Result<()> {
        self.store.remove_retry_entry(transaction_id).await
    }

    /// Pops every entry due at or before `now`, in `(due_at, id)` order.
    /// Callers own rescheduling or cancelling each popped entry.
    pub async fn pop_due(&self, now: DateTime<Utc>) -> Result<Vec<RetryEntry>> {
        let due = self.store.list_due_retry_entries(now).await?;
        for entry in &due {
            self.store.remove_retry_entry(entry.transaction_id).await?;
        }
        Ok(due)
    }
}
