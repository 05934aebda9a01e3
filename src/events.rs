//! C2: EventBus — in-process pub/sub with a durable event log sink.
//!
//! Events are emitted *after* the persisting state write commits (§5
//! ordering guarantee P7), never before. The bus itself does not enforce
//! that ordering — callers are responsible for emitting post-commit — but it
//! does guarantee subscribers observe events in the order they were
//! published and that every event reaches the durable sink before
//! `publish` returns, so a crash after `publish` never silently drops an
//! event a subscriber already reacted to.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::common::TransactionId;

/// Event names from §6. Kept as a string newtype (not an enum) because the
/// contract is "names and payload keys", and new event names are additive —
/// an enum would force a breaking change on every addition the way the
/// teacher's `Value::Text` catch-all avoids for untyped data.
pub type EventName = &'static str;

pub mod names {
    pub const TRANSACTION_CREATED: &str = "transaction.created";
    pub const TRANSACTION_STATUS_CHANGED: &str = "transaction.status_changed";
    pub const TRANSACTION_RETRY_SCHEDULED: &str = "transaction.retry_scheduled";
    pub const TRANSACTION_RETRY_STARTED: &str = "transaction.retry_started";
    pub const TRANSACTION_COMPLETED_AFTER_RETRY: &str = "transaction.completed_after_retry";
    pub const TRANSACTION_FAILED_AFTER_RETRY: &str = "transaction.failed_after_retry";
    pub const TRANSACTION_RECOVERY_STARTED: &str = "transaction.recovery_started";
    pub const TRANSACTION_RECOVERY_COMPLETED: &str = "transaction.recovery_completed";
    pub const TRANSACTION_MOVED_TO_DLQ: &str = "transaction.moved_to_dlq";
    pub const TRANSACTION_REPROCESSING: &str = "transaction.reprocessing";
    pub const TRANSACTION_COMPENSATED: &str = "transaction.compensated";
    pub const TRANSACTION_COMPENSATION_PARTIAL: &str = "transaction.compensation_partial";
    pub const TRANSACTION_COMPENSATION_FAILED: &str = "transaction.compensation_failed";
    pub const IDEMPOTENCY_DUPLICATE_REQUEST: &str = "idempotency.duplicate_request";
    pub const IDEMPOTENCY_REPLAY_DETECTED: &str = "idempotency.replay_detected";
    pub const IDEMPOTENCY_KEY_CREATED: &str = "idempotency.key_created";
    pub const IDEMPOTENCY_LOCK_RELEASED: &str = "idempotency.lock_released";
    pub const LOCK_ACQUIRED: &str = "lock.acquired";
    pub const LOCK_RELEASED: &str = "lock.released";
    pub const LOCK_EXPIRED: &str = "lock.expired";
    pub const LOCK_UPGRADED: &str = "lock.upgraded";
}

/// An event published on the bus. `payload` carries the event-specific keys
/// named in §6; `transaction_id` and `timestamp` are always present per the
/// contract ("every payload carries transactionId ... and an ISO-8601
/// timestamp").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub name: String,
    pub transaction_id: Option<TransactionId>,
    pub timestamp: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl Event {
    pub fn new(name: EventName, transaction_id: Option<TransactionId>, payload: serde_json::Value) -> Self {
        Self {
            name: name.to_string(),
            transaction_id,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// Durable sink for events, the "durable event log sink" mentioned in §2.
/// Production implementations persist to an append-only log; `NullSink`
/// and `InMemorySink` below are for tests.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn append(&self, event: &Event);
}

/// Sink that drops everything — used when durability isn't needed (tests).
#[derive(Debug, Default)]
pub struct NullSink;

#[async_trait::async_trait]
impl EventSink for NullSink {
    async fn append(&self, _event: &Event) {}
}

/// In-memory sink retaining every event, for assertions in tests.
#[derive(Default)]
pub struct InMemorySink {
    events: parking_lot::Mutex<Vec<Event>>,
}

impl InMemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn events_named(&self, name: &str) -> Vec<Event> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.name == name)
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl EventSink for InMemorySink {
    async fn append(&self, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

/// In-process pub/sub bus. Subscribers receive a clone of every event;
/// publishing never blocks on subscribers falling behind (broadcast lag
/// drops are logged, never propagated as an error — losing an observability
/// event must never fail a payment operation).
pub struct EventBus {
    sender: broadcast::Sender<Event>,
    sink: Arc<dyn EventSink>,
}

impl EventBus {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self { sender, sink }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Publishes an event: appends to the durable sink, then fans out to
    /// subscribers. Callers must only call this after the corresponding
    /// Store mutation has committed (§5, P7).
    pub async fn publish(&self, event: Event) {
        self.sink.append(&event).await;
        if self.sender.send(event.clone()).is_err() {
            tracing::trace!(event = %event.name, "event published with no subscribers");
        }
    }
}

impl crate::common::Component for EventBus {
    fn name(&self) -> &'static str {
        "event_bus"
    }
}
