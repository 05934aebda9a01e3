//! RetryManager: backoff policy and the dispatch loop that drains due
//! entries (§4.6). Exponential backoff with jitter follows the same shape
//! the teacher uses for `TimeoutManager` deadlines, generalized with a
//! multiplicative jitter factor.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use crate::clock::Clock;
use crate::common::TransactionId;
use crate::error::CoreError;
use crate::events::{names, Event, EventBus};
use crate::store::model::{ErrorInfo, RetryEntry};
use crate::Result;

use super::queue::RetryQueue;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// Exponential backoff capped at `max_delay`, jittered by up to
    /// `jitter_factor` of the computed delay in either direction.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self.initial_delay.as_millis() as f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
        let capped = exp.min(self.max_delay.as_millis() as f64);
        let jitter_span = capped * self.jitter_factor;
        let jitter = rand::rng().random_range(-jitter_span..=jitter_span);
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

/// Result of evaluating whether a failed transaction should retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    Scheduled { attempt: u32, due_at: chrono::DateTime<Utc> },
    Exhausted { attempts: u32 },
}

pub struct RetryManager {
    queue: RetryQueue,
    events: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    policy: RetryPolicy,
}

impl RetryManager {
    pub fn new(queue: RetryQueue, events: Arc<EventBus>, clock: Arc<dyn Clock>, policy: RetryPolicy) -> Self {
        Self { queue, events, clock, policy }
    }

    pub fn is_retryable(&self, error: &CoreError, attempt: u32) -> bool {
        error.retryable() && attempt < self.policy.max_attempts
    }

    /// Schedules the next attempt, or reports the transaction has exhausted
    /// its retry budget.
    pub async fn schedule(&self, transaction_id: TransactionId, attempt: u32, last_error: &CoreError) -> Result<RetryDecision> {
        if attempt >= self.policy.max_attempts {
            self.events
                .publish(Event::new(
                    names::TRANSACTION_FAILED_AFTER_RETRY,
                    Some(transaction_id),
                    serde_json::json!({"attempts": attempt}),
                ))
                .await;
            return Ok(RetryDecision::Exhausted { attempts: attempt });
        }

        let delay = self.policy.backoff_for_attempt(attempt + 1);
        let due_at = chrono::DateTime::<Utc>::from(self.clock.now())
            + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

        self.queue
            .push(RetryEntry {
                transaction_id,
                due_at,
                attempt: attempt + 1,
                last_error: Some(ErrorInfo::from(last_error)),
            })
            .await?;

        self.events
            .publish(Event::new(
                names::TRANSACTION_RETRY_SCHEDULED,
                Some(transaction_id),
                serde_json::json!({"attempt": attempt + 1, "dueAt": due_at}),
            ))
            .await;

        Ok(RetryDecision::Scheduled { attempt: attempt + 1, due_at })
    }

    pub async fn cancel(&self, transaction_id: TransactionId) -> Result<()> {
        self.queue.cancel(transaction_id).await
    }

    /// Drains every entry due at or before now, invoking `handler` for each.
    /// `handler` returns `Ok(())` on success; on `Err`, the caller is
    /// expected to have already called `schedule` or moved the transaction
    /// to the dead letter queue before returning, so this loop never
    /// re-schedules on its own.
    pub async fn dispatch_due<F, Fut>(&self, handler: F) -> Result<usize>
    where
        F: Fn(TransactionId, u32) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let now = chrono::DateTime::<Utc>::from(self.clock.now());
        let due = self.queue.pop_due(now).await?;
        let count = due.len();
        for entry in due {
            self.events
                .publish(Event::new(
                    names::TRANSACTION_RETRY_STARTED,
                    Some(entry.transaction_id),
                    serde_json::json!({"attempt": entry.attempt}),
                ))
                .await;
            if handler(entry.transaction_id, entry.attempt).await.is_ok() {
                self.events
                    .publish(Event::new(
                        names::TRANSACTION_COMPLETED_AFTER_RETRY,
                        Some(entry.transaction_id),
                        serde_json::json!({"attempt": entry.attempt}),
                    ))
                    .await;
            }
        }
        Ok(count)
    }
}
