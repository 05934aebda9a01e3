//! C10: CompensationLedger (§4.4 Saga compensation).
//!
//! Operations are registered with `depends_on` naming the operations that
//! executed *before* them in the forward flow. Compensation runs in reverse
//! execution order (last-executed, first-undone); if an operation's
//! compensation fails, everything it depended on is left un-compensated
//! (`Skipped`) rather than guessed at, since undoing an earlier effect once
//! a later one failed to undo is not safe in general.

mod handler;

pub use handler::{CompensationHandler, NoopHandler};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use crate::common::TransactionId;
use crate::events::{names, Event, EventBus};
use crate::store::model::{CompensatingOperation, CompensationStatus};
use crate::store::Store;
use crate::{CoreError, Result};

/// Default `maxRetries` for a registered operation when the caller doesn't
/// name one (§4.6's `Register` signature marks it optional).
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Backoff applied between compensation retry attempts, same exponential
/// shape as `retry::RetryPolicy` but kept local since a compensation retry
/// runs inline within `execute_compensation` rather than through the
/// durable retry queue.
fn backoff_for_attempt(attempt: u32) -> Duration {
    let base_ms = 200f64 * 2f64.powi(attempt.saturating_sub(1) as i32);
    let capped = base_ms.min(5_000.0);
    let jitter = rand::rng().random_range(0.0..capped * 0.1);
    Duration::from_millis((capped + jitter) as u64)
}

pub struct CompensationLedger {
    store: Arc<dyn Store>,
    events: Arc<EventBus>,
    handlers: HashMap<String, Arc<dyn CompensationHandler>>,
}

/// Summary of a compensation run, used by callers to decide the
/// transaction's final status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompensationReport {
    pub completed: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
}

impl CompensationReport {
    pub fn is_fully_compensated(&self) -> bool {
        self.skipped.is_empty() && self.failed.is_empty()
    }
}

impl CompensationLedger {
    pub fn new(store: Arc<dyn Store>, events: Arc<EventBus>) -> Self {
        Self { store, events, handlers: HashMap::new() }
    }

    pub fn register_handler(&mut self, kind: impl Into<String>, handler: Arc<dyn CompensationHandler>) {
        self.handlers.insert(kind.into(), handler);
    }

    /// Registers a forward operation's inverse for possible later
    /// compensation. Called at the point the forward operation executes,
    /// not at rollback time. `original_state` is the pre-operation snapshot
    /// a handler can restore from; `max_retries` bounds the backoff retry
    /// loop `execute_compensation` runs for this operation (§4.6).
    #[allow(clippy::too_many_arguments)]
    pub async fn register(
        &self,
        transaction_id: TransactionId,
        id: impl Into<String>,
        kind: impl Into<String>,
        execution_order: u32,
        depends_on: Vec<String>,
        params: serde_json::Value,
        original_state: Option<serde_json::Value>,
        max_retries: u32,
    ) -> Result<()> {
        let op = CompensatingOperation {
            id: id.into(),
            transaction_id,
            kind: kind.into(),
            execution_order,
            depends_on,
            status: CompensationStatus::Pending,
            params,
            original_state,
            retry_count: 0,
            max_retries,
            created_at: Utc::now(),
        };
        self.store.put_compensating_operation(op).await
    }

    /// Executes every registered, not-yet-compensated operation for
    /// `transaction_id` in reverse dependency order.
    pub async fn execute_compensation(&self, transaction_id: TransactionId) -> Result<CompensationReport> {
        let ops = self.store.list_compensating_operations(transaction_id).await?;
        let order = reverse_dependency_order(&ops)?;

        let mut by_id: HashMap<String, CompensatingOperation> = ops.into_iter().map(|op| (op.id.clone(), op)).collect();
        let mut skip: HashSet<String> = HashSet::new();
        let mut report = CompensationReport { completed: vec![], skipped: vec![], failed: vec![] };

        for id in order {
            let Some(op) = by_id.get_mut(&id) else { continue };
            if op.status != CompensationStatus::Pending {
                continue;
            }

            if skip.contains(&id) {
                op.status = CompensationStatus::Skipped;
                report.skipped.push(id.clone());
                skip.extend(op.depends_on.iter().cloned());
                self.store.put_compensating_operation(op.clone()).await?;
                continue;
            }

            let handler = self.handlers.get(&op.kind).cloned();
            op.status = CompensationStatus::Executing;
            self.store.put_compensating_operation(op.clone()).await?;

            let mut outcome = match &handler {
                Some(h) => h.compensate(op).await,
                None => Err(CoreError::internal(format!("no compensation handler registered for kind '{}'", op.kind))),
            };

            // §4.6 step 3: on failure, retry with exponential backoff up to
            // `max_retries` before giving up on this operation.
            while outcome.is_err() && op.retry_count < op.max_retries {
                op.retry_count += 1;
                tokio::time::sleep(backoff_for_attempt(op.retry_count)).await;
                outcome = match &handler {
                    Some(h) => h.compensate(op).await,
                    None => Err(CoreError::internal(format!("no compensation handler registered for kind '{}'", op.kind))),
                };
            }

            match outcome {
                Ok(()) => {
                    op.status = CompensationStatus::Completed;
                    report.completed.push(id.clone());
                }
                Err(_) => {
                    op.status = CompensationStatus::Failed;
                    report.failed.push(id.clone());
                    skip.extend(op.depends_on.iter().cloned());
                }
            }
            self.store.put_compensating_operation(op.clone()).await?;
        }

        let event_name = if report.is_fully_compensated() {
            names::TRANSACTION_COMPENSATED
        } else if report.completed.is_empty() {
            names::TRANSACTION_COMPENSATION_FAILED
        } else {
            names::TRANSACTION_COMPENSATION_PARTIAL
        };
        self.events
            .publish(Event::new(
                event_name,
                Some(transaction_id),
                serde_json::json!({"completed": report.completed, "skipped": report.skipped, "failed": report.failed}),
            ))
            .await;

        Ok(report)
    }
}

/// Orders operations so each op is visited after every op that depends on
/// it (i.e. last-executed-first): computes the forward execution order
/// (prerequisites first, via Kahn's algorithm over `depends_on`) and
/// reverses it. Errors if `depends_on` describes a cycle.
fn reverse_dependency_order(ops: &[CompensatingOperation]) -> Result<Vec<String>> {
    let mut dependents: HashMap<String, Vec<String>> = HashMap::new();
    let mut in_degree: HashMap<String, usize> = HashMap::new();

    for op in ops {
        in_degree.entry(op.id.clone()).or_insert(0);
        for dep in &op.depends_on {
            dependents.entry(dep.clone()).or_default().push(op.id.clone());
            *in_degree.entry(op.id.clone()).or_insert(0) += 1;
        }
    }

    let mut ready: Vec<String> = ops
        .iter()
        .map(|op| op.id.clone())
        .filter(|id| in_degree.get(id).copied().unwrap_or(0) == 0)
        .collect();
    ready.sort();

    let mut forward_order = Vec::with_capacity(ops.len());
    let mut queue: std::collections::VecDeque<String> = ready.into();

    while let Some(id) = queue.pop_front() {
        forward_order.push(id.clone());
        if let Some(deps) = dependents.get(&id) {
            for dependent in deps {
                if let Some(count) = in_degree.get_mut(dependent) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(dependent.clone());
                    }
                }
            }
        }
    }

    if forward_order.len() != ops.len() {
        return Err(CoreError::internal("compensation dependency graph contains a cycle"));
    }
    forward_order.reverse();
    Ok(forward_order)
}
