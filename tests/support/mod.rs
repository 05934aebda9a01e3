//! Shared harness for the end-to-end scenarios in §8: wires a real
//! `TransactionManager` against the in-memory store and a scriptable
//! provider double. Defined locally (rather than reusing
//! `provider::test_double::FakeProvider`) because that double is
//! `#[cfg(test)]`-gated inside the library crate and invisible to this
//! separately compiled integration test binary.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use paytxn_core::clock::{SystemClock, UuidGenerator};
use paytxn_core::compensation::{CompensationLedger, NoopHandler};
use paytxn_core::dlq::DeadLetterQueue;
use paytxn_core::events::{EventBus, InMemorySink};
use paytxn_core::idempotency::{IdempotencyConfig, IdempotencyManager};
use paytxn_core::locking::{LockingConfig, RecordLocker};
use paytxn_core::provider::{PaymentMethod, PaymentRequest, PaymentResult, ProviderPort, ProviderRecord, ProviderStatus};
use paytxn_core::recovery::{RecoveryConfig, RecoveryManager};
use paytxn_core::retry::{RetryManager, RetryPolicy, RetryQueue};
use paytxn_core::store::{InMemoryStore, Store};
use paytxn_core::transaction::{PaymentSubmission, TransactionManager};
use paytxn_core::{CoreError, Result};

/// Per-provider-reference outcome a test wants `get_transaction_status` to
/// report once recovery queries it, keyed by external_ref.
#[derive(Clone, Copy)]
#[allow(dead_code)]
pub enum ScriptedStatus {
    Succeeded,
    Failed,
    Unknown,
}

/// Provider double whose `create_payment` fails the first `fail_first_n`
/// calls per idempotency key with a simulated network error, then
/// succeeds, and whose `get_transaction_status` returns whatever a test
/// pre-registers for a given reference.
pub struct ScriptedProvider {
    pub fail_first_n: u64,
    calls: AtomicU64,
    statuses: Mutex<HashMap<String, ScriptedStatus>>,
}

impl ScriptedProvider {
    pub fn new(fail_first_n: u64) -> Self {
        Self { fail_first_n, calls: AtomicU64::new(0), statuses: Mutex::new(HashMap::new()) }
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn set_status(&self, external_ref: impl Into<String>, status: ScriptedStatus) {
        self.statuses.lock().insert(external_ref.into(), status);
    }
}

#[async_trait]
impl ProviderPort for ScriptedProvider {
    async fn create_payment(&self, request: PaymentRequest) -> Result<PaymentResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.fail_first_n {
            return Err(CoreError::provider_communication("simulated network failure"));
        }
        Ok(PaymentResult { external_ref: format!("charge_{}", request.idempotency_key), status: ProviderStatus::Succeeded })
    }

    async fn confirm_payment(&self, external_ref: &String, _idempotency_key: &String) -> Result<PaymentResult> {
        Ok(PaymentResult { external_ref: external_ref.clone(), status: ProviderStatus::Succeeded })
    }

    async fn get_transaction_status(&self, external_ref: &String) -> Result<ProviderStatus> {
        Ok(match self.statuses.lock().get(external_ref) {
            Some(ScriptedStatus::Succeeded) | None => ProviderStatus::Succeeded,
            Some(ScriptedStatus::Failed) => ProviderStatus::Failed,
            Some(ScriptedStatus::Unknown) => ProviderStatus::Unknown,
        })
    }

    async fn add_payment_method(&self, _customer_ref: &str, _params: serde_json::Value) -> Result<PaymentMethod> {
        Ok(PaymentMethod { id: "pm_fake".to_string(), display_name: "fake".to_string() })
    }

    async fn get_payment_methods(&self, _customer_ref: &str) -> Result<Vec<PaymentMethod>> {
        Ok(vec![])
    }

    async fn remove_payment_method(&self, _method_id: &str) -> Result<()> {
        Ok(())
    }

    fn verify_webhook_signature(&self, _payload: &[u8], _signature: &str) -> Result<bool> {
        Ok(true)
    }

    async fn get_transaction_record(&self, _external_ref: &String) -> Result<Option<ProviderRecord>> {
        Ok(None)
    }

    async fn list_transactions(&self, _since: chrono::DateTime<chrono::Utc>) -> Result<Vec<ProviderRecord>> {
        Ok(vec![])
    }
}

pub struct Harness {
    pub manager: TransactionManager,
    pub store: Arc<dyn Store>,
    pub provider: Arc<ScriptedProvider>,
}

pub fn build(fail_first_n: u64) -> Harness {
    let store: Arc<dyn Store> = Arc::new(InMemoryStore::new());
    let events = Arc::new(EventBus::new(Arc::new(InMemorySink::new())));
    let clock = Arc::new(SystemClock);
    let ids = Arc::new(UuidGenerator);

    let locker = Arc::new(RecordLocker::new(store.clone(), events.clone(), clock.clone(), ids.clone(), LockingConfig::default()));
    let idempotency = Arc::new(IdempotencyManager::new(store.clone(), events.clone(), clock.clone(), IdempotencyConfig::default()));
    let retry = Arc::new(RetryManager::new(RetryQueue::new(store.clone()), events.clone(), clock.clone(), RetryPolicy::default()));
    let provider = Arc::new(ScriptedProvider::new(fail_first_n));
    let provider_port: Arc<dyn ProviderPort> = provider.clone();
    let recovery = Arc::new(RecoveryManager::new(provider_port.clone(), events.clone(), RecoveryConfig::default()));

    let mut ledger = CompensationLedger::new(store.clone(), events.clone());
    ledger.register_handler("charge", Arc::new(NoopHandler));
    let compensation = Arc::new(ledger);

    let dlq = Arc::new(DeadLetterQueue::new(store.clone(), events.clone()));

    let manager = TransactionManager::new(
        store.clone(),
        locker,
        events,
        ids,
        idempotency,
        retry,
        recovery,
        compensation,
        dlq,
        provider_port,
    );

    Harness { manager, store, provider }
}

pub fn submission() -> PaymentSubmission {
    PaymentSubmission { amount_minor_units: 2599, currency: "USD".to_string(), payment_method_id: "pm_card_visa".to_string(), params: serde_json::json!({}) }
}
