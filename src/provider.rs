//! ProviderPort (§6): the boundary to an external payment provider. Defined
//! as an `async_trait` the way the pack's settlement-engine and payments-manager
//! examples wrap their provider SDKs, so the core never depends on a
//! specific provider's client directly.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::common::{ExternalRef, IdempotencyKey};
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub idempotency_key: IdempotencyKey,
    pub amount_minor_units: i64,
    pub currency: String,
    pub payment_method_id: String,
    pub params: serde_json::Value,
}

/// Provider-reported transaction status. The full vocabulary a real
/// provider's webhooks/API can report (§4.7); `Reconciler::accepted_statuses`
/// groups these into the accepted set for each internal `TransactionStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderStatus {
    Pending,
    Initiated,
    Processing,
    InProgress,
    Completed,
    Succeeded,
    Settled,
    Failed,
    Declined,
    Error,
    Voided,
    Reversed,
    Cancelled,
    Refunded,
    Unknown,
}

impl ProviderStatus {
    pub fn is_success(self) -> bool {
        matches!(self, ProviderStatus::Completed | ProviderStatus::Succeeded | ProviderStatus::Settled)
    }

    pub fn is_failure(self) -> bool {
        matches!(self, ProviderStatus::Failed | ProviderStatus::Declined | ProviderStatus::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentResult {
    pub external_ref: ExternalRef,
    pub status: ProviderStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentMethod {
    pub id: String,
    pub display_name: String,
}

/// A provider-side transaction record, as seen by reconciliation (§4.7).
/// Carries enough to detect both status divergence and amount divergence
/// without a second round trip per transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub external_ref: ExternalRef,
    pub status: ProviderStatus,
    pub amount: Decimal,
    pub currency: String,
}

/// Port to an external payment provider. Every method must be safe to call
/// concurrently and, where an `idempotency_key` is accepted, must pass it
/// through to the provider so provider-side retries are themselves
/// deduplicated (§6).
#[async_trait]
pub trait ProviderPort: Send + Sync {
    async fn create_payment(&self, request: PaymentRequest) -> Result<PaymentResult>;
    async fn confirm_payment(&self, external_ref: &ExternalRef, idempotency_key: &IdempotencyKey) -> Result<PaymentResult>;
    async fn get_transaction_status(&self, external_ref: &ExternalRef) -> Result<ProviderStatus>;
    async fn add_payment_method(&self, customer_ref: &str, params: serde_json::Value) -> Result<PaymentMethod>;
    async fn get_payment_methods(&self, customer_ref: &str) -> Result<Vec<PaymentMethod>>;
    async fn remove_payment_method(&self, method_id: &str) -> Result<()>;
    /// Verifies a provider webhook's signature over `payload` given the
    /// provider-supplied `signature` header value.
    fn verify_webhook_signature(&self, payload: &[u8], signature: &str) -> Result<bool>;
    /// Full provider-side record for one transaction, `None` if the provider
    /// has no record of it at all. Backs §4.7 status/amount reconciliation.
    async fn get_transaction_record(&self, external_ref: &ExternalRef) -> Result<Option<ProviderRecord>>;
    /// Every provider-side transaction created at or after `since`. Backs
    /// §4.7 orphan detection — records the provider holds with no matching
    /// internal transaction.
    async fn list_transactions(&self, since: DateTime<Utc>) -> Result<Vec<ProviderRecord>>;
}

#[cfg(test)]
pub mod test_double {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;

    /// Scriptable in-memory provider for tests: returns canned statuses per
    /// call count, never reaches the network. `records`/`orphans` let a test
    /// drive reconciliation scenarios without a real provider.
    #[derive(Default)]
    pub struct FakeProvider {
        pub calls: AtomicU64,
        pub fail_first_n: u64,
        pub records: Mutex<HashMap<String, ProviderRecord>>,
        pub orphans: Mutex<Vec<ProviderRecord>>,
    }

    impl FakeProvider {
        pub fn set_record(&self, record: ProviderRecord) {
            self.records.lock().unwrap().insert(record.external_ref.clone(), record);
        }

        pub fn add_orphan(&self, record: ProviderRecord) {
            self.orphans.lock().unwrap().push(record);
        }
    }

    #[async_trait]
    impl ProviderPort for FakeProvider {
        async fn create_payment(&self, request: PaymentRequest) -> Result<PaymentResult> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first_n {
                return Err(crate::CoreError::provider_communication("simulated network failure"));
            }
            Ok(PaymentResult {
                external_ref: format!("charge_{}", request.idempotency_key),
                status: ProviderStatus::Succeeded,
            })
        }

        async fn confirm_payment(&self, external_ref: &ExternalRef, _idempotency_key: &IdempotencyKey) -> Result<PaymentResult> {
            Ok(PaymentResult { external_ref: external_ref.clone(), status: ProviderStatus::Succeeded })
        }

        async fn get_transaction_status(&self, _external_ref: &ExternalRef) -> Result<ProviderStatus> {
            Ok(ProviderStatus::Succeeded)
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

        async fn get_transaction_record(&self, external_ref: &ExternalRef) -> Result<Option<ProviderRecord>> {
            Ok(self.records.lock().unwrap().get(external_ref).cloned())
        }

        async fn list_transactions(&self, _since: DateTime<Utc>) -> Result<Vec<ProviderRecord>> {
            Ok(self.orphans.lock().unwrap().clone())
        }
    }
}
