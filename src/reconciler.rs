//! C12: Reconciler (§4.7). Periodically diffs internal transaction state
//! against the provider's view, surfacing divergence rather than resolving
//! it automatically — correcting a mismatch is always a human or a
//! higher-level workflow's call, this component only detects and reports.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::common::{ExternalRef, TransactionId};
use crate::provider::{ProviderPort, ProviderStatus};
use crate::store::model::TransactionStatus;
use crate::store::Store;
use crate::Result;

/// Provider statuses accepted for a given internal status, per §4.7's
/// mapping table. `RecoveryPending`/`RecoveryInProgress` are transient
/// states the table doesn't name directly; they accept the same set as
/// `Processing` since a transaction in either state is, from the
/// provider's perspective, still mid-flight.
fn accepted_provider_statuses(status: TransactionStatus) -> &'static [ProviderStatus] {
    use ProviderStatus::*;
    match status {
        TransactionStatus::Pending => &[Pending, Initiated, Processing],
        TransactionStatus::Processing | TransactionStatus::RecoveryPending | TransactionStatus::RecoveryInProgress => {
            &[Processing, InProgress, Pending]
        }
        TransactionStatus::Completed => &[Completed, Succeeded, Settled],
        TransactionStatus::Failed => &[Failed, Declined, Error],
        TransactionStatus::RolledBack => &[Voided, Reversed, Cancelled, Refunded],
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusMismatch {
    pub transaction_id: TransactionId,
    pub internal_status: TransactionStatus,
    pub accepted_provider_statuses: Vec<ProviderStatus>,
    pub actual_provider_status: ProviderStatus,
}

/// Critical: the provider and the internal record disagree on amount for
/// the same transaction (§4.7), any difference at or above the currency's
/// smallest unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmountMismatch {
    pub transaction_id: TransactionId,
    pub internal_amount: Decimal,
    pub provider_amount: Decimal,
}

/// An internal transaction that should have a provider-side counterpart by
/// now (terminal, or pending for over an hour) but has none on record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MissingRecord {
    pub transaction_id: TransactionId,
    pub internal_status: TransactionStatus,
}

/// High severity: the provider has a record with no matching internal
/// transaction at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrphanedRecord {
    pub external_ref: ExternalRef,
    pub provider_status: ProviderStatus,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub status_mismatch: Vec<StatusMismatch>,
    pub amount_mismatch: Vec<AmountMismatch>,
    pub missing: Vec<MissingRecord>,
    pub orphaned: Vec<OrphanedRecord>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.status_mismatch.is_empty()
            && self.amount_mismatch.is_empty()
            && self.missing.is_empty()
            && self.orphaned.is_empty()
    }
}

pub struct Reconciler {
    store: Arc<dyn Store>,
    provider: Arc<dyn ProviderPort>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn ProviderPort>) -> Self {
        Self { store, provider }
    }

    /// Runs a full sweep over every transaction status, diffing each
    /// transaction with an external reference against the provider's record
    /// for it, then separately sweeping the provider's own records (created
    /// at or after `since`) for orphans with no internal counterpart.
    pub async fn reconcile(&self, since: DateTime<Utc>) -> Result<ReconciliationReport> {
        let mut report = ReconciliationReport::default();
        let now = Utc::now();
        let mut known_external_refs: HashSet<ExternalRef> = HashSet::new();

        for status in [
            TransactionStatus::Pending,
            TransactionStatus::Processing,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
            TransactionStatus::RolledBack,
            TransactionStatus::RecoveryPending,
            TransactionStatus::RecoveryInProgress,
        ] {
            for txn in self.store.list_transactions_by_status(status).await? {
                let Some(external_ref) = &txn.external_ref else {
                    let should_have_existed = txn.status.is_terminal() || (now - txn.created_at) > chrono::Duration::hours(1);
                    if should_have_existed {
                        report.missing.push(MissingRecord { transaction_id: txn.id, internal_status: txn.status });
                    }
                    continue;
                };

                known_external_refs.insert(external_ref.clone());
                let accepted = accepted_provider_statuses(txn.status);
                match self.provider.get_transaction_record(external_ref).await? {
                    Some(record) => {
                        if !accepted.contains(&record.status) {
                            report.status_mismatch.push(StatusMismatch {
                                transaction_id: txn.id,
                                internal_status: txn.status,
                                accepted_provider_statuses: accepted.to_vec(),
                                actual_provider_status: record.status,
                            });
                        }
                        if record.amount != txn.amount {
                            report.amount_mismatch.push(AmountMismatch {
                                transaction_id: txn.id,
                                internal_amount: txn.amount,
                                provider_amount: record.amount,
                            });
                        }
                    }
                    None => {
                        report.status_mismatch.push(StatusMismatch {
                            transaction_id: txn.id,
                            internal_status: txn.status,
                            accepted_provider_statuses: accepted.to_vec(),
                            actual_provider_status: ProviderStatus::Unknown,
                        });
                    }
                }
            }
        }

        for record in self.provider.list_transactions(since).await? {
            if !known_external_refs.contains(&record.external_ref) {
                report.orphaned.push(OrphanedRecord {
                    external_ref: record.external_ref,
                    provider_status: record.status,
                    amount: record.amount,
                });
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::test_double::FakeProvider;
    use crate::provider::ProviderRecord;
    use crate::store::model::{Transaction, TransactionType};
    use crate::store::InMemoryStore;

    fn txn(status: TransactionStatus, external_ref: Option<String>) -> Transaction {
        let now = chrono::Utc::now();
        Transaction {
            id: uuid::Uuid::new_v4(),
            transaction_type: TransactionType::Payment,
            status,
            amount: Decimal::new(1099, 2),
            currency: "USD".to_string(),
            customer_id: "cust_1".to_string(),
            payment_method_ref: "pm_1".to_string(),
            idempotency_key: None,
            external_ref,
            metadata: Default::default(),
            error: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failed_at: None,
            version: 0,
        }
    }

    fn since() -> DateTime<Utc> {
        Utc::now() - chrono::Duration::hours(24)
    }

    #[tokio::test]
    async fn completed_without_external_ref_is_flagged_missing() {
        let store = Arc::new(InMemoryStore::new());
        let t = txn(TransactionStatus::Completed, None);
        let id = t.id;
        store.put_transaction(t).await.unwrap();

        let reconciler = Reconciler::new(store, Arc::new(FakeProvider::default()));
        let report = reconciler.reconcile(since()).await.unwrap();
        assert_eq!(report.missing, vec![MissingRecord { transaction_id: id, internal_status: TransactionStatus::Completed }]);
    }

    #[tokio::test]
    async fn matching_status_and_amount_is_clean() {
        let store = Arc::new(InMemoryStore::new());
        let t = txn(TransactionStatus::Completed, Some("charge_1".to_string()));
        let amount = t.amount;
        store.put_transaction(t).await.unwrap();

        let provider = Arc::new(FakeProvider::default());
        provider.set_record(ProviderRecord {
            external_ref: "charge_1".to_string(),
            status: ProviderStatus::Succeeded,
            amount,
            currency: "USD".to_string(),
        });

        let reconciler = Reconciler::new(store, provider);
        let report = reconciler.reconcile(since()).await.unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test]
    async fn status_outside_accepted_set_is_a_mismatch() {
        let store = Arc::new(InMemoryStore::new());
        let t = txn(TransactionStatus::Completed, Some("charge_2".to_string()));
        let amount = t.amount;
        store.put_transaction(t).await.unwrap();

        let provider = Arc::new(FakeProvider::default());
        provider.set_record(ProviderRecord {
            external_ref: "charge_2".to_string(),
            status: ProviderStatus::Declined,
            amount,
            currency: "USD".to_string(),
        });

        let reconciler = Reconciler::new(store, provider);
        let report = reconciler.reconcile(since()).await.unwrap();
        assert_eq!(report.status_mismatch.len(), 1);
        assert_eq!(report.status_mismatch[0].actual_provider_status, ProviderStatus::Declined);
    }

    #[tokio::test]
    async fn amount_divergence_is_flagged() {
        let store = Arc::new(InMemoryStore::new());
        let t = txn(TransactionStatus::Completed, Some("charge_3".to_string()));
        let internal_amount = t.amount;
        store.put_transaction(t).await.unwrap();

        let provider = Arc::new(FakeProvider::default());
        provider.set_record(ProviderRecord {
            external_ref: "charge_3".to_string(),
            status: ProviderStatus::Succeeded,
            amount: Decimal::new(500, 2),
            currency: "USD".to_string(),
        });

        let reconciler = Reconciler::new(store, provider);
        let report = reconciler.reconcile(since()).await.unwrap();
        assert_eq!(report.amount_mismatch, vec![AmountMismatch {
            transaction_id: report.amount_mismatch[0].transaction_id,
            internal_amount,
            provider_amount: Decimal::new(500, 2),
        }]);
    }

    #[tokio::test]
    async fn provider_record_with_no_internal_counterpart_is_orphaned() {
        let store = Arc::new(InMemoryStore::new());
        let provider = Arc::new(FakeProvider::default());
        provider.add_orphan(ProviderRecord {
            external_ref: "charge_ghost".to_string(),
            status: ProviderStatus::Succeeded,
            amount: Decimal::new(1099, 2),
            currency: "USD".to_string(),
        });

        let reconciler = Reconciler::new(store, provider);
        let report = reconciler.reconcile(since()).await.unwrap();
        assert_eq!(report.orphaned.len(), 1);
        assert_eq!(report.orphaned[0].external_ref, "charge_ghost");
    }
}
