// Common Types and Traits
//
// Shared identifiers and lifecycle traits used across the orchestration
// core. Kept intentionally small: the core does not interpret application
// data, only the well-known identifiers and envelopes named in the spec.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque 128-bit transaction identifier.
pub type TransactionId = uuid::Uuid;

/// Client-supplied idempotency key.
pub type IdempotencyKey = String;

/// Opaque external provider reference (e.g. a charge id).
pub type ExternalRef = String;

/// Monotonically increasing sequence number, used to order retry/DLQ entries
/// and as a cheap substitute for a log sequence number in the durable event
/// log sink.
pub type SequenceNumber = u64;

/// Health of a long-lived component, surfaced for operational tooling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Base lifecycle trait for the core's long-lived components.
///
/// Mirrors the teacher's `Component` trait: every manager that owns
/// background work (sweeps, cleanup cycles, dispatch loops) implements this
/// so a host process can start/stop them uniformly.
pub trait Component: Send + Sync {
    /// Human-readable component name, used in logs and health reports.
    fn name(&self) -> &'static str;

    /// Check health status. Never blocks on I/O.
    fn health_check(&self) -> HealthStatus {
        HealthStatus::Healthy
    }
}

/// Opaque JSON blob used for `metadata`/`params` fields that the core stores
/// but never interprets, except for the well-known keys it type-checks
/// explicitly (see `transaction::types::Transaction::metadata_get`).
pub type OpaqueMetadata = serde_json::Map<String, serde_json::Value>;

/// Canonicalises a JSON value the way the idempotency manager's request
/// fingerprint requires: object keys sorted, whitespace normalised. This is
/// a pure function so fingerprinting is deterministic across processes.
pub fn canonicalize_json(value: &serde_json::Value) -> String {
    fn sorted(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let mut entries: Vec<_> = map.iter().collect();
                entries.sort_by(|a, b| a.0.cmp(b.0));
                let mut out = serde_json::Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), sorted(v));
                }
                serde_json::Value::Object(out)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(sorted).collect())
            }
            other => other.clone(),
        }
    }
    sorted(value).to_string()
}

/// Stable hash of a canonicalised request body, used to detect idempotency
/// key replay with divergent content (§4.2).
pub fn fingerprint(value: &serde_json::Value) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};

    let canon = canonicalize_json(value);
    let mut hasher = DefaultHasher::new();
    canon.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// Display helper shared by a few error messages.
pub fn join_ids<T: fmt::Display>(ids: &[T], sep: &str) -> String {
    ids.iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join(sep)
}
