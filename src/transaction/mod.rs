//! C11: TransactionManager.
//!
//! Data types live in [`crate::store::model`] (the shared data model, §3);
//! this module owns the behaviour that mutates them.

pub mod txn_manager;

pub use txn_manager::{resource_id, BeginOutcome, BeginRequest, PaymentSubmission, TransactionManager};
