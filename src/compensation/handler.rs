//! Per-kind inverse operation handlers. The core only guarantees ordering,
//! retry and terminal bookkeeping of compensation; the actual inverse
//! semantics (refund a charge, release a reservation) are supplied by the
//! host application through this trait — see the Open Questions in
//! DESIGN.md.

use async_trait::async_trait;

use crate::store::model::CompensatingOperation;
use crate::Result;

#[async_trait]
pub trait CompensationHandler: Send + Sync {
    async fn compensate(&self, op: &CompensatingOperation) -> Result<()>;
}

/// Handler that does nothing, useful for operation kinds that have no real
/// inverse (e.g. a read-only step registered only for audit purposes).
pub struct NoopHandler;

#[async_trait]
impl CompensationHandler for NoopHandler {
    async fn compensate(&self, _op: &CompensatingOperation) -> Result<()> {
        Ok(())
    }
}
