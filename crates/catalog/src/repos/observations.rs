//! Observation repository.

use crate::error::CatalogResult;
use crate::models::ObservationRow;
use async_trait::async_trait;

/// Repository for observation records. Observations are immutable after
/// creation; ids are assigned by the originating instrument.
#[async_trait]
pub trait ObservationRepo: Send + Sync {
    /// Insert an observation. Re-inserting an identical row is idempotent;
    /// an id collision with different attributes is a conflict.
    async fn create_observation(&self, observation: &ObservationRow) -> CatalogResult<()>;

    async fn get_observation(&self, id: i64) -> CatalogResult<Option<ObservationRow>>;
}
