//! Corrupt file repository.

use crate::error::CatalogResult;
use crate::models::CorruptFileRow;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for corruption detections and their remediation progress.
#[async_trait]
pub trait CorruptFileRepo: Send + Sync {
    /// Record a detection. A repeat detection for the same instance
    /// increments `corrupt_count` instead of inserting a new row.
    async fn record_corrupt_file(
        &self,
        file_name: &str,
        file_source: &str,
        instance_id: i64,
        detector: &str,
        now: OffsetDateTime,
    ) -> CatalogResult<CorruptFileRow>;

    /// Detections with no replacement requested yet.
    async fn corrupt_files_pending(&self) -> CatalogResult<Vec<CorruptFileRow>>;

    /// Detections whose replacement copy is in flight.
    async fn corrupt_files_awaiting_replacement(&self) -> CatalogResult<Vec<CorruptFileRow>>;

    async fn mark_replacement_requested(
        &self,
        id: i64,
        repair_transfer_id: Uuid,
    ) -> CatalogResult<()>;

    /// The replacement transfer failed; arm the row for another attempt.
    async fn reset_replacement_request(&self, id: i64) -> CatalogResult<()>;

    async fn delete_corrupt_file(&self, id: i64) -> CatalogResult<()>;
}
