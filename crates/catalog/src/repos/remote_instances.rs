//! Remote instance repository.

use crate::error::CatalogResult;
use crate::models::RemoteInstanceRow;
use archivist_core::Checksum;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for records of files held by peer librarians.
#[async_trait]
pub trait RemoteInstanceRepo: Send + Sync {
    /// Upsert keyed by (file, librarian). Registering over an existing row
    /// whose verified checksum differs is a conflict; the row is left for
    /// reconciliation.
    #[allow(clippy::too_many_arguments)]
    async fn register_remote_instance(
        &self,
        file_name: &str,
        librarian_id: i64,
        checksum: &Checksum,
        copy_time: OffsetDateTime,
        sender: &str,
    ) -> CatalogResult<RemoteInstanceRow>;

    async fn remote_instances_for_file(
        &self,
        file_name: &str,
    ) -> CatalogResult<Vec<RemoteInstanceRow>>;

    /// Record the result of a downstream checksum verification.
    async fn update_remote_verification(
        &self,
        id: i64,
        checksum: &Checksum,
        verified_at: OffsetDateTime,
    ) -> CatalogResult<()>;

    /// Rows superseded by a newer row for the same (file, librarian);
    /// latest `copy_time` wins, ties broken by id.
    async fn duplicate_remote_instances(&self) -> CatalogResult<Vec<RemoteInstanceRow>>;

    async fn delete_remote_instance(&self, id: i64) -> CatalogResult<()>;

    /// Distinct librarians holding a copy whose verified checksum matches.
    async fn count_verified_remote_copies(
        &self,
        file_name: &str,
        checksum: &Checksum,
    ) -> CatalogResult<u64>;
}
