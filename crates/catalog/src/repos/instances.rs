//! Instance repository.

use crate::error::CatalogResult;
use crate::models::{InstanceRow, NewInstance};
use archivist_core::Checksum;
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for local file instances.
///
/// Creation and removal adjust the owning store's `used_bytes` in the same
/// transaction.
#[async_trait]
pub trait InstanceRepo: Send + Sync {
    /// Create an instance. Rejects disabled stores, duplicate
    /// (store, path) pairs, and inserts that would push the store past its
    /// capacity.
    async fn create_instance(&self, instance: &NewInstance) -> CatalogResult<InstanceRow>;

    async fn get_instance(&self, id: i64) -> CatalogResult<Option<InstanceRow>>;

    /// Instances on a store created at or after `since`, oldest first.
    async fn instances_on_store_since(
        &self,
        store_id: i64,
        since: OffsetDateTime,
    ) -> CatalogResult<Vec<InstanceRow>>;

    /// Available instances on a store created at or before `cutoff`,
    /// oldest first. Rolling-deletion candidates.
    async fn instances_on_store_older_than(
        &self,
        store_id: i64,
        cutoff: OffsetDateTime,
    ) -> CatalogResult<Vec<InstanceRow>>;

    async fn available_instances_for_file(
        &self,
        file_name: &str,
    ) -> CatalogResult<Vec<InstanceRow>>;

    /// Soft-delete: the row stays for audit and stops counting against
    /// the store (`used_bytes` tracks available instances; physical
    /// capacity is enforced by the store backends).
    async fn mark_instance_unavailable(&self, id: i64) -> CatalogResult<()>;

    /// Hard-delete the row; an available instance releases its bytes from
    /// the accounting. The caller is responsible for removing the bytes.
    async fn remove_instance(&self, id: i64) -> CatalogResult<()>;

    /// Refresh the cached on-disk checksum measurement.
    async fn update_instance_checksum_cache(
        &self,
        id: i64,
        checksum: &Checksum,
        size: i64,
        measured_at: OffsetDateTime,
    ) -> CatalogResult<()>;
}
