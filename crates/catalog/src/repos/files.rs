//! File repository.

use crate::error::CatalogResult;
use crate::models::{FileRow, NewFile, NewInstance};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for logical file records.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Create a file, optionally with its first instance, in one
    /// transaction. A duplicate name with a different checksum is a
    /// conflict; with an identical checksum the call is idempotent (the
    /// instance is still created if it does not conflict).
    async fn create_file(
        &self,
        file: &NewFile,
        instance: Option<&NewInstance>,
    ) -> CatalogResult<()>;

    async fn get_file(&self, name: &str) -> CatalogResult<Option<FileRow>>;

    /// Remove a file together with its instance and remote-instance rows.
    /// Bytes on stores are not touched; callers delete those first.
    async fn delete_file(&self, name: &str) -> CatalogResult<()>;

    /// Files uploaded since `uploaded_since` that have at least one
    /// available local instance, no remote instance at `librarian_id`, and
    /// no active outgoing transfer to it. Ordered oldest-first, ties by
    /// name.
    async fn files_lacking_remote_instance(
        &self,
        librarian_id: i64,
        uploaded_since: OffsetDateTime,
        limit: u32,
    ) -> CatalogResult<Vec<FileRow>>;

    /// Files uploaded since `uploaded_since` whose only available instances
    /// live on `store_id`. Ordered oldest-first, ties by name.
    async fn files_only_on_store(
        &self,
        store_id: i64,
        uploaded_since: OffsetDateTime,
        limit: u32,
    ) -> CatalogResult<Vec<FileRow>>;
}
