//! Store metadata repository.

use crate::error::CatalogResult;
use crate::models::{NewStore, StoreRow};
use async_trait::async_trait;

/// Repository for local store records.
///
/// `used_bytes` is not mutated here; it rides in the instance mutations so
/// accounting and rows can never drift apart.
#[async_trait]
pub trait StoreRepo: Send + Sync {
    /// Create a store or refresh its configuration-derived columns
    /// (capacity, root, ingestable). The enabled flag is only taken from
    /// configuration at first creation; afterwards tasks own it.
    async fn upsert_store(&self, store: &NewStore) -> CatalogResult<StoreRow>;

    async fn get_store(&self, name: &str) -> CatalogResult<Option<StoreRow>>;

    async fn get_store_by_id(&self, id: i64) -> CatalogResult<Option<StoreRow>>;

    async fn list_stores(&self) -> CatalogResult<Vec<StoreRow>>;

    async fn set_store_enabled(&self, id: i64, enabled: bool) -> CatalogResult<()>;
}
