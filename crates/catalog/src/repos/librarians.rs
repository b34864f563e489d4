//! Librarian (peer site) repository.

use crate::error::CatalogResult;
use crate::models::{LibrarianRow, NewLibrarian};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for peer librarian records.
#[async_trait]
pub trait LibrarianRepo: Send + Sync {
    /// Create a librarian or refresh its connection details from
    /// configuration. The transfer toggle and timestamps survive refreshes.
    async fn upsert_librarian(&self, librarian: &NewLibrarian) -> CatalogResult<LibrarianRow>;

    async fn get_librarian(&self, name: &str) -> CatalogResult<Option<LibrarianRow>>;

    async fn get_librarian_by_id(&self, id: i64) -> CatalogResult<Option<LibrarianRow>>;

    async fn list_librarians(&self) -> CatalogResult<Vec<LibrarianRow>>;

    /// Toggle transfers; disabling stamps `disabled_since`, enabling clears
    /// it.
    async fn set_transfers_enabled(
        &self,
        name: &str,
        enabled: bool,
        now: OffsetDateTime,
    ) -> CatalogResult<()>;

    /// Record a successful contact with the peer.
    async fn mark_librarian_seen(&self, name: &str, now: OffsetDateTime) -> CatalogResult<()>;
}
