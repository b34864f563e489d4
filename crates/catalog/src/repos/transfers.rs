//! Transfer repository.

use crate::error::CatalogResult;
use crate::models::{
    IncomingTransferRow, IncomingTransferUpdates, NewIncomingTransfer, NewOutgoingTransfer,
    OutgoingTransferRow, TransferUpdates,
};
use archivist_core::TransferStatus;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for transfer state machines.
///
/// `transition_*` are compare-and-set updates: the row must currently be in
/// `from` or the call fails with `StaleState`. They are the only way
/// transfer status changes.
#[async_trait]
pub trait TransferRepo: Send + Sync {
    /// Create an outgoing transfer in `initiated`. A non-terminal transfer
    /// for the same (file, destination) is a conflict.
    async fn create_outgoing(
        &self,
        transfer: &NewOutgoingTransfer,
    ) -> CatalogResult<OutgoingTransferRow>;

    async fn get_outgoing(&self, id: Uuid) -> CatalogResult<Option<OutgoingTransferRow>>;

    /// The non-terminal outgoing transfer for (file, destination), if any.
    async fn get_active_outgoing(
        &self,
        file_name: &str,
        destination_id: i64,
    ) -> CatalogResult<Option<OutgoingTransferRow>>;

    async fn transition_outgoing(
        &self,
        id: Uuid,
        from: TransferStatus,
        to: TransferStatus,
        updates: &TransferUpdates,
        now: OffsetDateTime,
    ) -> CatalogResult<()>;

    async fn outgoing_by_status(
        &self,
        status: TransferStatus,
    ) -> CatalogResult<Vec<OutgoingTransferRow>>;

    /// Non-terminal outgoing transfers created before `older_than`.
    async fn stale_outgoing(
        &self,
        older_than: OffsetDateTime,
    ) -> CatalogResult<Vec<OutgoingTransferRow>>;

    /// Create an incoming transfer in `initiated`. The
    /// (source librarian, source transfer id) pair is unique; re-creating
    /// it is a conflict, so idempotent prepare calls go through
    /// `get_incoming_by_source` first.
    async fn create_incoming(
        &self,
        transfer: &NewIncomingTransfer,
    ) -> CatalogResult<IncomingTransferRow>;

    async fn get_incoming(&self, id: Uuid) -> CatalogResult<Option<IncomingTransferRow>>;

    async fn get_incoming_by_source(
        &self,
        source_librarian_id: i64,
        source_transfer_id: Uuid,
    ) -> CatalogResult<Option<IncomingTransferRow>>;

    async fn transition_incoming(
        &self,
        id: Uuid,
        from: TransferStatus,
        to: TransferStatus,
        updates: &IncomingTransferUpdates,
        now: OffsetDateTime,
    ) -> CatalogResult<()>;

    async fn incoming_by_status(
        &self,
        status: TransferStatus,
    ) -> CatalogResult<Vec<IncomingTransferRow>>;

    /// Non-terminal incoming transfers created before `older_than`.
    async fn stale_incoming(
        &self,
        older_than: OffsetDateTime,
    ) -> CatalogResult<Vec<IncomingTransferRow>>;
}
