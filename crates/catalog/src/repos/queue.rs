//! Send queue repository.

use crate::error::CatalogResult;
use crate::models::SendQueueItemRow;
use archivist_core::QueueItemStatus;
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

/// Repository for the durable outbound work list.
///
/// Items are never deleted; they settle into `done` or `failed` for audit.
#[async_trait]
pub trait QueueRepo: Send + Sync {
    async fn enqueue_send(
        &self,
        outgoing_transfer_id: Uuid,
        priority: i64,
        now: OffsetDateTime,
    ) -> CatalogResult<SendQueueItemRow>;

    /// Atomically claim up to `limit` pending items for `claim_id` until
    /// `now + ttl`. Highest priority first, then oldest.
    async fn claim_queue_items(
        &self,
        limit: u32,
        claim_id: Uuid,
        ttl: time::Duration,
        now: OffsetDateTime,
    ) -> CatalogResult<Vec<SendQueueItemRow>>;

    /// Settle a claimed item into `done` or `failed`.
    async fn settle_queue_item(&self, id: i64, status: QueueItemStatus) -> CatalogResult<()>;

    /// Revert claims whose deadline passed back to `pending`. Returns the
    /// number of reverted items.
    async fn release_expired_claims(&self, now: OffsetDateTime) -> CatalogResult<u64>;

    async fn claimed_queue_items(&self) -> CatalogResult<Vec<SendQueueItemRow>>;

    async fn queue_item_for_transfer(
        &self,
        outgoing_transfer_id: Uuid,
    ) -> CatalogResult<Option<SendQueueItemRow>>;
}
