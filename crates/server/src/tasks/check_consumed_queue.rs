//! Queue claim garbage collector.
//!
//! Reverts expired claims to pending and settles claimed items whose
//! transfers already reached a terminal state (a consumer that died after
//! finishing the transfer but before settling its item).

use super::{past_deadline, Task, TaskContext, TaskOutcome, TaskResult};
use archivist_catalog::Catalog;
use archivist_core::config::CheckConsumedQueueConfig;
use archivist_core::{QueueItemStatus, TransferStatus};
use async_trait::async_trait;
use time::OffsetDateTime;

pub struct CheckConsumedQueue {
    name: String,
}

impl CheckConsumedQueue {
    pub fn new(config: CheckConsumedQueueConfig) -> Self {
        let name = config
            .task_name
            .unwrap_or_else(|| "check_consumed_queue".to_string());
        Self { name }
    }
}

#[async_trait]
impl Task for CheckConsumedQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext, deadline: OffsetDateTime) -> TaskResult<TaskOutcome> {
        let released = ctx
            .state
            .catalog
            .release_expired_claims(OffsetDateTime::now_utc())
            .await?;
        if released > 0 {
            tracing::warn!(task = %self.name, released, "reverted expired queue claims to pending");
        }

        for item in ctx.state.catalog.claimed_queue_items().await? {
            if past_deadline(deadline) {
                return Ok(TaskOutcome::DeadlineExceeded);
            }
            let Some(transfer) = ctx
                .state
                .catalog
                .get_outgoing(item.outgoing_transfer_id)
                .await?
            else {
                tracing::error!(item = item.id, "queue item references missing transfer, failing item");
                ctx.state
                    .catalog
                    .settle_queue_item(item.id, QueueItemStatus::Failed)
                    .await?;
                continue;
            };

            match transfer.transfer_status()? {
                TransferStatus::Completed => {
                    ctx.state
                        .catalog
                        .settle_queue_item(item.id, QueueItemStatus::Done)
                        .await?;
                }
                TransferStatus::Failed | TransferStatus::Cancelled => {
                    ctx.state
                        .catalog
                        .settle_queue_item(item.id, QueueItemStatus::Failed)
                        .await?;
                }
                _ => {}
            }
        }

        Ok(TaskOutcome::Completed)
    }
}
