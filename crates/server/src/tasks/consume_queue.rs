//! Send-queue consumer.
//!
//! Claims a batch of queue items and drives each outgoing transfer toward
//! a terminal state. Items whose transfers end non-terminal stay claimed;
//! their claims expire and `check_consumed_queue` reverts them.

use super::{past_deadline, Task, TaskContext, TaskOutcome, TaskResult};
use crate::metrics;
use archivist_catalog::Catalog;
use archivist_core::config::ConsumeQueueConfig;
use archivist_core::{QueueItemStatus, TransferStatus};
use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

pub struct ConsumeQueue {
    config: ConsumeQueueConfig,
    name: String,
}

impl ConsumeQueue {
    pub fn new(config: ConsumeQueueConfig) -> Self {
        let name = config
            .task_name
            .clone()
            .unwrap_or_else(|| "consume_queue".to_string());
        Self { config, name }
    }
}

#[async_trait]
impl Task for ConsumeQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext, deadline: OffsetDateTime) -> TaskResult<TaskOutcome> {
        let claim_id = Uuid::new_v4();
        let items = ctx
            .state
            .catalog
            .claim_queue_items(
                self.config.batch_size,
                claim_id,
                self.config.claim_ttl.as_duration(),
                OffsetDateTime::now_utc(),
            )
            .await?;

        if items.is_empty() {
            tracing::debug!(task = %self.name, "queue empty");
            return Ok(TaskOutcome::Completed);
        }
        metrics::QUEUE_ITEMS_CLAIMED.inc_by(items.len() as u64);
        tracing::info!(task = %self.name, claimed = items.len(), claim = %claim_id, "consuming send queue");

        for item in &items {
            if past_deadline(deadline) {
                // Remaining claims expire and return to pending.
                return Ok(TaskOutcome::DeadlineExceeded);
            }

            match ctx
                .transfers
                .drive_outgoing(item.outgoing_transfer_id, deadline)
                .await
            {
                Ok(TransferStatus::Completed) => {
                    ctx.state
                        .catalog
                        .settle_queue_item(item.id, QueueItemStatus::Done)
                        .await?;
                }
                Ok(TransferStatus::Failed) | Ok(TransferStatus::Cancelled) => {
                    ctx.state
                        .catalog
                        .settle_queue_item(item.id, QueueItemStatus::Failed)
                        .await?;
                }
                Ok(status) => {
                    tracing::debug!(
                        item = item.id,
                        transfer = %item.outgoing_transfer_id,
                        status = %status,
                        "transfer still in flight, leaving item claimed"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        item = item.id,
                        transfer = %item.outgoing_transfer_id,
                        error = %e,
                        "failed to drive transfer, leaving item claimed"
                    );
                }
            }
        }

        Ok(TaskOutcome::Completed)
    }
}
