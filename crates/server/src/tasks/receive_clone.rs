//! Incoming clone promotion.
//!
//! Sweeps non-terminal incoming transfers: ongoing transfers whose staged
//! bytes verified are advanced, staged transfers are committed into a
//! store with this task's deletion policy. Covers sneakernet arrivals and
//! senders that never issue the commit RPC themselves; the sender's
//! hypervisor sees the completed state and registers its remote instance.

use super::{past_deadline, Task, TaskContext, TaskOutcome, TaskResult};
use crate::handlers::clone::{commit_clone, staged_clone};
use archivist_catalog::Catalog;
use archivist_core::config::ReceiveCloneConfig;
use archivist_core::{DeletionPolicy, TransferStatus};
use async_trait::async_trait;
use time::OffsetDateTime;

pub struct ReceiveClone {
    deletion_policy: DeletionPolicy,
    name: String,
}

impl ReceiveClone {
    pub fn new(config: ReceiveCloneConfig) -> Self {
        let name = config
            .task_name
            .unwrap_or_else(|| "receive_clone".to_string());
        Self {
            deletion_policy: config.deletion_policy,
            name,
        }
    }
}

#[async_trait]
impl Task for ReceiveClone {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext, deadline: OffsetDateTime) -> TaskResult<TaskOutcome> {
        // Ongoing first: a transfer promoted to staged here commits in the
        // same tick.
        let ongoing = ctx
            .state
            .catalog
            .incoming_by_status(TransferStatus::Ongoing)
            .await?;
        for transfer in &ongoing {
            if past_deadline(deadline) {
                return Ok(TaskOutcome::DeadlineExceeded);
            }
            match staged_clone(&ctx.state, transfer.id).await {
                Ok(response) => {
                    tracing::debug!(transfer = %transfer.id, status = %response.status, "checked staging progress");
                }
                Err(e) => {
                    tracing::error!(transfer = %transfer.id, error = %e, "failed to check staging progress");
                }
            }
        }

        let staged = ctx
            .state
            .catalog
            .incoming_by_status(TransferStatus::Staged)
            .await?;
        if staged.is_empty() && ongoing.is_empty() {
            tracing::debug!(task = %self.name, "no incoming transfers to process");
            return Ok(TaskOutcome::Completed);
        }

        for transfer in &staged {
            if past_deadline(deadline) {
                return Ok(TaskOutcome::DeadlineExceeded);
            }
            match commit_clone(&ctx.state, transfer.id, self.deletion_policy).await {
                Ok(response) => {
                    tracing::info!(
                        task = %self.name,
                        transfer = %transfer.id,
                        file = %response.remote_instance.file_name,
                        store = %response.remote_instance.store_name,
                        "incoming clone committed"
                    );
                }
                Err(e) => {
                    tracing::error!(transfer = %transfer.id, error = %e, "failed to commit incoming clone");
                }
            }
        }

        Ok(TaskOutcome::Completed)
    }
}
