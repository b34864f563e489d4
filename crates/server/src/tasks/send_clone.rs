//! Outbound clone intent generation.
//!
//! Picks files the destination librarian lacks, opens an outgoing transfer
//! for each and enqueues it. The queue consumer moves the bytes later;
//! deciding to send and actually sending are separate steps.

use super::{past_deadline, Task, TaskContext, TaskError, TaskOutcome, TaskResult};
use crate::notify::Event;
use archivist_catalog::models::NewOutgoingTransfer;
use archivist_catalog::Catalog;
use archivist_catalog::CatalogError;
use archivist_core::config::SendCloneConfig;
use archivist_core::Transport;
use async_trait::async_trait;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

pub struct SendClone {
    config: SendCloneConfig,
    name: String,
}

impl SendClone {
    pub fn new(config: SendCloneConfig) -> Self {
        let name = config
            .task_name
            .clone()
            .unwrap_or_else(|| "send_clone".to_string());
        Self { config, name }
    }
}

#[async_trait]
impl Task for SendClone {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext, deadline: OffsetDateTime) -> TaskResult<TaskOutcome> {
        let destination = ctx
            .state
            .catalog
            .get_librarian(&self.config.destination_librarian)
            .await?
            .ok_or_else(|| {
                TaskError::Config(format!(
                    "librarian {} does not exist, update configuration",
                    self.config.destination_librarian
                ))
            })?;

        let now = OffsetDateTime::now_utc();
        if !destination.transfers_enabled {
            if let Some(since) = destination.disabled_since {
                let warn_after = Duration::days(self.config.warn_disabled_timer as i64);
                if now - since > warn_after {
                    ctx.state.notifier.notify(Event::PeerTransfersDisabled {
                        librarian: destination.name.clone(),
                        since,
                    });
                }
            }
            tracing::info!(
                task = %self.name,
                destination = %destination.name,
                "destination has transfers disabled, nothing queued"
            );
            return Ok(TaskOutcome::Completed);
        }

        let transport = if destination.supports(Transport::Network) {
            Transport::Network
        } else if destination.supports(Transport::Sneakernet) {
            Transport::Sneakernet
        } else {
            return Err(TaskError::Config(format!(
                "librarian {} has no enabled transport",
                destination.name
            )));
        };

        let source_store_id = match self.config.store_preference.as_deref() {
            Some(name) => Some(
                ctx.state
                    .catalog
                    .get_store(name)
                    .await?
                    .ok_or_else(|| {
                        TaskError::Config(format!("store {name} does not exist"))
                    })?
                    .id,
            ),
            None => None,
        };

        let cutoff = now - Duration::days(self.config.age_in_days as i64);
        let files = ctx
            .state
            .catalog
            .files_lacking_remote_instance(destination.id, cutoff, self.config.send_batch_size)
            .await?;

        tracing::info!(
            task = %self.name,
            destination = %destination.name,
            candidates = files.len(),
            "queueing outbound clones"
        );

        let mut queued = 0u32;
        for file in &files {
            if past_deadline(deadline) {
                return Ok(TaskOutcome::DeadlineExceeded);
            }

            let transfer = NewOutgoingTransfer {
                id: Uuid::new_v4(),
                file_name: file.name.clone(),
                destination_id: destination.id,
                source_store_id,
                transport,
                created_at: OffsetDateTime::now_utc(),
            };
            let row = match ctx.state.catalog.create_outgoing(&transfer).await {
                Ok(row) => row,
                Err(CatalogError::Conflict(_)) => {
                    // Another task instance queued this file first.
                    continue;
                }
                Err(e) => return Err(e.into()),
            };
            ctx.state
                .catalog
                .enqueue_send(row.id, 0, OffsetDateTime::now_utc())
                .await?;
            queued += 1;
        }

        tracing::info!(task = %self.name, destination = %destination.name, queued, "outbound clones queued");
        Ok(TaskOutcome::Completed)
    }
}
