//! Rolling deletion.
//!
//! Removes local instances older than an age threshold once enough peers
//! hold verified copies. Two independent gates must open: the federation
//! gate (at least `number_of_remote_copies` peers whose verified checksum
//! matches, and never the last copy anywhere) and the per-instance
//! deletion policy (unless `force_deletion`). Blocked candidates are
//! revisited every tick; once a candidate has been deletion-eligible for
//! over a day and is still blocked, the operator is notified.

use super::{past_deadline, Task, TaskContext, TaskError, TaskOutcome, TaskResult};
use crate::metrics;
use crate::notify::Event;
use archivist_catalog::Catalog;
use archivist_core::config::RollingDeletionConfig;
use archivist_core::DeletionPolicy;
use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

/// Grace period before a blocked candidate is reported.
const BLOCKED_NOTIFY_AFTER: Duration = Duration::hours(24);

pub struct RollingDeletion {
    config: RollingDeletionConfig,
    name: String,
}

impl RollingDeletion {
    pub fn new(config: RollingDeletionConfig) -> Self {
        let name = config
            .task_name
            .clone()
            .unwrap_or_else(|| "rolling_deletion".to_string());
        Self { config, name }
    }

    /// Report a blocked candidate once it has been eligible for deletion
    /// for more than the grace period. Eligibility time is derived from
    /// the instance age, so the clock survives restarts.
    fn note_blocked(
        &self,
        ctx: &TaskContext,
        eligible_at: OffsetDateTime,
        file: &str,
        verified: u64,
        now: OffsetDateTime,
    ) {
        if now - eligible_at >= BLOCKED_NOTIFY_AFTER {
            ctx.state.notifier.notify(Event::DeletionBlocked {
                file: file.to_string(),
                store: self.config.store_name.clone(),
                verified_copies: verified,
                required: self.config.number_of_remote_copies as u64,
            });
        }
    }
}

#[async_trait]
impl Task for RollingDeletion {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext, deadline: OffsetDateTime) -> TaskResult<TaskOutcome> {
        let store = ctx
            .state
            .catalog
            .get_store(&self.config.store_name)
            .await?
            .ok_or_else(|| {
                TaskError::Config(format!(
                    "store {} does not exist, update configuration",
                    self.config.store_name
                ))
            })?;
        let backend = ctx.state.stores.get(&store.name)?;

        let age = Duration::days(self.config.age_in_days as i64);
        let cutoff = OffsetDateTime::now_utc() - age;
        let candidates = ctx
            .state
            .catalog
            .instances_on_store_older_than(store.id, cutoff)
            .await?;

        tracing::info!(
            task = %self.name,
            store = %store.name,
            candidates = candidates.len(),
            required_copies = self.config.number_of_remote_copies,
            "evaluating rolling deletion candidates"
        );

        for instance in &candidates {
            if past_deadline(deadline) {
                return Ok(TaskOutcome::DeadlineExceeded);
            }

            let Some(file) = ctx.state.catalog.get_file(&instance.file_name).await? else {
                tracing::error!(instance = instance.id, file = %instance.file_name, "candidate references missing file row");
                continue;
            };
            let expected = file.checksum()?;
            let eligible_at = instance.created_at + age;

            // Gate one: per-instance policy, unless forced.
            if !self.config.force_deletion
                && instance.deletion_policy()? == DeletionPolicy::Disallowed
            {
                tracing::debug!(instance = instance.id, file = %file.name, "deletion disallowed by policy, skipping");
                continue;
            }

            // Gate two: verified remote redundancy.
            if self.config.verify_downstream_checksums {
                for remote in ctx
                    .state
                    .catalog
                    .remote_instances_for_file(&file.name)
                    .await?
                {
                    let Some(librarian) = ctx
                        .state
                        .catalog
                        .get_librarian_by_id(remote.librarian_id)
                        .await?
                    else {
                        continue;
                    };
                    let peer = ctx.state.peers.peer_for(&librarian);
                    match peer.verify_checksum(&file.name).await {
                        Ok(response) => {
                            ctx.state
                                .catalog
                                .update_remote_verification(
                                    remote.id,
                                    &response.checksum,
                                    response.verified_at,
                                )
                                .await?;
                        }
                        Err(e) => {
                            tracing::warn!(
                                file = %file.name,
                                librarian = %librarian.name,
                                error = %e,
                                "downstream checksum verification failed"
                            );
                        }
                    }
                }
            }

            let verified = ctx
                .state
                .catalog
                .count_verified_remote_copies(&file.name, &expected)
                .await?;
            let other_locals = ctx
                .state
                .catalog
                .available_instances_for_file(&file.name)
                .await?
                .iter()
                .filter(|i| i.id != instance.id)
                .count() as u64;

            let now = OffsetDateTime::now_utc();
            if verified < self.config.number_of_remote_copies as u64 {
                tracing::info!(
                    instance = instance.id,
                    file = %file.name,
                    verified,
                    required = self.config.number_of_remote_copies,
                    "insufficient verified remote copies, deletion blocked"
                );
                self.note_blocked(ctx, eligible_at, &file.name, verified, now);
                continue;
            }
            // Whatever the configured threshold, never remove the last
            // copy in the federation.
            if verified + other_locals == 0 {
                tracing::warn!(instance = instance.id, file = %file.name, "would delete the last copy in the federation, blocked");
                self.note_blocked(ctx, eligible_at, &file.name, verified, now);
                continue;
            }

            backend.delete(&instance.path).await?;
            if self.config.mark_unavailable {
                ctx.state
                    .catalog
                    .mark_instance_unavailable(instance.id)
                    .await?;
            } else {
                ctx.state.catalog.remove_instance(instance.id).await?;
            }
            metrics::INSTANCES_DELETED.inc();
            tracing::info!(
                task = %self.name,
                instance = instance.id,
                file = %file.name,
                store = %store.name,
                verified,
                "instance deleted by rolling deletion"
            );
        }

        Ok(TaskOutcome::Completed)
    }
}
