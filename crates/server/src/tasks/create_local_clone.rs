//! Store-to-store clone.
//!
//! Copies files that live only on the source store onto the first enabled
//! destination with room. At most one new instance is created per file
//! across the whole destination list. This is also the first half of a
//! SneakerNet move: clone onto the drive store, then swap the drive.

use super::{past_deadline, Task, TaskContext, TaskOutcome, TaskResult};
use crate::notify::Event;
use archivist_catalog::Catalog;
use archivist_catalog::models::{FileRow, NewInstance};
use archivist_core::config::CreateLocalCloneConfig;
use archivist_storage::StorageError;
use async_trait::async_trait;
use bytes::Bytes;
use time::{Duration, OffsetDateTime};

pub struct CreateLocalClone {
    config: CreateLocalCloneConfig,
    name: String,
}

impl CreateLocalClone {
    pub fn new(config: CreateLocalCloneConfig) -> Self {
        let name = config
            .task_name
            .clone()
            .unwrap_or_else(|| "create_local_clone".to_string());
        Self { config, name }
    }

    /// Try to place one file on one destination. `Ok(true)` means an
    /// instance was created; `Ok(false)` means this destination cannot
    /// take it and the next should be tried.
    async fn clone_to_destination(
        &self,
        ctx: &TaskContext,
        file: &FileRow,
        data: &Bytes,
        source_policy: archivist_core::DeletionPolicy,
        dest_name: &str,
    ) -> TaskResult<bool> {
        // Re-read per file: a destination disabled mid-run stays skipped.
        let Some(dest) = ctx.state.catalog.get_store(dest_name).await? else {
            tracing::error!(store = %dest_name, "clone destination does not exist");
            return Ok(false);
        };
        if !dest.enabled {
            return Ok(false);
        }
        let backend = ctx.state.stores.get(dest_name)?;

        let handle = match backend.stage(&file.name, data.len() as u64).await {
            Ok(handle) => handle,
            Err(StorageError::CapacityExceeded { needed, free }) => {
                if self.config.disable_store_on_full {
                    tracing::warn!(
                        store = %dest_name,
                        needed,
                        free,
                        "destination full, disabling store"
                    );
                    ctx.state.catalog.set_store_enabled(dest.id, false).await?;
                    ctx.state.notifier.notify(Event::StoreDisabled {
                        store: dest_name.to_string(),
                    });
                }
                return Ok(false);
            }
            Err(e) => {
                tracing::error!(store = %dest_name, file = %file.name, error = %e, "stage failed");
                return Ok(false);
            }
        };

        backend.write(&handle, data.clone()).await?;
        let expected = file.checksum()?;
        let committed = match backend.commit(&handle, &file.name, &expected).await {
            Ok(committed) => committed,
            Err(e) => {
                tracing::error!(store = %dest_name, file = %file.name, error = %e, "commit failed");
                backend.abort(&handle).await?;
                return Ok(false);
            }
        };

        let instance = NewInstance {
            file_name: file.name.clone(),
            store_id: dest.id,
            path: committed.path.clone(),
            // The clone carries the source instance's policy.
            deletion_policy: source_policy,
            created_at: OffsetDateTime::now_utc(),
        };
        if let Err(e) = ctx.state.catalog.create_instance(&instance).await {
            tracing::error!(store = %dest_name, file = %file.name, error = %e, "instance row rejected, removing bytes");
            backend.delete(&committed.path).await?;
            return Ok(false);
        }

        tracing::info!(
            task = %self.name,
            file = %file.name,
            from = %self.config.clone_from,
            to = %dest_name,
            "local clone created"
        );
        Ok(true)
    }
}

#[async_trait]
impl Task for CreateLocalClone {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext, deadline: OffsetDateTime) -> TaskResult<TaskOutcome> {
        let source = ctx
            .state
            .catalog
            .get_store(&self.config.clone_from)
            .await?
            .ok_or_else(|| {
                super::TaskError::Config(format!(
                    "store {} does not exist, update configuration",
                    self.config.clone_from
                ))
            })?;
        let source_backend = ctx.state.stores.get(&source.name)?;

        let cutoff = OffsetDateTime::now_utc() - Duration::days(self.config.age_in_days as i64);
        let files = ctx
            .state
            .catalog
            .files_only_on_store(source.id, cutoff, self.config.files_per_run)
            .await?;

        tracing::info!(
            task = %self.name,
            source = %source.name,
            candidates = files.len(),
            "cloning single-copy files"
        );

        for file in &files {
            if past_deadline(deadline) {
                return Ok(TaskOutcome::DeadlineExceeded);
            }

            let instances = ctx
                .state
                .catalog
                .available_instances_for_file(&file.name)
                .await?;
            let Some(source_instance) = instances.iter().find(|i| i.store_id == source.id) else {
                continue;
            };
            let source_policy = source_instance.deletion_policy()?;

            let data = match source_backend.read(&source_instance.path).await {
                Ok(data) => data,
                Err(e) => {
                    tracing::error!(file = %file.name, error = %e, "failed to read source instance");
                    continue;
                }
            };

            for dest_name in &self.config.clone_to {
                match self
                    .clone_to_destination(ctx, file, &data, source_policy, dest_name)
                    .await
                {
                    Ok(true) => break,
                    Ok(false) => continue,
                    Err(e) => {
                        tracing::error!(file = %file.name, store = %dest_name, error = %e, "clone attempt errored");
                        continue;
                    }
                }
            }
        }

        Ok(TaskOutcome::Completed)
    }
}
