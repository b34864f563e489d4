//! Store integrity check.
//!
//! Recomputes checksums of recently created instances on one store and
//! flags mismatches. Older instances are assumed to have been checked on a
//! previous pass. A fresh-enough cached measurement is reused instead of
//! rehashing the bytes.

use super::{past_deadline, Task, TaskContext, TaskError, TaskOutcome, TaskResult};
use crate::metrics;
use crate::notify::Event;
use archivist_catalog::Catalog;
use archivist_catalog::models::InstanceRow;
use archivist_core::config::CheckIntegrityConfig;
use archivist_core::Checksum;
use archivist_storage::{PathInfo, StorageError};
use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

pub struct CheckIntegrity {
    config: CheckIntegrityConfig,
    name: String,
}

impl CheckIntegrity {
    pub fn new(config: CheckIntegrityConfig) -> Self {
        let name = config
            .task_name
            .clone()
            .unwrap_or_else(|| "check_integrity".to_string());
        Self { config, name }
    }

    /// Reuse the cached measurement when it is newer than the configured
    /// timeout; otherwise rehash the bytes and refresh the cache.
    async fn measure(
        &self,
        ctx: &TaskContext,
        instance: &InstanceRow,
        store_name: &str,
        now: OffsetDateTime,
    ) -> TaskResult<PathInfo> {
        if let (Some(cached), Some(size), Some(measured_at)) = (
            instance.calculated_checksum.as_deref(),
            instance.calculated_size,
            instance.checksum_time,
        ) {
            if now - measured_at < ctx.state.checksum_cache_timeout() {
                return Ok(PathInfo {
                    size: size as u64,
                    checksum: Checksum::parse(cached)?,
                });
            }
        }

        let backend = ctx.state.stores.get(store_name)?;
        let info = backend.path_info(&instance.path).await?;
        ctx.state
            .catalog
            .update_instance_checksum_cache(instance.id, &info.checksum, info.size as i64, now)
            .await?;
        Ok(info)
    }

    async fn flag_corrupt(
        &self,
        ctx: &TaskContext,
        instance: &InstanceRow,
        file_source: &str,
        now: OffsetDateTime,
    ) -> TaskResult<()> {
        ctx.state
            .catalog
            .mark_instance_unavailable(instance.id)
            .await?;
        ctx.state
            .catalog
            .record_corrupt_file(
                &instance.file_name,
                file_source,
                instance.id,
                "integrity_check",
                now,
            )
            .await?;
        ctx.state.notifier.notify(Event::FileCorrupt {
            file: instance.file_name.clone(),
            instance_id: instance.id,
            detector: "integrity_check".to_string(),
        });
        metrics::CORRUPT_FILES_DETECTED.inc();
        Ok(())
    }
}

#[async_trait]
impl Task for CheckIntegrity {
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

        let now = OffsetDateTime::now_utc();
        let since = now - Duration::days(self.config.age_in_days as i64);
        let instances = ctx
            .state
            .catalog
            .instances_on_store_since(store.id, since)
            .await?;

        tracing::info!(
            task = %self.name,
            store = %store.name,
            instances = instances.len(),
            since = %since,
            "checking store integrity"
        );

        let mut all_fine = true;
        for instance in &instances {
            if past_deadline(deadline) {
                return Ok(TaskOutcome::DeadlineExceeded);
            }
            if !instance.available {
                continue;
            }

            let Some(file) = ctx.state.catalog.get_file(&instance.file_name).await? else {
                tracing::error!(instance = instance.id, file = %instance.file_name, "instance references missing file row");
                all_fine = false;
                continue;
            };
            let expected = file.checksum()?;

            let now = OffsetDateTime::now_utc();
            match self.measure(ctx, instance, &store.name, now).await {
                Ok(info) if info.checksum == expected => {
                    tracing::debug!(instance = instance.id, path = %instance.path, "instance validated");
                }
                Ok(info) => {
                    all_fine = false;
                    tracing::error!(
                        instance = instance.id,
                        path = %instance.path,
                        store = %store.name,
                        expected = %expected,
                        actual = %info.checksum,
                        "instance has an incorrect checksum"
                    );
                    self.flag_corrupt(ctx, instance, &file.source_librarian, now)
                        .await?;
                }
                Err(TaskError::Storage(StorageError::NotFound(_))) => {
                    all_fine = false;
                    tracing::error!(
                        instance = instance.id,
                        path = %instance.path,
                        store = %store.name,
                        "instance is missing on disk"
                    );
                    self.flag_corrupt(ctx, instance, &file.source_librarian, now)
                        .await?;
                }
                Err(e) => {
                    all_fine = false;
                    tracing::error!(instance = instance.id, error = %e, "failed to measure instance");
                }
            }
        }

        if all_fine {
            tracing::info!(task = %self.name, store = %store.name, "all recent instances validated");
        } else {
            tracing::error!(task = %self.name, store = %store.name, "store has instances with incorrect checksums");
        }
        Ok(TaskOutcome::Completed)
    }
}
