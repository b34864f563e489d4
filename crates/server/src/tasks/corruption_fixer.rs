//! Corruption remediation.
//!
//! Two phases over the corrupt-files table. Phase one re-checks each
//! pending detection (files get fixed behind our back), then asks the
//! file's origin librarian to resend a fresh copy through the normal
//! transfer protocol. Phase two watches the replacement transfers land
//! and clears the rows, re-arming any whose transfer failed.

use super::{past_deadline, Task, TaskContext, TaskOutcome, TaskResult};
use crate::metrics;
use archivist_catalog::Catalog;
use archivist_catalog::models::CorruptFileRow;
use archivist_core::config::CorruptionFixerConfig;
use archivist_core::rpc::ResendFileRequest;
use archivist_core::TransferStatus;
use async_trait::async_trait;
use time::OffsetDateTime;

pub struct CorruptionFixer {
    name: String,
}

impl CorruptionFixer {
    pub fn new(config: CorruptionFixerConfig) -> Self {
        let name = config
            .task_name
            .unwrap_or_else(|| "corruption_fixer".to_string());
        Self { name }
    }

    /// Phase one for a single row. Returns true if the row was resolved or
    /// a replacement was requested.
    async fn remediate(&self, ctx: &TaskContext, corrupt: &CorruptFileRow) -> TaskResult<bool> {
        let file = ctx.state.catalog.get_file(&corrupt.file_name).await?;
        let mut instance = ctx.state.catalog.get_instance(corrupt.instance_id).await?;

        // The flagged instance may be gone while the file was re-ingested;
        // check the file's current first instance instead.
        if instance.is_none() {
            if let Some(file) = &file {
                instance = ctx
                    .state
                    .catalog
                    .available_instances_for_file(&file.name)
                    .await?
                    .into_iter()
                    .next();
            }
        }

        // Step A: is the file actually still corrupt?
        if let (Some(file), Some(instance)) = (&file, &instance) {
            let expected = file.checksum()?;
            if let Some(store) = ctx.state.catalog.get_store_by_id(instance.store_id).await? {
                if let Ok(backend) = ctx.state.stores.get(&store.name) {
                    if let Ok(info) = backend.path_info(&instance.path).await {
                        if info.checksum == expected {
                            tracing::info!(
                                corrupt = corrupt.id,
                                file = %file.name,
                                "bytes verify clean, file was fixed behind our back; clearing row"
                            );
                            ctx.state.catalog.delete_corrupt_file(corrupt.id).await?;
                            return Ok(true);
                        }
                    }
                }
            }

            // Any available instance other than the one we just examined
            // could be a healthy copy; re-requesting would destroy its
            // rows, so leave those for a manual remedy.
            let healthy_others = ctx
                .state
                .catalog
                .available_instances_for_file(&file.name)
                .await?
                .iter()
                .filter(|i| i.id != instance.id)
                .count();
            if healthy_others > 0 {
                tracing::error!(
                    corrupt = corrupt.id,
                    file = %file.name,
                    others = healthy_others,
                    "file has further instances, needs manual remedy"
                );
                return Ok(false);
            }
        }

        // The file really is corrupt (or its bytes are gone). Ask the
        // origin for a fresh copy.
        let Some(origin) = ctx.state.catalog.get_librarian(&corrupt.file_source).await? else {
            tracing::error!(
                corrupt = corrupt.id,
                file = %corrupt.file_name,
                source = %corrupt.file_source,
                "no librarian row for the file's origin, cannot request a new copy"
            );
            return Ok(false);
        };
        if origin.name == ctx.state.name() {
            tracing::error!(
                corrupt = corrupt.id,
                file = %corrupt.file_name,
                "we are the origin of this file, nobody upstream to ask"
            );
            return Ok(false);
        }

        let peer = ctx.state.peers.peer_for(&origin);
        if let Err(e) = peer.ping().await {
            tracing::warn!(
                corrupt = corrupt.id,
                origin = %origin.name,
                error = %e,
                "origin unreachable, retrying next tick"
            );
            return Ok(false);
        }

        // Clear out the bad rows and bytes so the replacement ingests
        // cleanly. Must happen before the resend request: the origin's
        // push lands as a brand-new file.
        if let Some(instance) = &instance {
            if let Some(store) = ctx.state.catalog.get_store_by_id(instance.store_id).await? {
                if let Ok(backend) = ctx.state.stores.get(&store.name) {
                    backend.delete(&instance.path).await?;
                }
            }
        }
        if file.is_some() {
            ctx.state.catalog.delete_file(&corrupt.file_name).await?;
        }

        let request = ResendFileRequest {
            file_name: corrupt.file_name.clone(),
            destination_librarian: ctx.state.name().to_string(),
        };
        match peer.resend_file(&request).await {
            Ok(response) => {
                ctx.state
                    .catalog
                    .mark_replacement_requested(
                        corrupt.id,
                        *response.source_transfer_id.as_uuid(),
                    )
                    .await?;
                tracing::info!(
                    corrupt = corrupt.id,
                    file = %corrupt.file_name,
                    origin = %origin.name,
                    source_transfer = %response.source_transfer_id,
                    "replacement copy requested"
                );
                Ok(true)
            }
            Err(e) => {
                tracing::error!(
                    corrupt = corrupt.id,
                    file = %corrupt.file_name,
                    origin = %origin.name,
                    error = %e,
                    "resend request failed; rows are gone and will be restored by a later attempt"
                );
                Ok(false)
            }
        }
    }

    /// Phase two for a single row: did the replacement land?
    async fn check_replacement(
        &self,
        ctx: &TaskContext,
        corrupt: &CorruptFileRow,
    ) -> TaskResult<()> {
        let Some(repair_id) = corrupt.repair_transfer_id else {
            ctx.state.catalog.reset_replacement_request(corrupt.id).await?;
            return Ok(());
        };
        let Some(origin) = ctx.state.catalog.get_librarian(&corrupt.file_source).await? else {
            return Ok(());
        };

        let transfer = ctx
            .state
            .catalog
            .get_incoming_by_source(origin.id, repair_id)
            .await?;

        let file_restored = ctx
            .state
            .catalog
            .get_file(&corrupt.file_name)
            .await?
            .is_some();

        let fixed = match transfer.as_ref().map(|t| t.transfer_status()).transpose()? {
            Some(TransferStatus::Completed) => true,
            Some(TransferStatus::Failed) | Some(TransferStatus::Cancelled) => {
                if file_restored {
                    tracing::info!(
                        corrupt = corrupt.id,
                        file = %corrupt.file_name,
                        "replacement transfer died but the file was ingested anyway"
                    );
                    true
                } else {
                    tracing::warn!(
                        corrupt = corrupt.id,
                        file = %corrupt.file_name,
                        "replacement transfer failed, re-arming for another request"
                    );
                    ctx.state.catalog.reset_replacement_request(corrupt.id).await?;
                    false
                }
            }
            // Not arrived or still moving; check again next tick.
            _ => file_restored,
        };

        if fixed {
            tracing::info!(
                corrupt = corrupt.id,
                file = %corrupt.file_name,
                "replacement copy confirmed, clearing corrupt row"
            );
            ctx.state.catalog.delete_corrupt_file(corrupt.id).await?;
            metrics::CORRUPT_FILES_REPAIRED.inc();
        }
        Ok(())
    }
}

#[async_trait]
impl Task for CorruptionFixer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext, deadline: OffsetDateTime) -> TaskResult<TaskOutcome> {
        let pending = ctx.state.catalog.corrupt_files_pending().await?;
        tracing::info!(task = %self.name, pending = pending.len(), "remediating corrupt files");

        for corrupt in &pending {
            if past_deadline(deadline) {
                return Ok(TaskOutcome::DeadlineExceeded);
            }
            if let Err(e) = self.remediate(ctx, corrupt).await {
                tracing::error!(corrupt = corrupt.id, file = %corrupt.file_name, error = %e, "remediation attempt errored");
            }
        }

        let awaiting = ctx.state.catalog.corrupt_files_awaiting_replacement().await?;
        for corrupt in &awaiting {
            if past_deadline(deadline) {
                return Ok(TaskOutcome::DeadlineExceeded);
            }
            if let Err(e) = self.check_replacement(ctx, corrupt).await {
                tracing::error!(corrupt = corrupt.id, file = %corrupt.file_name, error = %e, "replacement check errored");
            }
        }

        Ok(TaskOutcome::Completed)
    }
}
