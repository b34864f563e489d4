//! Reconciliation hypervisors.
//!
//! Transfers stall when a peer dies mid-protocol or a process restarts
//! with work in flight. These tasks sweep transfers older than an age
//! threshold, ask the other side what it thinks, and either finish the
//! job or fail it and reclaim staging space. A third task collapses
//! duplicate remote-instance rows left by drifting peers.

use super::{past_deadline, Task, TaskContext, TaskOutcome, TaskResult};
use crate::handlers::clone::{commit_clone, staging_parts};
use crate::metrics;
use crate::peer::PeerError;
use archivist_catalog::models::{IncomingTransferRow, IncomingTransferUpdates};
use archivist_catalog::Catalog;
use archivist_catalog::CatalogError;
use archivist_core::config::{
    DuplicateRemoteInstanceHypervisorConfig, IncomingTransferHypervisorConfig,
    OutgoingTransferHypervisorConfig,
};
use archivist_core::{DeletionPolicy, TransferStatus};
use async_trait::async_trait;
use time::{Duration, OffsetDateTime};

/// Fail a stuck incoming transfer and reclaim its staging space.
async fn fail_incoming(ctx: &TaskContext, transfer: &IncomingTransferRow) -> TaskResult<()> {
    let status = transfer.transfer_status()?;
    if !status.is_terminal() {
        match ctx
            .state
            .catalog
            .transition_incoming(
                transfer.id,
                status,
                TransferStatus::Failed,
                &IncomingTransferUpdates::default(),
                OffsetDateTime::now_utc(),
            )
            .await
        {
            Ok(()) => metrics::TRANSFERS_FAILED.inc(),
            Err(CatalogError::StaleState { .. }) => return Ok(()),
            Err(e) => return Err(e.into()),
        }
    }
    if let Ok((_, backend, handle)) = staging_parts(&ctx.state, transfer).await {
        backend.abort(&handle).await?;
    }
    Ok(())
}

/// Ages out stuck incoming transfers by asking the origin librarian what
/// became of its outgoing side.
pub struct IncomingTransferHypervisor {
    config: IncomingTransferHypervisorConfig,
    name: String,
}

impl IncomingTransferHypervisor {
    pub fn new(config: IncomingTransferHypervisorConfig) -> Self {
        let name = config
            .task_name
            .clone()
            .unwrap_or_else(|| "incoming_transfer_hypervisor".to_string());
        Self { config, name }
    }
}

#[async_trait]
impl Task for IncomingTransferHypervisor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext, deadline: OffsetDateTime) -> TaskResult<TaskOutcome> {
        let cutoff = OffsetDateTime::now_utc() - Duration::days(self.config.age_in_days as i64);
        let stale = ctx.state.catalog.stale_incoming(cutoff).await?;
        if !stale.is_empty() {
            tracing::info!(task = %self.name, count = stale.len(), "reconciling stale incoming transfers");
        }

        for transfer in &stale {
            if past_deadline(deadline) {
                return Ok(TaskOutcome::DeadlineExceeded);
            }

            let Some(source) = ctx
                .state
                .catalog
                .get_librarian_by_id(transfer.source_librarian_id)
                .await?
            else {
                tracing::error!(transfer = %transfer.id, "source librarian missing, failing transfer");
                fail_incoming(ctx, transfer).await?;
                continue;
            };

            // Ingest uploads have no peer to ask; aging out is final.
            if source.name == ctx.state.name() {
                tracing::warn!(transfer = %transfer.id, file = %transfer.file_name, "ingest upload aged out");
                fail_incoming(ctx, transfer).await?;
                continue;
            }

            let peer = ctx.state.peers.peer_for(&source);
            let origin_status = match peer
                .transfer_status(transfer.source_transfer_id.into())
                .await
            {
                Ok(response) => response.status,
                Err(PeerError::Unreachable(reason)) => {
                    tracing::warn!(transfer = %transfer.id, source = %source.name, reason = %reason, "origin unreachable, leaving for next sweep");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(transfer = %transfer.id, source = %source.name, error = %e, "origin cannot account for transfer, failing");
                    fail_incoming(ctx, transfer).await?;
                    continue;
                }
            };

            let local_status = transfer.transfer_status()?;
            match origin_status {
                TransferStatus::Failed | TransferStatus::Cancelled => {
                    tracing::info!(transfer = %transfer.id, origin_status = %origin_status, "origin gave up, failing local side");
                    fail_incoming(ctx, transfer).await?;
                }
                TransferStatus::Completed if local_status == TransferStatus::Staged => {
                    match commit_clone(&ctx.state, transfer.id, DeletionPolicy::Disallowed).await {
                        Ok(_) => {
                            tracing::info!(transfer = %transfer.id, "committed staged transfer the origin already completed");
                        }
                        Err(e) => {
                            tracing::error!(transfer = %transfer.id, error = %e, "commit failed, failing transfer");
                            fail_incoming(ctx, transfer).await?;
                        }
                    }
                }
                _ => {
                    tracing::warn!(
                        transfer = %transfer.id,
                        local_status = %local_status,
                        origin_status = %origin_status,
                        "stale transfer cannot make progress, failing"
                    );
                    fail_incoming(ctx, transfer).await?;
                }
            }
        }

        Ok(TaskOutcome::Completed)
    }
}

/// Ages out stuck outgoing transfers by asking the destination.
pub struct OutgoingTransferHypervisor {
    config: OutgoingTransferHypervisorConfig,
    name: String,
}

impl OutgoingTransferHypervisor {
    pub fn new(config: OutgoingTransferHypervisorConfig) -> Self {
        let name = config
            .task_name
            .clone()
            .unwrap_or_else(|| "outgoing_transfer_hypervisor".to_string());
        Self { config, name }
    }
}

#[async_trait]
impl Task for OutgoingTransferHypervisor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext, deadline: OffsetDateTime) -> TaskResult<TaskOutcome> {
        let cutoff = OffsetDateTime::now_utc() - Duration::days(self.config.age_in_days as i64);
        let stale = ctx.state.catalog.stale_outgoing(cutoff).await?;
        if !stale.is_empty() {
            tracing::info!(task = %self.name, count = stale.len(), "reconciling stale outgoing transfers");
        }

        for transfer in &stale {
            if past_deadline(deadline) {
                return Ok(TaskOutcome::DeadlineExceeded);
            }
            let local_status = transfer.transfer_status()?;

            // Never prepared on the remote side; nothing to reconcile.
            let Some(remote_id) = transfer.remote_transfer_id else {
                tracing::warn!(transfer = %transfer.id, "stale transfer never reached the destination, failing");
                ctx.transfers.fail(transfer.id, local_status).await?;
                continue;
            };

            let Some(destination) = ctx
                .state
                .catalog
                .get_librarian_by_id(transfer.destination_id)
                .await?
            else {
                ctx.transfers.fail(transfer.id, local_status).await?;
                continue;
            };
            let peer = ctx.state.peers.peer_for(&destination);

            let remote_status = match peer.transfer_status(remote_id.into()).await {
                Ok(response) => response.status,
                Err(PeerError::Unreachable(reason)) => {
                    tracing::warn!(transfer = %transfer.id, destination = %destination.name, reason = %reason, "destination unreachable, leaving for next sweep");
                    continue;
                }
                Err(e) => {
                    tracing::warn!(transfer = %transfer.id, destination = %destination.name, error = %e, "destination cannot account for transfer, failing");
                    ctx.transfers.fail(transfer.id, local_status).await?;
                    continue;
                }
            };

            match remote_status {
                TransferStatus::Completed => {
                    // The destination committed on its own (receive sweep);
                    // fetch the record and close out our side.
                    match peer.commit_transfer(remote_id.into()).await {
                        Ok(response) => {
                            ctx.transfers
                                .register_completion(
                                    transfer,
                                    &destination,
                                    &response.remote_instance.checksum,
                                )
                                .await?;
                        }
                        Err(e) => {
                            tracing::error!(transfer = %transfer.id, error = %e, "destination completed but returned no record, failing");
                            ctx.transfers.fail(transfer.id, local_status).await?;
                        }
                    }
                }
                TransferStatus::Failed | TransferStatus::Cancelled => {
                    tracing::info!(transfer = %transfer.id, remote_status = %remote_status, "destination gave up, failing local side");
                    ctx.transfers.fail(transfer.id, local_status).await?;
                }
                _ => {
                    tracing::warn!(
                        transfer = %transfer.id,
                        local_status = %local_status,
                        remote_status = %remote_status,
                        "stale transfer cannot make progress, failing and cancelling remote"
                    );
                    if let Err(e) = peer.cancel_transfer(remote_id.into()).await {
                        tracing::warn!(transfer = %transfer.id, error = %e, "remote cancel failed");
                    }
                    ctx.transfers.fail(transfer.id, local_status).await?;
                }
            }
        }

        Ok(TaskOutcome::Completed)
    }
}

/// Collapses duplicate remote-instance rows, keeping the latest per
/// (file, librarian).
pub struct DuplicateRemoteInstanceHypervisor {
    name: String,
}

impl DuplicateRemoteInstanceHypervisor {
    pub fn new(config: DuplicateRemoteInstanceHypervisorConfig) -> Self {
        let name = config
            .task_name
            .unwrap_or_else(|| "duplicate_remote_instance_hypervisor".to_string());
        Self { name }
    }
}

#[async_trait]
impl Task for DuplicateRemoteInstanceHypervisor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self, ctx: &TaskContext, deadline: OffsetDateTime) -> TaskResult<TaskOutcome> {
        let duplicates = ctx.state.catalog.duplicate_remote_instances().await?;
        if duplicates.is_empty() {
            return Ok(TaskOutcome::Completed);
        }

        tracing::warn!(task = %self.name, count = duplicates.len(), "collapsing duplicate remote instances");
        for duplicate in &duplicates {
            if past_deadline(deadline) {
                return Ok(TaskOutcome::DeadlineExceeded);
            }
            ctx.state
                .catalog
                .delete_remote_instance(duplicate.id)
                .await?;
            tracing::debug!(
                file = %duplicate.file_name,
                librarian = duplicate.librarian_id,
                row = duplicate.id,
                "removed superseded remote instance row"
            );
        }

        Ok(TaskOutcome::Completed)
    }
}
