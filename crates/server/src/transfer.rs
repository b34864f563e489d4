//! Outbound transfer engine.
//!
//! Drives one outgoing transfer through its state machine:
//! initiated -> (peer prepare) -> ongoing -> (byte push + peer staged)
//! -> staged -> (peer commit) -> completed, with failure arcs per state.
//! Every status change goes through the catalog's compare-and-set, so a
//! concurrent driver or hypervisor losing the race just observes stale
//! state and backs off.

use crate::metrics;
use crate::peer::{retry_to_deadline, PeerError};
use crate::state::AppState;
use crate::tasks::{TaskError, TaskResult};
use archivist_catalog::models::{LibrarianRow, OutgoingTransferRow, TransferUpdates};
use archivist_catalog::Catalog;
use archivist_catalog::CatalogError;
use archivist_core::rpc::PrepareTransferRequest;
use archivist_core::{Checksum, TransferStatus, Transport};
use time::OffsetDateTime;
use uuid::Uuid;

/// Drives outbound transfers against peer librarians.
pub struct TransferManager {
    state: AppState,
}

impl TransferManager {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Advance the transfer as far as possible before `deadline`, returning
    /// the status it ended up in. Peer unreachability leaves the transfer
    /// in its current state for a later attempt; protocol-level rejections
    /// fail it.
    pub async fn drive_outgoing(
        &self,
        id: Uuid,
        deadline: OffsetDateTime,
    ) -> TaskResult<TransferStatus> {
        loop {
            let row = self
                .state
                .catalog
                .get_outgoing(id)
                .await?
                .ok_or_else(|| TaskError::Missing(format!("outgoing transfer {id}")))?;
            let status = row.transfer_status()?;

            if status.is_terminal() || OffsetDateTime::now_utc() >= deadline {
                return Ok(status);
            }

            let advanced = match status {
                TransferStatus::Initiated => self.step_prepare(&row, deadline).await?,
                TransferStatus::Ongoing => self.step_push(&row, deadline).await?,
                TransferStatus::Staged => self.step_commit(&row, deadline).await?,
                _ => false,
            };

            if !advanced {
                let row = self
                    .state
                    .catalog
                    .get_outgoing(id)
                    .await?
                    .ok_or_else(|| TaskError::Missing(format!("outgoing transfer {id}")))?;
                return Ok(row.transfer_status()?);
            }
        }
    }

    async fn destination(&self, row: &OutgoingTransferRow) -> TaskResult<LibrarianRow> {
        self.state
            .catalog
            .get_librarian_by_id(row.destination_id)
            .await?
            .ok_or_else(|| TaskError::Missing(format!("librarian id {}", row.destination_id)))
    }

    /// initiated -> ongoing via the peer's prepare call.
    async fn step_prepare(
        &self,
        row: &OutgoingTransferRow,
        deadline: OffsetDateTime,
    ) -> TaskResult<bool> {
        let destination = self.destination(row).await?;
        if !destination.transfers_enabled {
            tracing::debug!(
                transfer = %row.id,
                destination = %destination.name,
                "destination has transfers disabled, leaving transfer initiated"
            );
            return Ok(false);
        }

        let file = self
            .state
            .catalog
            .get_file(&row.file_name)
            .await?
            .ok_or_else(|| TaskError::Missing(format!("file {}", row.file_name)))?;
        let transport: Transport = row.transport.parse()?;

        let request = PrepareTransferRequest {
            origin_librarian: self.state.name().to_string(),
            origin_transfer_id: row.id.into(),
            file_name: file.name.clone(),
            size: file.size_bytes as u64,
            checksum: file.checksum()?,
            transport,
        };

        let peer = self.state.peers.peer_for(&destination);
        match retry_to_deadline(deadline, "prepare_transfer", || {
            peer.prepare_transfer(&request)
        })
        .await
        {
            Ok(response) => {
                self.transition(
                    row.id,
                    TransferStatus::Initiated,
                    TransferStatus::Ongoing,
                    &TransferUpdates {
                        remote_transfer_id: Some(*response.remote_id.as_uuid()),
                        increment_attempts: true,
                        ..Default::default()
                    },
                )
                .await?;
                self.state
                    .catalog
                    .mark_librarian_seen(&destination.name, OffsetDateTime::now_utc())
                    .await?;
                Ok(true)
            }
            Err(PeerError::Unreachable(reason)) => {
                tracing::warn!(transfer = %row.id, destination = %destination.name, reason = %reason, "prepare unreachable");
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(transfer = %row.id, destination = %destination.name, error = %e, "prepare rejected, failing transfer");
                self.fail(row.id, TransferStatus::Initiated).await?;
                Ok(true)
            }
        }
    }

    /// ongoing -> staged: push the bytes, then ask the peer to verify.
    async fn step_push(
        &self,
        row: &OutgoingTransferRow,
        deadline: OffsetDateTime,
    ) -> TaskResult<bool> {
        let destination = self.destination(row).await?;
        let peer = self.state.peers.peer_for(&destination);
        let remote_id = match row.remote_transfer_id {
            Some(id) => id.into(),
            None => {
                tracing::error!(transfer = %row.id, "ongoing transfer has no remote id, failing");
                self.fail(row.id, TransferStatus::Ongoing).await?;
                return Ok(true);
            }
        };

        let transport: Transport = row.transport.parse()?;
        if transport == Transport::Sneakernet {
            // Bytes move out of band; just ask whether they landed.
            return self
                .check_remote_staged(row, &destination, remote_id, deadline)
                .await;
        }

        // A retried push may find the destination already past staging
        // (crash after a completed upload); never push bytes twice.
        if self
            .check_remote_staged(row, &destination, remote_id, deadline)
            .await?
        {
            return Ok(true);
        }

        // Pick a source instance, preferring the configured source store.
        let instances = self
            .state
            .catalog
            .available_instances_for_file(&row.file_name)
            .await?;
        let instance = instances
            .iter()
            .find(|i| Some(i.store_id) == row.source_store_id)
            .or_else(|| instances.first());
        let Some(instance) = instance else {
            tracing::error!(transfer = %row.id, file = %row.file_name, "no available instance to send, failing");
            self.fail(row.id, TransferStatus::Ongoing).await?;
            return Ok(true);
        };

        let store_row = self
            .state
            .catalog
            .get_store_by_id(instance.store_id)
            .await?
            .ok_or_else(|| TaskError::Missing(format!("store id {}", instance.store_id)))?;
        let backend = self.state.stores.get(&store_row.name)?;
        let data = backend.read(&instance.path).await?;
        let size = data.len() as u64;

        if let Err(e) = retry_to_deadline(deadline, "upload_bytes", || {
            peer.upload_bytes(remote_id, data.clone())
        })
        .await
        {
            match e {
                PeerError::Unreachable(reason) => {
                    tracing::warn!(transfer = %row.id, reason = %reason, "byte push unreachable");
                    return Ok(false);
                }
                other => {
                    tracing::warn!(transfer = %row.id, error = %other, "byte push rejected, failing transfer");
                    self.fail(row.id, TransferStatus::Ongoing).await?;
                    return Ok(true);
                }
            }
        }
        metrics::BYTES_SENT.inc_by(size);

        self.check_remote_staged(row, &destination, remote_id, deadline)
            .await
    }

    /// Ask the destination whether the staged bytes verified; move to
    /// staged when they have.
    async fn check_remote_staged(
        &self,
        row: &OutgoingTransferRow,
        destination: &LibrarianRow,
        remote_id: archivist_core::TransferId,
        deadline: OffsetDateTime,
    ) -> TaskResult<bool> {
        let peer = self.state.peers.peer_for(destination);
        match retry_to_deadline(deadline, "staged_transfer", || {
            peer.staged_transfer(remote_id)
        })
        .await
        {
            Ok(response) => match response.status {
                // Completed means the destination committed on its own;
                // advance to staged here and let the commit step fetch the
                // record (commit is idempotent).
                TransferStatus::Staged | TransferStatus::Completed => {
                    let file = self.state.catalog.get_file(&row.file_name).await?;
                    self.transition(
                        row.id,
                        TransferStatus::Ongoing,
                        TransferStatus::Staged,
                        &TransferUpdates {
                            bytes_transferred: file.map(|f| f.size_bytes),
                            ..Default::default()
                        },
                    )
                    .await?;
                    Ok(true)
                }
                TransferStatus::Failed | TransferStatus::Cancelled => {
                    tracing::warn!(transfer = %row.id, remote_status = %response.status, "destination failed the transfer");
                    self.fail(row.id, TransferStatus::Ongoing).await?;
                    Ok(true)
                }
                other => {
                    tracing::debug!(transfer = %row.id, remote_status = %other, "destination still staging");
                    Ok(false)
                }
            },
            Err(PeerError::Unreachable(reason)) => {
                tracing::warn!(transfer = %row.id, reason = %reason, "staged check unreachable");
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(transfer = %row.id, error = %e, "staged check rejected, failing transfer");
                self.fail(row.id, TransferStatus::Ongoing).await?;
                Ok(true)
            }
        }
    }

    /// staged -> completed via the peer's commit; registers the remote
    /// instance locally.
    async fn step_commit(
        &self,
        row: &OutgoingTransferRow,
        deadline: OffsetDateTime,
    ) -> TaskResult<bool> {
        let destination = self.destination(row).await?;
        let peer = self.state.peers.peer_for(&destination);
        let remote_id = match row.remote_transfer_id {
            Some(id) => id.into(),
            None => {
                self.fail(row.id, TransferStatus::Staged).await?;
                return Ok(true);
            }
        };

        match retry_to_deadline(deadline, "commit_transfer", || {
            peer.commit_transfer(remote_id)
        })
        .await
        {
            Ok(response) => {
                self.register_completion(row, &destination, &response.remote_instance.checksum)
                    .await?;
                Ok(true)
            }
            Err(PeerError::Unreachable(reason)) => {
                tracing::warn!(transfer = %row.id, reason = %reason, "commit unreachable");
                Ok(false)
            }
            Err(e) => {
                tracing::warn!(transfer = %row.id, error = %e, "commit rejected, failing transfer");
                self.fail(row.id, TransferStatus::Staged).await?;
                Ok(true)
            }
        }
    }

    /// Record the peer's copy and close out the transfer. Also used by the
    /// outgoing hypervisor when it finds the remote side already committed.
    pub async fn register_completion(
        &self,
        row: &OutgoingTransferRow,
        destination: &LibrarianRow,
        checksum: &Checksum,
    ) -> TaskResult<()> {
        let now = OffsetDateTime::now_utc();
        self.state
            .catalog
            .register_remote_instance(
                &row.file_name,
                destination.id,
                checksum,
                now,
                self.state.name(),
            )
            .await?;

        // Walk the remaining legal arcs; a hypervisor may find the row in
        // ongoing when the destination committed on its own.
        let status = self
            .state
            .catalog
            .get_outgoing(row.id)
            .await?
            .ok_or_else(|| TaskError::Missing(format!("outgoing transfer {}", row.id)))?
            .transfer_status()?;
        if status == TransferStatus::Ongoing {
            self.transition(
                row.id,
                TransferStatus::Ongoing,
                TransferStatus::Staged,
                &TransferUpdates::default(),
            )
            .await?;
        }
        self.transition(
            row.id,
            TransferStatus::Staged,
            TransferStatus::Completed,
            &TransferUpdates::default(),
        )
        .await?;

        self.state
            .catalog
            .mark_librarian_seen(&destination.name, now)
            .await?;
        metrics::TRANSFERS_COMPLETED.inc();
        tracing::info!(
            transfer = %row.id,
            file = %row.file_name,
            destination = %destination.name,
            "outgoing transfer completed"
        );
        Ok(())
    }

    /// Fail the transfer from `from`; losing the compare-and-set race is
    /// fine (someone else already moved it).
    pub async fn fail(&self, id: Uuid, from: TransferStatus) -> TaskResult<()> {
        match self
            .state
            .catalog
            .transition_outgoing(
                id,
                from,
                TransferStatus::Failed,
                &TransferUpdates::default(),
                OffsetDateTime::now_utc(),
            )
            .await
        {
            Ok(()) => {
                metrics::TRANSFERS_FAILED.inc();
                Ok(())
            }
            Err(CatalogError::StaleState { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn transition(
        &self,
        id: Uuid,
        from: TransferStatus,
        to: TransferStatus,
        updates: &TransferUpdates,
    ) -> TaskResult<()> {
        match self
            .state
            .catalog
            .transition_outgoing(id, from, to, updates, OffsetDateTime::now_utc())
            .await
        {
            Ok(()) => Ok(()),
            Err(CatalogError::StaleState { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
