//! Peer clone protocol: prepare, byte upload, staged, commit, status,
//! cancel, resend.

use crate::auth::authenticate_librarian;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;
use archivist_catalog::models::{
    IncomingTransferRow, IncomingTransferUpdates, NewFile, NewIncomingTransfer, NewInstance,
    NewOutgoingTransfer, TransferUpdates,
};
use archivist_catalog::Catalog;
use archivist_catalog::CatalogError;
use archivist_core::rpc::{
    CommitTransferResponse, PrepareTransferRequest, PrepareTransferResponse, RemoteInstanceRecord,
    ResendFileRequest, ResendFileResponse, StageDescriptor, TransferRefRequest,
    TransferStatusResponse,
};
use archivist_core::{DeletionPolicy, TransferStatus, Transport};
use archivist_storage::{StagingHandle, StorageError};
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use bytes::Bytes;
use time::OffsetDateTime;
use uuid::Uuid;

// ===== axum wrappers =====

pub async fn prepare(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<PrepareTransferRequest>,
) -> ApiResult<Json<PrepareTransferResponse>> {
    let caller = authenticate_librarian(&state, &headers).await?;
    if caller.name != request.origin_librarian {
        return Err(ApiError::Forbidden(format!(
            "token belongs to {}, request claims {}",
            caller.name, request.origin_librarian
        )));
    }
    Ok(Json(prepare_clone(&state, caller.id, &request).await?))
}

pub async fn upload(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<TransferStatusResponse>> {
    authenticate_librarian(&state, &headers).await?;
    Ok(Json(receive_clone_bytes(&state, id, body).await?))
}

pub async fn staged(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TransferRefRequest>,
) -> ApiResult<Json<TransferStatusResponse>> {
    authenticate_librarian(&state, &headers).await?;
    Ok(Json(
        staged_clone(&state, *request.remote_id.as_uuid()).await?,
    ))
}

pub async fn commit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TransferRefRequest>,
) -> ApiResult<Json<CommitTransferResponse>> {
    authenticate_librarian(&state, &headers).await?;
    Ok(Json(
        commit_clone(
            &state,
            *request.remote_id.as_uuid(),
            DeletionPolicy::Disallowed,
        )
        .await?,
    ))
}

pub async fn status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TransferRefRequest>,
) -> ApiResult<Json<TransferStatusResponse>> {
    authenticate_librarian(&state, &headers).await?;
    Ok(Json(
        transfer_status(&state, *request.remote_id.as_uuid()).await?,
    ))
}

pub async fn cancel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<TransferRefRequest>,
) -> ApiResult<Json<TransferStatusResponse>> {
    authenticate_librarian(&state, &headers).await?;
    Ok(Json(
        cancel_transfer(&state, *request.remote_id.as_uuid()).await?,
    ))
}

pub async fn resend(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ResendFileRequest>,
) -> ApiResult<Json<ResendFileResponse>> {
    let caller = authenticate_librarian(&state, &headers).await?;
    if caller.name != request.destination_librarian {
        return Err(ApiError::Forbidden(format!(
            "token belongs to {}, request claims {}",
            caller.name, request.destination_librarian
        )));
    }
    Ok(Json(resend_file(&state, caller.id, &request).await?))
}

// ===== service functions =====

/// Open (or idempotently return) an incoming transfer for a peer's
/// outgoing transfer.
pub async fn prepare_clone(
    state: &AppState,
    source_librarian_id: i64,
    request: &PrepareTransferRequest,
) -> ApiResult<PrepareTransferResponse> {
    let source_transfer_id = *request.origin_transfer_id.as_uuid();

    if let Some(existing) = state
        .catalog
        .get_incoming_by_source(source_librarian_id, source_transfer_id)
        .await?
    {
        return prepare_response(state, &existing).await;
    }

    let (store, backend) = super::pick_ingest_store(state, request.size).await?;
    let handle = backend.stage(&request.file_name, request.size).await?;

    let transfer = NewIncomingTransfer {
        id: Uuid::new_v4(),
        file_name: request.file_name.clone(),
        source_librarian_id,
        store_id: Some(store.id),
        staging_path: Some(handle.staged_path()),
        declared_size: request.size as i64,
        declared_checksum: request.checksum,
        observation_id: None,
        source_transfer_id,
        created_at: OffsetDateTime::now_utc(),
    };

    match state.catalog.create_incoming(&transfer).await {
        Ok(row) => prepare_response(state, &row).await,
        Err(CatalogError::Conflict(_)) => {
            // Lost a prepare race for the same origin transfer; hand back
            // the winner's row and drop our staging reservation.
            backend.abort(&handle).await?;
            let existing = state
                .catalog
                .get_incoming_by_source(source_librarian_id, source_transfer_id)
                .await?
                .ok_or_else(|| {
                    ApiError::Internal("prepare race lost but no winner found".to_string())
                })?;
            prepare_response(state, &existing).await
        }
        Err(e) => Err(e.into()),
    }
}

async fn prepare_response(
    state: &AppState,
    transfer: &IncomingTransferRow,
) -> ApiResult<PrepareTransferResponse> {
    let status = transfer.transfer_status()?;
    if status.is_terminal() {
        return Err(ApiError::WrongTransferState {
            expected: "non-terminal".to_string(),
            found: status.as_str().to_string(),
        });
    }
    let store_id = transfer
        .store_id
        .ok_or_else(|| ApiError::Internal("incoming transfer has no store".to_string()))?;
    let store = state
        .catalog
        .get_store_by_id(store_id)
        .await?
        .ok_or_else(|| ApiError::Internal(format!("store id {store_id} missing")))?;
    let staging_path = transfer
        .staging_path
        .clone()
        .ok_or_else(|| ApiError::Internal("incoming transfer has no staging path".to_string()))?;

    Ok(PrepareTransferResponse {
        remote_id: transfer.id.into(),
        stage: StageDescriptor {
            store_name: store.name,
            staging_path,
        },
    })
}

/// Accept a complete byte push into the staging area. Replaces any bytes
/// from an earlier interrupted push, so retries are safe.
pub async fn receive_clone_bytes(
    state: &AppState,
    id: Uuid,
    body: Bytes,
) -> ApiResult<TransferStatusResponse> {
    let transfer = get_incoming(state, id).await?;
    let status = transfer.transfer_status()?;
    let now = OffsetDateTime::now_utc();

    match status {
        TransferStatus::Initiated => {
            state
                .catalog
                .transition_incoming(
                    id,
                    TransferStatus::Initiated,
                    TransferStatus::Ongoing,
                    &IncomingTransferUpdates::default(),
                    now,
                )
                .await?;
        }
        TransferStatus::Ongoing => {}
        other => {
            return Err(ApiError::WrongTransferState {
                expected: "initiated or ongoing".to_string(),
                found: other.as_str().to_string(),
            });
        }
    }

    let (_, backend, handle) = staging_parts(state, &transfer).await?;
    backend.reset_staged(&handle).await?;
    backend.write(&handle, body).await?;

    try_mark_staged(state, &transfer).await
}

/// Report (and refresh) the staging verdict for an incoming transfer.
pub async fn staged_clone(state: &AppState, id: Uuid) -> ApiResult<TransferStatusResponse> {
    let transfer = get_incoming(state, id).await?;
    let status = transfer.transfer_status()?;
    if status == TransferStatus::Ongoing {
        return try_mark_staged(state, &transfer).await;
    }
    Ok(TransferStatusResponse {
        remote_id: id.into(),
        status,
    })
}

/// Check the staged bytes against the declared size and checksum; advance
/// to staged when they match, fail when they are complete but wrong.
async fn try_mark_staged(
    state: &AppState,
    transfer: &IncomingTransferRow,
) -> ApiResult<TransferStatusResponse> {
    let (_, backend, handle) = staging_parts(state, transfer).await?;
    let declared = transfer.declared_checksum()?;
    let now = OffsetDateTime::now_utc();

    let status = match backend.staged_info(&handle).await? {
        Some(info) if info.size == transfer.declared_size as u64 => {
            if info.checksum == declared {
                state
                    .catalog
                    .transition_incoming(
                        transfer.id,
                        TransferStatus::Ongoing,
                        TransferStatus::Staged,
                        &IncomingTransferUpdates::default(),
                        now,
                    )
                    .await?;
                TransferStatus::Staged
            } else {
                tracing::warn!(
                    transfer = %transfer.id,
                    file = %transfer.file_name,
                    expected = %declared,
                    actual = %info.checksum,
                    "staged bytes are complete but corrupt, failing transfer"
                );
                state
                    .catalog
                    .transition_incoming(
                        transfer.id,
                        TransferStatus::Ongoing,
                        TransferStatus::Failed,
                        &IncomingTransferUpdates::default(),
                        now,
                    )
                    .await?;
                backend.abort(&handle).await?;
                TransferStatus::Failed
            }
        }
        _ => TransferStatus::Ongoing,
    };

    Ok(TransferStatusResponse {
        remote_id: transfer.id.into(),
        status,
    })
}

/// Promote staged bytes into the store and create the file + instance
/// rows. Idempotent: committing a completed transfer returns the original
/// record.
pub async fn commit_clone(
    state: &AppState,
    id: Uuid,
    deletion_policy: DeletionPolicy,
) -> ApiResult<CommitTransferResponse> {
    let transfer = get_incoming(state, id).await?;
    let status = transfer.transfer_status()?;
    let declared = transfer.declared_checksum()?;
    let now = OffsetDateTime::now_utc();

    match status {
        TransferStatus::Completed => {
            return committed_response(state, &transfer).await;
        }
        TransferStatus::Staged => {}
        TransferStatus::Ongoing => {
            // A commit racing the byte push; promote if the bytes landed.
            let response = try_mark_staged(state, &transfer).await?;
            if response.status != TransferStatus::Staged {
                return Err(ApiError::WrongTransferState {
                    expected: TransferStatus::Staged.as_str().to_string(),
                    found: response.status.as_str().to_string(),
                });
            }
        }
        other => {
            return Err(ApiError::WrongTransferState {
                expected: TransferStatus::Staged.as_str().to_string(),
                found: other.as_str().to_string(),
            });
        }
    }

    let (store, backend, handle) = staging_parts(state, &transfer).await?;
    let source = state
        .catalog
        .get_librarian_by_id(transfer.source_librarian_id)
        .await?
        .ok_or_else(|| {
            ApiError::Internal(format!(
                "source librarian id {} missing",
                transfer.source_librarian_id
            ))
        })?;

    let dest_path = transfer.file_name.clone();

    // If the file is already on this store with matching bytes, this is a
    // replay; absorb it rather than renaming over the committed file.
    if let Some(existing) = state
        .catalog
        .available_instances_for_file(&transfer.file_name)
        .await?
        .into_iter()
        .find(|i| i.store_id == store.id)
    {
        let file = state
            .catalog
            .get_file(&transfer.file_name)
            .await?
            .ok_or_else(|| ApiError::Internal("instance without file row".to_string()))?;
        if file.checksum()? == declared {
            backend.abort(&handle).await?;
            state
                .catalog
                .transition_incoming(
                    transfer.id,
                    TransferStatus::Staged,
                    TransferStatus::Completed,
                    &IncomingTransferUpdates::default(),
                    now,
                )
                .await?;
            return Ok(CommitTransferResponse {
                status: TransferStatus::Completed,
                remote_instance: RemoteInstanceRecord {
                    file_name: transfer.file_name.clone(),
                    librarian: state.name().to_string(),
                    store_name: store.name,
                    checksum: declared,
                    committed_at: existing.created_at,
                },
            });
        }
    }

    let committed = match backend.commit(&handle, &dest_path, &declared).await {
        Ok(committed) => committed,
        Err(StorageError::ChecksumMismatch { expected, actual }) => {
            tracing::warn!(
                transfer = %transfer.id,
                file = %transfer.file_name,
                source = %source.name,
                expected = %expected,
                actual = %actual,
                "commit checksum mismatch, peer sent corrupt data"
            );
            state
                .catalog
                .transition_incoming(
                    transfer.id,
                    TransferStatus::Staged,
                    TransferStatus::Failed,
                    &IncomingTransferUpdates::default(),
                    now,
                )
                .await?;
            backend.abort(&handle).await?;
            return Err(StorageError::ChecksumMismatch { expected, actual }.into());
        }
        Err(e) => return Err(e.into()),
    };

    let file = NewFile {
        name: transfer.file_name.clone(),
        source_librarian: source.name.clone(),
        size_bytes: committed.size as i64,
        checksum: committed.checksum,
        uploaded_at: now,
        observation_id: transfer.observation_id,
    };
    let instance = NewInstance {
        file_name: transfer.file_name.clone(),
        store_id: store.id,
        path: committed.path.clone(),
        deletion_policy,
        created_at: now,
    };

    if let Err(e) = state.catalog.create_file(&file, Some(&instance)).await {
        // Keep disk and catalog consistent: drop the committed bytes.
        backend.delete(&committed.path).await?;
        state
            .catalog
            .transition_incoming(
                transfer.id,
                TransferStatus::Staged,
                TransferStatus::Failed,
                &IncomingTransferUpdates::default(),
                now,
            )
            .await?;
        return Err(e.into());
    }

    state
        .catalog
        .transition_incoming(
            transfer.id,
            TransferStatus::Staged,
            TransferStatus::Completed,
            &IncomingTransferUpdates::default(),
            now,
        )
        .await?;
    metrics::BYTES_RECEIVED.inc_by(committed.size);

    tracing::info!(
        transfer = %transfer.id,
        file = %transfer.file_name,
        store = %store.name,
        source = %source.name,
        "incoming transfer committed"
    );

    Ok(CommitTransferResponse {
        status: TransferStatus::Completed,
        remote_instance: RemoteInstanceRecord {
            file_name: transfer.file_name,
            librarian: state.name().to_string(),
            store_name: store.name,
            checksum: committed.checksum,
            committed_at: now,
        },
    })
}

/// Rebuild the commit response for an already-completed transfer.
async fn committed_response(
    state: &AppState,
    transfer: &IncomingTransferRow,
) -> ApiResult<CommitTransferResponse> {
    let file = state
        .catalog
        .get_file(&transfer.file_name)
        .await?
        .ok_or_else(|| {
            ApiError::Internal(format!(
                "completed transfer {} has no file row",
                transfer.id
            ))
        })?;
    let store_id = transfer
        .store_id
        .ok_or_else(|| ApiError::Internal("completed transfer has no store".to_string()))?;
    let store = state
        .catalog
        .get_store_by_id(store_id)
        .await?
        .ok_or_else(|| ApiError::Internal(format!("store id {store_id} missing")))?;
    let committed_at = state
        .catalog
        .available_instances_for_file(&transfer.file_name)
        .await?
        .into_iter()
        .find(|i| i.store_id == store_id)
        .map(|i| i.created_at)
        .unwrap_or(transfer.updated_at);

    Ok(CommitTransferResponse {
        status: TransferStatus::Completed,
        remote_instance: RemoteInstanceRecord {
            file_name: file.name.clone(),
            librarian: state.name().to_string(),
            store_name: store.name,
            checksum: file.checksum()?,
            committed_at,
        },
    })
}

/// Status lookup by transfer id, either direction.
pub async fn transfer_status(state: &AppState, id: Uuid) -> ApiResult<TransferStatusResponse> {
    if let Some(incoming) = state.catalog.get_incoming(id).await? {
        return Ok(TransferStatusResponse {
            remote_id: id.into(),
            status: incoming.transfer_status()?,
        });
    }
    if let Some(outgoing) = state.catalog.get_outgoing(id).await? {
        return Ok(TransferStatusResponse {
            remote_id: id.into(),
            status: outgoing.transfer_status()?,
        });
    }
    Err(ApiError::NotFound(format!("transfer {id}")))
}

/// Cancel a transfer if it is not terminal. Idempotent. Staged incoming
/// transfers fail instead (their bytes already verified; cancellation is
/// only legal before staging) and their staging bytes are dropped.
pub async fn cancel_transfer(state: &AppState, id: Uuid) -> ApiResult<TransferStatusResponse> {
    if let Some(incoming) = state.catalog.get_incoming(id).await? {
        let status = incoming.transfer_status()?;
        let now = OffsetDateTime::now_utc();
        let new_status = if status.is_terminal() {
            status
        } else {
            let target = if status.can_transition_to(TransferStatus::Cancelled) {
                TransferStatus::Cancelled
            } else {
                TransferStatus::Failed
            };
            state
                .catalog
                .transition_incoming(
                    id,
                    status,
                    target,
                    &IncomingTransferUpdates::default(),
                    now,
                )
                .await?;
            if let Ok((_, backend, handle)) = staging_parts(state, &incoming).await {
                backend.abort(&handle).await?;
            }
            target
        };
        return Ok(TransferStatusResponse {
            remote_id: id.into(),
            status: new_status,
        });
    }

    if let Some(outgoing) = state.catalog.get_outgoing(id).await? {
        let status = outgoing.transfer_status()?;
        let now = OffsetDateTime::now_utc();
        let new_status = if status.is_terminal() {
            status
        } else {
            let target = if status.can_transition_to(TransferStatus::Cancelled) {
                TransferStatus::Cancelled
            } else {
                TransferStatus::Failed
            };
            state
                .catalog
                .transition_outgoing(id, status, target, &TransferUpdates::default(), now)
                .await?;
            target
        };
        return Ok(TransferStatusResponse {
            remote_id: id.into(),
            status: new_status,
        });
    }

    Err(ApiError::NotFound(format!("transfer {id}")))
}

/// Queue a fresh outbound copy of a file we originated, for a peer whose
/// local copy went bad. Idempotent while a previous resend is active.
pub async fn resend_file(
    state: &AppState,
    destination_id: i64,
    request: &ResendFileRequest,
) -> ApiResult<ResendFileResponse> {
    let file = state
        .catalog
        .get_file(&request.file_name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("file {}", request.file_name)))?;

    let instances = state
        .catalog
        .available_instances_for_file(&file.name)
        .await?;
    if instances.is_empty() {
        return Err(ApiError::Conflict(format!(
            "no available instance of {} to resend",
            file.name
        )));
    }

    if let Some(active) = state
        .catalog
        .get_active_outgoing(&file.name, destination_id)
        .await?
    {
        return Ok(ResendFileResponse {
            source_transfer_id: active.id.into(),
        });
    }

    let now = OffsetDateTime::now_utc();
    let transfer = state
        .catalog
        .create_outgoing(&NewOutgoingTransfer {
            id: Uuid::new_v4(),
            file_name: file.name.clone(),
            destination_id,
            source_store_id: None,
            transport: Transport::Network,
            created_at: now,
        })
        .await?;
    // Repairs jump the queue.
    state.catalog.enqueue_send(transfer.id, 10, now).await?;

    Ok(ResendFileResponse {
        source_transfer_id: transfer.id.into(),
    })
}

// ===== shared plumbing =====

async fn get_incoming(state: &AppState, id: Uuid) -> ApiResult<IncomingTransferRow> {
    state
        .catalog
        .get_incoming(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("incoming transfer {id}")))
}

/// Resolve the store row, backend and staging handle of an incoming
/// transfer.
pub(crate) async fn staging_parts(
    state: &AppState,
    transfer: &IncomingTransferRow,
) -> ApiResult<(
    archivist_catalog::models::StoreRow,
    std::sync::Arc<dyn archivist_storage::StoreBackend>,
    StagingHandle,
)> {
    let store_id = transfer
        .store_id
        .ok_or_else(|| ApiError::Internal(format!("transfer {} has no store", transfer.id)))?;
    let store = state
        .catalog
        .get_store_by_id(store_id)
        .await?
        .ok_or_else(|| ApiError::Internal(format!("store id {store_id} missing")))?;
    let backend = state.stores.get(&store.name)?;
    let staging_path = transfer.staging_path.as_deref().ok_or_else(|| {
        ApiError::Internal(format!("transfer {} has no staging path", transfer.id))
    })?;
    let handle = StagingHandle::parse(staging_path)?;
    Ok((store, backend, handle))
}
