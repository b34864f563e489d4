//! Ingest upload surface.
//!
//! Uploaders stage a file, place the bytes into the returned staging
//! location (they share a filesystem with the stores, or push through the
//! clone upload endpoint), then commit. User authentication sits in front
//! of this server.

use crate::error::{ApiError, ApiResult};
use crate::handlers::clone::commit_clone;
use crate::state::AppState;
use archivist_catalog::Catalog;
use archivist_catalog::models::{IncomingTransferUpdates, NewIncomingTransfer};
use archivist_core::rpc::{
    CommitUploadRequest, CommitUploadResponse, StageDescriptor, StageUploadRequest,
    StageUploadResponse,
};
use archivist_core::{DeletionPolicy, TransferStatus};
use axum::extract::State;
use axum::Json;
use time::OffsetDateTime;
use uuid::Uuid;

pub async fn stage(
    State(state): State<AppState>,
    Json(request): Json<StageUploadRequest>,
) -> ApiResult<Json<StageUploadResponse>> {
    Ok(Json(stage_upload(&state, &request).await?))
}

pub async fn commit(
    State(state): State<AppState>,
    Json(request): Json<CommitUploadRequest>,
) -> ApiResult<Json<CommitUploadResponse>> {
    Ok(Json(commit_upload(&state, &request).await?))
}

/// Create an incoming transfer for an ingest upload and hand back its
/// staging location.
pub async fn stage_upload(
    state: &AppState,
    request: &StageUploadRequest,
) -> ApiResult<StageUploadResponse> {
    let selfrow = state
        .catalog
        .get_librarian(state.name())
        .await?
        .ok_or_else(|| ApiError::Internal("own librarian row missing".to_string()))?;

    if let Some(observation_id) = request.observation_id {
        if state.catalog.get_observation(observation_id).await?.is_none() {
            return Err(ApiError::BadRequest(format!(
                "unknown observation {observation_id}"
            )));
        }
    }

    let (store, backend) = super::pick_ingest_store(state, request.size).await?;
    let handle = backend.stage(&request.file_name, request.size).await?;

    let transfer = state
        .catalog
        .create_incoming(&NewIncomingTransfer {
            id: Uuid::new_v4(),
            file_name: request.file_name.clone(),
            source_librarian_id: selfrow.id,
            store_id: Some(store.id),
            staging_path: Some(handle.staged_path()),
            declared_size: request.size as i64,
            declared_checksum: request.checksum,
            observation_id: request.observation_id,
            source_transfer_id: Uuid::new_v4(),
            created_at: OffsetDateTime::now_utc(),
        })
        .await?;

    Ok(StageUploadResponse {
        transfer_id: transfer.id.into(),
        stage: StageDescriptor {
            store_name: store.name,
            staging_path: handle.staged_path(),
        },
    })
}

/// Promote a staged upload into an instance. The uploader's bytes must be
/// in place; they are verified against the declared checksum.
pub async fn commit_upload(
    state: &AppState,
    request: &CommitUploadRequest,
) -> ApiResult<CommitUploadResponse> {
    let id = *request.transfer_id.as_uuid();
    let transfer = state
        .catalog
        .get_incoming(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("upload {id}")))?;

    // Uploads write their bytes out of band; the row is still in
    // initiated when the uploader calls commit.
    if transfer.transfer_status()? == TransferStatus::Initiated {
        state
            .catalog
            .transition_incoming(
                id,
                TransferStatus::Initiated,
                TransferStatus::Ongoing,
                &IncomingTransferUpdates::default(),
                OffsetDateTime::now_utc(),
            )
            .await?;
    }

    let response = commit_clone(state, id, DeletionPolicy::Disallowed).await?;
    Ok(CommitUploadResponse {
        file_name: response.remote_instance.file_name,
        store_name: response.remote_instance.store_name,
        path: transfer.file_name,
        checksum: response.remote_instance.checksum,
    })
}
