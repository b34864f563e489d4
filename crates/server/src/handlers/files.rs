//! File metadata lookups.

use crate::error::{ApiError, ApiResult};
use archivist_catalog::Catalog;
use crate::state::AppState;
use archivist_core::rpc::{FileInfoResponse, FileInstanceInfo, RemoteInstanceInfo};
use archivist_core::Checksum;
use axum::extract::{Path, State};
use axum::Json;

pub async fn file_info(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<Json<FileInfoResponse>> {
    Ok(Json(get_file_info(&state, &name).await?))
}

/// File metadata plus every known location, local and remote.
pub async fn get_file_info(state: &AppState, name: &str) -> ApiResult<FileInfoResponse> {
    let file = state
        .catalog
        .get_file(name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("file {name}")))?;

    let mut instances = Vec::new();
    for instance in state.catalog.available_instances_for_file(name).await? {
        let store = state
            .catalog
            .get_store_by_id(instance.store_id)
            .await?
            .ok_or_else(|| ApiError::Internal(format!("store id {} missing", instance.store_id)))?;
        instances.push(FileInstanceInfo {
            store_name: store.name,
            path: instance.path,
            available: instance.available,
        });
    }

    let mut remote_instances = Vec::new();
    for remote in state.catalog.remote_instances_for_file(name).await? {
        let librarian = state
            .catalog
            .get_librarian_by_id(remote.librarian_id)
            .await?
            .ok_or_else(|| {
                ApiError::Internal(format!("librarian id {} missing", remote.librarian_id))
            })?;
        let verified_checksum = remote
            .verified_checksum
            .as_deref()
            .map(Checksum::parse)
            .transpose()?;
        remote_instances.push(RemoteInstanceInfo {
            librarian: librarian.name,
            copy_time: remote.copy_time,
            verified_checksum,
        });
    }

    Ok(FileInfoResponse {
        file_name: file.name.clone(),
        size: file.size_bytes as u64,
        checksum: file.checksum()?,
        uploaded_at: file.uploaded_at,
        instances,
        remote_instances,
    })
}
