//! On-demand checksum verification.

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::notify::Event;
use archivist_catalog::Catalog;
use crate::state::AppState;
use archivist_core::rpc::{VerifyChecksumRequest, VerifyChecksumResponse};
use archivist_storage::StorageError;
use axum::extract::State;
use axum::Json;
use time::OffsetDateTime;

pub async fn verify(
    State(state): State<AppState>,
    Json(request): Json<VerifyChecksumRequest>,
) -> ApiResult<Json<VerifyChecksumResponse>> {
    Ok(Json(verify_file_checksum(&state, &request.file_name).await?))
}

/// Recompute the on-disk checksum of a file's first available instance.
///
/// The measured digest is returned even when it disagrees with the
/// catalog; peers compare it against their own expectation. A mismatch is
/// recorded as a pre-deletion audit finding and the instance goes
/// unavailable.
pub async fn verify_file_checksum(
    state: &AppState,
    file_name: &str,
) -> ApiResult<VerifyChecksumResponse> {
    let file = state
        .catalog
        .get_file(file_name)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("file {file_name}")))?;
    let expected = file.checksum()?;

    let instances = state.catalog.available_instances_for_file(file_name).await?;
    let instance = instances
        .first()
        .ok_or_else(|| ApiError::NotFound(format!("no available instance of {file_name}")))?;

    let store = state
        .catalog
        .get_store_by_id(instance.store_id)
        .await?
        .ok_or_else(|| ApiError::Internal(format!("store id {} missing", instance.store_id)))?;
    let backend = state.stores.get(&store.name)?;

    let now = OffsetDateTime::now_utc();
    let info = match backend.path_info(&instance.path).await {
        Ok(info) => info,
        Err(StorageError::NotFound(_)) => {
            // Bytes vanished from disk entirely.
            state
                .catalog
                .mark_instance_unavailable(instance.id)
                .await?;
            state
                .catalog
                .record_corrupt_file(
                    file_name,
                    &file.source_librarian,
                    instance.id,
                    "predeletion_audit",
                    now,
                )
                .await?;
            state.notifier.notify(Event::FileCorrupt {
                file: file_name.to_string(),
                instance_id: instance.id,
                detector: "predeletion_audit".to_string(),
            });
            metrics::CORRUPT_FILES_DETECTED.inc();
            return Err(ApiError::NotFound(format!(
                "instance of {file_name} missing on disk"
            )));
        }
        Err(e) => return Err(e.into()),
    };

    state
        .catalog
        .update_instance_checksum_cache(instance.id, &info.checksum, info.size as i64, now)
        .await?;

    if info.checksum != expected {
        state
            .catalog
            .mark_instance_unavailable(instance.id)
            .await?;
        state
            .catalog
            .record_corrupt_file(
                file_name,
                &file.source_librarian,
                instance.id,
                "predeletion_audit",
                now,
            )
            .await?;
        state.notifier.notify(Event::FileCorrupt {
            file: file_name.to_string(),
            instance_id: instance.id,
            detector: "predeletion_audit".to_string(),
        });
        metrics::CORRUPT_FILES_DETECTED.inc();
        tracing::warn!(
            file = %file_name,
            instance = instance.id,
            expected = %expected,
            actual = %info.checksum,
            "pre-deletion audit found corrupt instance"
        );
    }

    Ok(VerifyChecksumResponse {
        file_name: file_name.to_string(),
        checksum: info.checksum,
        size: info.size,
        verified_at: now,
    })
}
