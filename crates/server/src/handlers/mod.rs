//! HTTP handlers: ingest uploads, the peer clone protocol, checksum
//! verification and file metadata.
//!
//! Each endpoint is a thin axum wrapper over a service function; the
//! service functions are also called in-process by the background tasks
//! (and by loopback peers in tests).

pub mod checksum;
pub mod clone;
pub mod files;
pub mod upload;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use archivist_catalog::Catalog;
use archivist_catalog::models::StoreRow;
use archivist_storage::StoreBackend;
use axum::Json;
use serde_json::{json, Value};
use std::sync::Arc;

/// Liveness probe.
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Pick an enabled, ingestable store with room for `size` bytes. Stores
/// are tried in name order so placement is deterministic.
pub(crate) async fn pick_ingest_store(
    state: &AppState,
    size: u64,
) -> ApiResult<(StoreRow, Arc<dyn StoreBackend>)> {
    for store in state.catalog.list_stores().await? {
        if !store.enabled || !store.ingestable {
            continue;
        }
        let Ok(backend) = state.stores.get(&store.name) else {
            continue;
        };
        match backend.free_space().await {
            Ok(free) if free >= size => return Ok((store, backend)),
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(store = %store.name, error = %e, "skipping store with failing capacity query");
                continue;
            }
        }
    }
    Err(ApiError::NoCapacity { needed: size })
}
