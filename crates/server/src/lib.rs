//! Archivist librarian server.
//!
//! Hosts the HTTP surface (ingest uploads, the peer clone protocol,
//! checksum verification, file metadata) and the background engine: the
//! transfer manager, the scheduler and its task catalog.

pub mod auth;
pub mod bootstrap;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod notify;
pub mod peer;
pub mod scheduler;
pub mod state;
pub mod tasks;
pub mod transfer;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::Router;
use axum::routing::{get, post, put};

/// Build the axum router over the shared state.
pub fn create_router(state: AppState) -> Router {
    let metrics_enabled = state.config.metrics_enabled;

    let mut router = Router::new()
        .route("/healthz", get(handlers::health))
        .route("/v1/upload/stage", post(handlers::upload::stage))
        .route("/v1/upload/commit", post(handlers::upload::commit))
        .route("/v1/clone/prepare", post(handlers::clone::prepare))
        .route("/v1/clone/upload/{id}", put(handlers::clone::upload))
        .route("/v1/clone/staged", post(handlers::clone::staged))
        .route("/v1/clone/commit", post(handlers::clone::commit))
        .route("/v1/clone/status", post(handlers::clone::status))
        .route("/v1/clone/cancel", post(handlers::clone::cancel))
        .route("/v1/clone/resend", post(handlers::clone::resend))
        .route("/v1/checksum/verify", post(handlers::checksum::verify))
        .route("/v1/file/{name}", get(handlers::files::file_info));

    if metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }

    router
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}
