//! Prometheus metrics for the archivist server.
//!
//! The `/metrics` endpoint is unauthenticated to allow Prometheus scraping;
//! restrict it at the infrastructure level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, IntCounter, Registry, TextEncoder};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub static TRANSFERS_COMPLETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "archivist_transfers_completed_total",
        "Outgoing transfers that reached completed",
    )
    .expect("metric creation failed")
});

pub static TRANSFERS_FAILED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "archivist_transfers_failed_total",
        "Transfers that reached failed or cancelled",
    )
    .expect("metric creation failed")
});

pub static BYTES_SENT: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "archivist_bytes_sent_total",
        "Bytes pushed to peer librarians",
    )
    .expect("metric creation failed")
});

pub static BYTES_RECEIVED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "archivist_bytes_received_total",
        "Bytes committed from incoming transfers",
    )
    .expect("metric creation failed")
});

pub static INSTANCES_DELETED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "archivist_instances_deleted_total",
        "Instances removed by rolling deletion",
    )
    .expect("metric creation failed")
});

pub static CORRUPT_FILES_DETECTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "archivist_corrupt_files_detected_total",
        "Checksum mismatches found by integrity checks",
    )
    .expect("metric creation failed")
});

pub static CORRUPT_FILES_REPAIRED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "archivist_corrupt_files_repaired_total",
        "Corrupt files replaced with a fresh remote copy",
    )
    .expect("metric creation failed")
});

pub static QUEUE_ITEMS_CLAIMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "archivist_queue_items_claimed_total",
        "Send-queue items claimed by consumers",
    )
    .expect("metric creation failed")
});

static REGISTER: Once = Once::new();

/// Register all metrics with the global registry. Idempotent.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(TRANSFERS_COMPLETED.clone()),
            Box::new(TRANSFERS_FAILED.clone()),
            Box::new(BYTES_SENT.clone()),
            Box::new(BYTES_RECEIVED.clone()),
            Box::new(INSTANCES_DELETED.clone()),
            Box::new(CORRUPT_FILES_DETECTED.clone()),
            Box::new(CORRUPT_FILES_REPAIRED.clone()),
            Box::new(QUEUE_ITEMS_CLAIMED.clone()),
        ];
        for metric in metrics {
            if let Err(e) = REGISTRY.register(metric) {
                tracing::warn!(error = %e, "failed to register metric");
            }
        }
    });
}

/// Serve the registry in the Prometheus text format.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    match encoder.encode(&families, &mut buffer) {
        Ok(()) => (StatusCode::OK, buffer).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, Vec::new()).into_response()
        }
    }
}
