//! Application state shared across handlers and tasks.

use crate::notify::Notifier;
use crate::peer::PeerProvider;
use archivist_catalog::Catalog;
use archivist_core::config::AppConfig;
use archivist_storage::StoreManager;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// The durable catalog.
    pub catalog: Arc<dyn Catalog>,
    /// Named store backends.
    pub stores: StoreManager,
    /// Peer RPC client factory.
    pub peers: Arc<dyn PeerProvider>,
    /// Notification sink.
    pub notifier: Arc<dyn Notifier>,
}

impl AppState {
    /// Create a new application state. Configuration must already be
    /// validated; this panics on invalid configuration.
    pub fn new(
        config: AppConfig,
        catalog: Arc<dyn Catalog>,
        stores: StoreManager,
        peers: Arc<dyn PeerProvider>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        if let Err(error) = config.validate() {
            panic!("invalid configuration: {error}");
        }

        Self {
            config: Arc::new(config),
            catalog,
            stores,
            peers,
            notifier,
        }
    }

    /// This librarian's federation name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// The checksum cache freshness window.
    pub fn checksum_cache_timeout(&self) -> time::Duration {
        self.config.checksum_cache_timeout.as_duration()
    }
}
