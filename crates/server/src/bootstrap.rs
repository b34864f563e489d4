//! Process startup: config loading, catalog connection and the sync of
//! configured stores and librarians into the catalog.

use crate::notify::{LogNotifier, Notifier};
use crate::peer::{HttpPeerProvider, PeerProvider};
use crate::state::AppState;
use archivist_catalog::models::{NewLibrarian, NewStore};
use archivist_catalog::{Catalog, SqliteCatalog};
use archivist_core::config::{AppConfig, DatabaseConfig, StoreBackendConfig};
use archivist_core::Transport;
use figment::providers::{Env, Format, Toml};
use figment::Figment;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Startup failures, split so administrative tools can map them onto
/// their exit codes.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("database unreachable: {0}")]
    Database(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Load configuration from an optional TOML file plus `ARCHIVIST_` env
/// overrides.
pub fn load_config(path: &str) -> Result<AppConfig, BootstrapError> {
    let mut figment = Figment::new();
    if Path::new(path).exists() {
        tracing::info!(config_path = %path, "loading configuration from file");
        figment = figment.merge(Toml::file(path));
    } else {
        tracing::debug!(config_path = %path, "no config file found, using environment only");
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("ARCHIVIST_").split("__"))
        .extract()
        .map_err(|e| BootstrapError::Config(e.to_string()))?;

    config.validate().map_err(BootstrapError::Config)?;
    Ok(config)
}

/// Open the catalog, construct the store backends and sync configured
/// rows, returning the shared state.
pub async fn build_state(config: AppConfig) -> Result<AppState, BootstrapError> {
    let catalog: Arc<dyn Catalog> = match &config.database {
        DatabaseConfig::Sqlite { path } => {
            let catalog = if path.as_os_str() == ":memory:" {
                SqliteCatalog::in_memory().await
            } else {
                SqliteCatalog::new(path).await
            }
            .map_err(|e| BootstrapError::Database(e.to_string()))?;
            Arc::new(catalog)
        }
    };
    catalog
        .health_check()
        .await
        .map_err(|e| BootstrapError::Database(e.to_string()))?;
    tracing::info!("catalog connected");

    let stores = archivist_storage::StoreManager::from_config(&config.stores)
        .await
        .map_err(|e| BootstrapError::Storage(e.to_string()))?;
    tracing::info!(stores = config.stores.len(), "store backends initialized");

    sync_catalog(catalog.as_ref(), &config).await?;

    let peers: Arc<dyn PeerProvider> = Arc::new(HttpPeerProvider::new());
    let notifier: Arc<dyn Notifier> = Arc::new(LogNotifier);
    Ok(AppState::new(config, catalog, stores, peers, notifier))
}

/// Upsert our own librarian row plus every configured store and peer.
async fn sync_catalog(catalog: &dyn Catalog, config: &AppConfig) -> Result<(), BootstrapError> {
    catalog
        .upsert_librarian(&NewLibrarian {
            name: config.name.clone(),
            url: format!("http://{}", config.server.bind),
            // Nobody authenticates as us against ourselves.
            auth_token: String::new(),
            network_transport: true,
            sneakernet_transport: false,
        })
        .await
        .map_err(|e| BootstrapError::Database(e.to_string()))?;

    for store in &config.stores {
        let (backend_kind, root) = match &store.backend {
            StoreBackendConfig::Filesystem { root, .. } => {
                ("filesystem", root.display().to_string())
            }
            StoreBackendConfig::Rsync { root, .. } => ("rsync", root.display().to_string()),
            StoreBackendConfig::Globus { root, .. } => ("globus", root.display().to_string()),
        };
        catalog
            .upsert_store(&NewStore {
                name: store.name.clone(),
                backend_kind: backend_kind.to_string(),
                root,
                capacity_bytes: store.capacity_bytes as i64,
                enabled: store.enabled,
                ingestable: store.ingestable,
            })
            .await
            .map_err(|e| BootstrapError::Database(e.to_string()))?;
    }

    for peer in &config.librarians {
        catalog
            .upsert_librarian(&NewLibrarian {
                name: peer.name.clone(),
                url: peer.url.clone(),
                auth_token: peer.auth_token.clone(),
                network_transport: peer.transports.contains(&Transport::Network),
                sneakernet_transport: peer.transports.contains(&Transport::Sneakernet),
            })
            .await
            .map_err(|e| BootstrapError::Database(e.to_string()))?;
    }

    tracing::info!(
        librarians = config.librarians.len(),
        stores = config.stores.len(),
        "catalog synced from configuration"
    );
    Ok(())
}
