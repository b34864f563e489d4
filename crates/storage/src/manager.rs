//! Named store registry built from configuration.

use crate::backends::FilesystemBackend;
use crate::error::{StorageError, StorageResult};
use crate::traits::StoreBackend;
use archivist_core::config::{StoreBackendConfig, StoreConfig};
use std::collections::HashMap;
use std::sync::Arc;

/// Maps store names to their backends. The catalog owns the logical store
/// rows (enabled flags, byte accounting); this is just the I/O side.
#[derive(Clone, Default)]
pub struct StoreManager {
    backends: HashMap<String, Arc<dyn StoreBackend>>,
}

impl StoreManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Construct every configured backend. Remote backend kinds are
    /// external byte movers and cannot be constructed here.
    pub async fn from_config(stores: &[StoreConfig]) -> StorageResult<Self> {
        let mut manager = Self::new();
        for store in stores {
            let backend: Arc<dyn StoreBackend> = match &store.backend {
                StoreBackendConfig::Filesystem { root, staging } => Arc::new(
                    FilesystemBackend::new(root, staging.clone(), store.capacity_bytes).await?,
                ),
                StoreBackendConfig::Rsync { host, .. } => {
                    return Err(StorageError::Config(format!(
                        "store {}: rsync backend ({host}) requires the external transfer agent",
                        store.name
                    )));
                }
                StoreBackendConfig::Globus { endpoint, .. } => {
                    return Err(StorageError::Config(format!(
                        "store {}: globus backend ({endpoint}) requires the external transfer agent",
                        store.name
                    )));
                }
            };
            manager.insert(&store.name, backend);
        }
        Ok(manager)
    }

    pub fn insert(&mut self, name: &str, backend: Arc<dyn StoreBackend>) {
        self.backends.insert(name.to_string(), backend);
    }

    pub fn get(&self, name: &str) -> StorageResult<Arc<dyn StoreBackend>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("store {name}")))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
