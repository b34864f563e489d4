//! Shared test harness: in-process librarian sites wired together through
//! a loopback peer transport.

// Each test binary compiles its own copy; not every binary uses every
// helper.
#![allow(dead_code)]

use archivist_catalog::models::{LibrarianRow, NewFile, NewInstance, NewLibrarian, NewStore};
use archivist_catalog::repos::{LibrarianRepo, StoreRepo};
use archivist_catalog::SqliteCatalog;
use archivist_core::config::{AppConfig, StoreBackendConfig, StoreConfig};
use archivist_core::rpc::{
    CommitTransferResponse, PrepareTransferRequest, PrepareTransferResponse, ResendFileRequest,
    ResendFileResponse, TransferRefRequest, TransferStatusResponse, VerifyChecksumResponse,
};
use archivist_core::{Checksum, DeletionPolicy, TransferId};
use archivist_server::handlers::{checksum, clone};
use archivist_server::notify::CollectingNotifier;
use archivist_server::peer::{Peer, PeerError, PeerProvider, PeerResult};
use archivist_server::tasks::TaskContext;
use archivist_server::{ApiError, AppState};
use archivist_storage::StoreManager;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use time::{Duration, OffsetDateTime};

/// Routes peer calls to other in-process sites by librarian name.
#[derive(Default)]
pub struct LoopbackRegistry {
    sites: Mutex<HashMap<String, AppState>>,
    down: Mutex<HashSet<String>>,
}

impl LoopbackRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, name: &str, state: AppState) {
        self.sites.lock().unwrap().insert(name.to_string(), state);
    }

    /// Simulate a dead peer; its calls fail as unreachable.
    pub fn set_down(&self, name: &str, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(name.to_string());
        } else {
            set.remove(name);
        }
    }

    fn get(&self, name: &str) -> PeerResult<AppState> {
        if self.down.lock().unwrap().contains(name) {
            return Err(PeerError::Unreachable(format!("{name} is down")));
        }
        self.sites
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| PeerError::Unreachable(format!("{name} not registered")))
    }
}

pub struct LoopbackPeerProvider {
    pub registry: Arc<LoopbackRegistry>,
}

impl PeerProvider for LoopbackPeerProvider {
    fn peer_for(&self, librarian: &LibrarianRow) -> Arc<dyn Peer> {
        Arc::new(LoopbackPeer {
            target: librarian.name.clone(),
            registry: self.registry.clone(),
        })
    }
}

pub struct LoopbackPeer {
    target: String,
    registry: Arc<LoopbackRegistry>,
}

fn reject(e: ApiError) -> PeerError {
    PeerError::Rejected(e.to_string())
}

#[async_trait]
impl Peer for LoopbackPeer {
    async fn ping(&self) -> PeerResult<()> {
        self.registry.get(&self.target).map(|_| ())
    }

    async fn prepare_transfer(
        &self,
        req: &PrepareTransferRequest,
    ) -> PeerResult<PrepareTransferResponse> {
        let state = self.registry.get(&self.target)?;
        let origin = state
            .catalog
            .get_librarian(&req.origin_librarian)
            .await
            .map_err(|e| PeerError::Protocol(e.to_string()))?
            .ok_or_else(|| PeerError::Rejected(format!("unknown origin {}", req.origin_librarian)))?;
        clone::prepare_clone(&state, origin.id, req)
            .await
            .map_err(reject)
    }

    async fn upload_bytes(&self, remote_id: TransferId, data: Bytes) -> PeerResult<()> {
        let state = self.registry.get(&self.target)?;
        clone::receive_clone_bytes(&state, *remote_id.as_uuid(), data)
            .await
            .map(|_| ())
            .map_err(reject)
    }

    async fn staged_transfer(&self, remote_id: TransferId) -> PeerResult<TransferStatusResponse> {
        let state = self.registry.get(&self.target)?;
        clone::staged_clone(&state, *remote_id.as_uuid())
            .await
            .map_err(reject)
    }

    async fn commit_transfer(&self, remote_id: TransferId) -> PeerResult<CommitTransferResponse> {
        let state = self.registry.get(&self.target)?;
        clone::commit_clone(&state, *remote_id.as_uuid(), DeletionPolicy::Disallowed)
            .await
            .map_err(reject)
    }

    async fn transfer_status(&self, remote_id: TransferId) -> PeerResult<TransferStatusResponse> {
        let state = self.registry.get(&self.target)?;
        clone::transfer_status(&state, *remote_id.as_uuid())
            .await
            .map_err(reject)
    }

    async fn cancel_transfer(&self, remote_id: TransferId) -> PeerResult<TransferStatusResponse> {
        let state = self.registry.get(&self.target)?;
        clone::cancel_transfer(&state, *remote_id.as_uuid())
            .await
            .map_err(reject)
    }

    async fn verify_checksum(&self, file_name: &str) -> PeerResult<VerifyChecksumResponse> {
        let state = self.registry.get(&self.target)?;
        checksum::verify_file_checksum(&state, file_name)
            .await
            .map_err(reject)
    }

    async fn resend_file(&self, req: &ResendFileRequest) -> PeerResult<ResendFileResponse> {
        let state = self.registry.get(&self.target)?;
        let destination = state
            .catalog
            .get_librarian(&req.destination_librarian)
            .await
            .map_err(|e| PeerError::Protocol(e.to_string()))?
            .ok_or_else(|| {
                PeerError::Rejected(format!("unknown destination {}", req.destination_librarian))
            })?;
        clone::resend_file(&state, destination.id, req)
            .await
            .map_err(reject)
    }
}

pub struct TestSite {
    pub state: AppState,
    pub ctx: TaskContext,
    pub notifier: Arc<CollectingNotifier>,
    pub store_roots: HashMap<String, PathBuf>,
    /// Concrete catalog handle, for tests that need raw SQL access.
    pub sqlite: Arc<SqliteCatalog>,
    _temp: TempDir,
}

#[derive(Clone, Copy)]
pub struct StoreSpec {
    pub name: &'static str,
    pub capacity: u64,
    pub ingestable: bool,
}

impl StoreSpec {
    pub fn new(name: &'static str, capacity: u64) -> Self {
        Self {
            name,
            capacity,
            ingestable: true,
        }
    }
}

/// Build an in-process site with the given stores and register it with
/// the loopback registry.
pub async fn build_site(
    registry: &Arc<LoopbackRegistry>,
    name: &str,
    stores: &[StoreSpec],
) -> TestSite {
    let temp = TempDir::new().unwrap();
    let mut config = AppConfig::for_testing(name);
    let mut store_roots = HashMap::new();

    for spec in stores {
        let root = temp.path().join(spec.name);
        store_roots.insert(spec.name.to_string(), root.clone());
        config.stores.push(StoreConfig {
            name: spec.name.to_string(),
            backend: StoreBackendConfig::Filesystem {
                root,
                staging: None,
            },
            capacity_bytes: spec.capacity,
            ingestable: spec.ingestable,
            enabled: true,
        });
    }

    let catalog = Arc::new(SqliteCatalog::in_memory().await.unwrap());
    let store_manager = StoreManager::from_config(&config.stores).await.unwrap();

    catalog
        .upsert_librarian(&NewLibrarian {
            name: name.to_string(),
            url: "loopback://self".to_string(),
            auth_token: String::new(),
            network_transport: true,
            sneakernet_transport: false,
        })
        .await
        .unwrap();
    for spec in stores {
        catalog
            .upsert_store(&NewStore {
                name: spec.name.to_string(),
                backend_kind: "filesystem".to_string(),
                root: store_roots[spec.name].display().to_string(),
                capacity_bytes: spec.capacity as i64,
                enabled: true,
                ingestable: spec.ingestable,
            })
            .await
            .unwrap();
    }

    let notifier = Arc::new(CollectingNotifier::new());
    let provider = Arc::new(LoopbackPeerProvider {
        registry: registry.clone(),
    });
    let state = AppState::new(
        config,
        catalog.clone(),
        store_manager,
        provider,
        notifier.clone(),
    );
    registry.register(name, state.clone());

    TestSite {
        ctx: TaskContext::new(state.clone()),
        state,
        notifier,
        store_roots,
        sqlite: catalog,
        _temp: temp,
    }
}

/// Teach two sites about each other.
pub async fn link_sites(a: &TestSite, b: &TestSite) {
    a.state
        .catalog
        .upsert_librarian(&NewLibrarian {
            name: b.state.name().to_string(),
            url: format!("loopback://{}", b.state.name()),
            auth_token: format!("token-{}", b.state.name()),
            network_transport: true,
            sneakernet_transport: false,
        })
        .await
        .unwrap();
    b.state
        .catalog
        .upsert_librarian(&NewLibrarian {
            name: a.state.name().to_string(),
            url: format!("loopback://{}", a.state.name()),
            auth_token: format!("token-{}", a.state.name()),
            network_transport: true,
            sneakernet_transport: false,
        })
        .await
        .unwrap();
}

/// Place a file on a site's store and create its catalog rows, backdated
/// by `days_old`.
pub async fn ingest_file(
    site: &TestSite,
    store_name: &str,
    file_name: &str,
    data: &[u8],
    days_old: i64,
    deletion_policy: DeletionPolicy,
) -> Checksum {
    let backend = site.state.stores.get(store_name).unwrap();
    let checksum = Checksum::compute(data);

    let handle = backend.stage(file_name, data.len() as u64).await.unwrap();
    backend
        .write(&handle, Bytes::copy_from_slice(data))
        .await
        .unwrap();
    backend.commit(&handle, file_name, &checksum).await.unwrap();

    let store = site
        .state
        .catalog
        .get_store(store_name)
        .await
        .unwrap()
        .unwrap();
    let when = OffsetDateTime::now_utc() - Duration::days(days_old);
    site.state
        .catalog
        .create_file(
            &NewFile {
                name: file_name.to_string(),
                source_librarian: site.state.name().to_string(),
                size_bytes: data.len() as i64,
                checksum,
                uploaded_at: when,
                observation_id: None,
            },
            Some(&NewInstance {
                file_name: file_name.to_string(),
                store_id: store.id,
                path: file_name.to_string(),
                deletion_policy,
                created_at: when,
            }),
        )
        .await
        .unwrap();

    checksum
}

/// A deadline comfortably in the future for direct task runs.
pub fn soon() -> OffsetDateTime {
    OffsetDateTime::now_utc() + Duration::seconds(30)
}
