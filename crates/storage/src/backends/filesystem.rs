//! Local filesystem store backend.
//!
//! Layout: committed files live under the store root; staged writes live in
//! `<staging>/<uuid>/<file>` and are promoted by rename, so a commit is
//! atomic on the same filesystem.

use crate::error::{StorageError, StorageResult};
use crate::traits::{CommittedFile, PathInfo, StagingHandle, StoreBackend};
use archivist_core::Checksum;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use uuid::Uuid;

/// Read buffer for checksumming (1 MiB).
const CHECKSUM_CHUNK_SIZE: usize = 1024 * 1024;

/// Capacity bookkeeping: committed bytes on disk plus live reservations.
struct CapacityState {
    committed: u64,
    reserved: HashMap<Uuid, u64>,
}

impl CapacityState {
    fn in_use(&self) -> u64 {
        self.committed + self.reserved.values().sum::<u64>()
    }
}

/// Local filesystem store.
pub struct FilesystemBackend {
    root: PathBuf,
    staging: PathBuf,
    capacity_bytes: u64,
    state: Mutex<CapacityState>,
}

impl FilesystemBackend {
    /// Open a store rooted at `root` with the given capacity. Existing
    /// committed bytes are scanned so accounting survives restarts; stale
    /// staging dregs count until a hypervisor unstages them.
    pub async fn new(
        root: impl AsRef<Path>,
        staging: Option<PathBuf>,
        capacity_bytes: u64,
    ) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        let staging = staging.unwrap_or_else(|| root.join(".staging"));
        fs::create_dir_all(&root).await?;
        fs::create_dir_all(&staging).await?;

        let scan_root = root.clone();
        let scan_staging = staging.clone();
        let committed = tokio::task::spawn_blocking(move || {
            tree_size(&scan_root, Some(&scan_staging))
        })
        .await
        .map_err(|e| StorageError::Io(std::io::Error::other(format!("scan failed: {e}"))))??;

        Ok(Self {
            root,
            staging,
            capacity_bytes,
            state: Mutex::new(CapacityState {
                committed,
                reserved: HashMap::new(),
            }),
        })
    }

    /// Resolve a store-relative path, rejecting traversal.
    fn resolve(&self, base: &Path, rel: &str) -> StorageResult<PathBuf> {
        if rel.is_empty() || rel.starts_with('/') || rel.starts_with('\\') {
            return Err(StorageError::InvalidPath(rel.to_string()));
        }
        for component in Path::new(rel).components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(StorageError::InvalidPath(rel.to_string())),
            }
        }
        Ok(base.join(rel))
    }

    fn staged_file_path(&self, handle: &StagingHandle) -> StorageResult<PathBuf> {
        self.resolve(&self.staging, &handle.staged_path())
    }

    async fn measure(&self, path: &Path) -> StorageResult<PathInfo> {
        use tokio::io::AsyncReadExt;

        let mut file = fs::File::open(path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(path.display().to_string())
            } else {
                StorageError::Io(e)
            }
        })?;

        let mut hasher = Checksum::hasher();
        let mut size = 0u64;
        let mut buf = vec![0u8; CHECKSUM_CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            size += n as u64;
        }

        Ok(PathInfo {
            size,
            checksum: hasher.finalize(),
        })
    }

    fn release_reservation(&self, token: Uuid) {
        let mut state = self.state.lock().unwrap();
        state.reserved.remove(&token);
    }
}

/// Sum of file sizes under `root`, skipping `exclude`.
fn tree_size(root: &Path, exclude: Option<&Path>) -> StorageResult<u64> {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        if exclude.is_some_and(|e| dir == e) {
            continue;
        }
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let meta = entry.metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

#[async_trait]
impl StoreBackend for FilesystemBackend {
    fn backend_kind(&self) -> &'static str {
        "filesystem"
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn stage(&self, file_name: &str, size: u64) -> StorageResult<StagingHandle> {
        if file_name.is_empty() || file_name.contains('/') || file_name.contains("..") {
            return Err(StorageError::InvalidPath(file_name.to_string()));
        }

        let handle = {
            let mut state = self.state.lock().unwrap();
            let free = self.capacity_bytes.saturating_sub(state.in_use());
            if size > free {
                return Err(StorageError::CapacityExceeded { needed: size, free });
            }
            // Reserve under the lock so concurrent stages cannot both fit.
            let handle = StagingHandle::new(file_name);
            state.reserved.insert(handle.token, size);
            handle
        };

        let dir = self.staging.join(handle.token.to_string());
        if let Err(e) = fs::create_dir_all(&dir).await {
            self.release_reservation(handle.token);
            return Err(StorageError::Io(e));
        }
        Ok(handle)
    }

    #[instrument(skip(self, data), fields(backend = "filesystem", len = data.len()))]
    async fn write(&self, handle: &StagingHandle, data: Bytes) -> StorageResult<()> {
        let path = self.staged_file_path(handle)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn reset_staged(&self, handle: &StagingHandle) -> StorageResult<()> {
        let path = self.staged_file_path(handle)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn staged_info(&self, handle: &StagingHandle) -> StorageResult<Option<PathInfo>> {
        let path = self.staged_file_path(handle)?;
        match self.measure(&path).await {
            Ok(info) => Ok(Some(info)),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn commit(
        &self,
        handle: &StagingHandle,
        dest_path: &str,
        expected: &Checksum,
    ) -> StorageResult<CommittedFile> {
        let staged = self.staged_file_path(handle)?;
        let dest = self.resolve(&self.root, dest_path)?;

        let info = self.measure(&staged).await?;
        if &info.checksum != expected {
            return Err(StorageError::ChecksumMismatch {
                expected: expected.to_string(),
                actual: info.checksum.to_string(),
            });
        }

        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(&staged, &dest).await?;

        // Remove the now-empty staging dir; dregs there count as in-use.
        let _ = fs::remove_dir(self.staging.join(handle.token.to_string())).await;

        {
            let mut state = self.state.lock().unwrap();
            state.reserved.remove(&handle.token);
            state.committed += info.size;
        }

        Ok(CommittedFile {
            path: dest_path.to_string(),
            checksum: info.checksum,
            size: info.size,
        })
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn abort(&self, handle: &StagingHandle) -> StorageResult<()> {
        let dir = self.staging.join(handle.token.to_string());
        match fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::Io(e)),
        }
        self.release_reservation(handle.token);
        Ok(())
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn read(&self, path: &str) -> StorageResult<Bytes> {
        let full = self.resolve(&self.root, path)?;
        let data = fs::read(&full).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(path.to_string())
            } else {
                StorageError::Io(e)
            }
        })?;
        Ok(Bytes::from(data))
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn path_info(&self, path: &str) -> StorageResult<PathInfo> {
        let full = self.resolve(&self.root, path)?;
        match self.measure(&full).await {
            Err(StorageError::NotFound(_)) => Err(StorageError::NotFound(path.to_string())),
            other => other,
        }
    }

    #[instrument(skip(self), fields(backend = "filesystem"))]
    async fn delete(&self, path: &str) -> StorageResult<()> {
        let full = self.resolve(&self.root, path)?;
        let size = match fs::metadata(&full).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::Io(e)),
        };
        fs::remove_file(&full).await?;

        let mut state = self.state.lock().unwrap();
        state.committed = state.committed.saturating_sub(size);
        Ok(())
    }

    async fn free_space(&self) -> StorageResult<u64> {
        let state = self.state.lock().unwrap();
        Ok(self.capacity_bytes.saturating_sub(state.in_use()))
    }
}
