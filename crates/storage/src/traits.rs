//! Store backend trait definitions.

use crate::error::{StorageError, StorageResult};
use archivist_core::Checksum;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use uuid::Uuid;

/// A staged write in progress. The textual form (`<uuid>/<file name>`) is
/// what the catalog persists, so a handle survives process restarts.
#[derive(Clone, PartialEq, Eq)]
pub struct StagingHandle {
    /// Staging subdirectory, unique per staged write.
    pub token: Uuid,
    /// File name inside the staging subdirectory.
    pub file_name: String,
}

impl StagingHandle {
    pub fn new(file_name: &str) -> Self {
        Self {
            token: Uuid::new_v4(),
            file_name: file_name.to_string(),
        }
    }

    /// Parse the persisted `<uuid>/<file name>` form.
    pub fn parse(s: &str) -> StorageResult<Self> {
        let (token, file_name) = s
            .split_once('/')
            .ok_or_else(|| StorageError::InvalidStagingHandle(s.to_string()))?;
        let token = Uuid::parse_str(token)
            .map_err(|e| StorageError::InvalidStagingHandle(format!("{s}: {e}")))?;
        if file_name.is_empty() || file_name.contains('/') {
            return Err(StorageError::InvalidStagingHandle(s.to_string()));
        }
        Ok(Self {
            token,
            file_name: file_name.to_string(),
        })
    }

    /// Store-relative path of the staged file.
    pub fn staged_path(&self) -> String {
        format!("{}/{}", self.token, self.file_name)
    }
}

impl fmt::Debug for StagingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StagingHandle({})", self.staged_path())
    }
}

impl fmt::Display for StagingHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.staged_path())
    }
}

/// Measured size and checksum of on-disk bytes.
#[derive(Clone, Debug)]
pub struct PathInfo {
    pub size: u64,
    pub checksum: Checksum,
}

/// Result of a successful commit.
#[derive(Clone, Debug)]
pub struct CommittedFile {
    /// Store-relative path of the committed file.
    pub path: String,
    pub checksum: Checksum,
    pub size: u64,
}

/// A physical store: staged writes, atomic commit, reads, checksums,
/// deletes and capacity queries.
///
/// Transfer code never branches on the backend kind beyond initiation;
/// every backend honors the same contract:
/// - `stage` reserves capacity and must be safe to `abort` without side
///   effects.
/// - `commit` is atomic with respect to readers: the full file appears at
///   its final path with a matching checksum, or nothing appears.
/// - `delete` is idempotent.
#[async_trait]
pub trait StoreBackend: Send + Sync + 'static {
    /// Static identifier of the backend kind, for logging and the catalog.
    fn backend_kind(&self) -> &'static str;

    /// Reserve capacity and create a staging location for `size` bytes.
    async fn stage(&self, file_name: &str, size: u64) -> StorageResult<StagingHandle>;

    /// Append bytes to the staged file.
    async fn write(&self, handle: &StagingHandle, data: Bytes) -> StorageResult<()>;

    /// Drop any bytes already staged for `handle`, keeping the reservation.
    /// Lets a retried byte push start over instead of appending twice.
    async fn reset_staged(&self, handle: &StagingHandle) -> StorageResult<()>;

    /// Measured size and checksum of the staged bytes so far. `None` if
    /// nothing has been written yet.
    async fn staged_info(&self, handle: &StagingHandle) -> StorageResult<Option<PathInfo>>;

    /// Verify the staged bytes against `expected` and atomically move them
    /// to `dest_path`. On mismatch nothing appears at `dest_path`.
    async fn commit(
        &self,
        handle: &StagingHandle,
        dest_path: &str,
        expected: &Checksum,
    ) -> StorageResult<CommittedFile>;

    /// Discard a staged write and release its reservation. Idempotent.
    async fn abort(&self, handle: &StagingHandle) -> StorageResult<()>;

    /// Read a committed file.
    async fn read(&self, path: &str) -> StorageResult<Bytes>;

    /// Measure a committed file.
    async fn path_info(&self, path: &str) -> StorageResult<PathInfo>;

    /// Delete a committed file. Idempotent.
    async fn delete(&self, path: &str) -> StorageResult<()>;

    /// Bytes available for new stages.
    async fn free_space(&self) -> StorageResult<u64>;
}
