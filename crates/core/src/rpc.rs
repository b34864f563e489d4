//! Peer RPC request/response models.
//!
//! These are the JSON bodies exchanged between librarians. Idempotency keys
//! are carried in the requests themselves so a retried call lands on the
//! same server-side row.

use crate::checksum::Checksum;
use crate::transfer::{TransferId, TransferStatus, Transport};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Request to open an incoming transfer on the destination librarian.
///
/// Idempotent by `(origin_librarian, origin_transfer_id)`: a retry returns
/// the transfer that the first call created.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareTransferRequest {
    /// Name of the calling librarian.
    pub origin_librarian: String,
    /// The caller's outgoing transfer id.
    pub origin_transfer_id: TransferId,
    /// Logical file name being sent.
    pub file_name: String,
    /// Declared size in bytes.
    pub size: u64,
    /// Declared checksum.
    pub checksum: Checksum,
    /// Transport the caller intends to use.
    pub transport: Transport,
}

/// Where the destination wants the bytes put.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageDescriptor {
    /// Destination store chosen for the transfer.
    pub store_name: String,
    /// Opaque staging location on the destination. For sneakernet transfers
    /// the operator copies bytes here by hand.
    pub staging_path: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrepareTransferResponse {
    /// The destination's incoming transfer id.
    pub remote_id: TransferId,
    pub stage: StageDescriptor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferRefRequest {
    pub remote_id: TransferId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TransferStatusResponse {
    pub remote_id: TransferId,
    pub status: TransferStatus,
}

/// A peer's record that it now holds a copy of a file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteInstanceRecord {
    pub file_name: String,
    pub librarian: String,
    pub store_name: String,
    pub checksum: Checksum,
    #[serde(with = "time::serde::rfc3339")]
    pub committed_at: OffsetDateTime,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitTransferResponse {
    pub status: TransferStatus,
    pub remote_instance: RemoteInstanceRecord,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifyChecksumRequest {
    pub file_name: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VerifyChecksumResponse {
    pub file_name: String,
    pub checksum: Checksum,
    pub size: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub verified_at: OffsetDateTime,
}

/// Ask the origin of a file to send a fresh copy back to the caller.
///
/// Used by corruption remediation. Idempotent: if an equivalent outbound
/// transfer is already pending on the origin, its id is returned.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResendFileRequest {
    pub file_name: String,
    /// The librarian that wants the copy (must match the authenticated
    /// caller).
    pub destination_librarian: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResendFileResponse {
    /// The origin's outgoing transfer id; the caller matches its eventual
    /// incoming transfer by this value.
    pub source_transfer_id: TransferId,
}

/// Request to stage an ingest upload (external uploader surface).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageUploadRequest {
    pub file_name: String,
    pub size: u64,
    pub checksum: Checksum,
    /// Observation this file belongs to, if known at upload time.
    pub observation_id: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StageUploadResponse {
    pub transfer_id: TransferId,
    pub stage: StageDescriptor,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitUploadRequest {
    pub transfer_id: TransferId,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CommitUploadResponse {
    pub file_name: String,
    pub store_name: String,
    pub path: String,
    pub checksum: Checksum,
}

/// File metadata plus known locations, served by `GET /v1/file/{name}`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileInfoResponse {
    pub file_name: String,
    pub size: u64,
    pub checksum: Checksum,
    #[serde(with = "time::serde::rfc3339")]
    pub uploaded_at: OffsetDateTime,
    pub instances: Vec<FileInstanceInfo>,
    pub remote_instances: Vec<RemoteInstanceInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FileInstanceInfo {
    pub store_name: String,
    pub path: String,
    pub available: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RemoteInstanceInfo {
    pub librarian: String,
    #[serde(with = "time::serde::rfc3339")]
    pub copy_time: OffsetDateTime,
    pub verified_checksum: Option<Checksum>,
}
