//! Database models mapping to the catalog schema.
//!
//! Status and policy columns are stored as their textual forms; the typed
//! accessors parse them back into the core enums.

use archivist_core::{Checksum, DeletionPolicy, QueueItemStatus, TransferStatus, Transport};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Librarians and stores
// =============================================================================

/// A known peer site, or ourselves.
#[derive(Debug, Clone, FromRow)]
pub struct LibrarianRow {
    pub id: i64,
    pub name: String,
    pub url: String,
    pub auth_token: String,
    pub transfers_enabled: bool,
    pub network_transport: bool,
    pub sneakernet_transport: bool,
    /// Set when transfers were last disabled; cleared on re-enable.
    pub disabled_since: Option<OffsetDateTime>,
    pub last_seen_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl LibrarianRow {
    pub fn supports(&self, transport: Transport) -> bool {
        match transport {
            Transport::Network => self.network_transport,
            Transport::Sneakernet => self.sneakernet_transport,
        }
    }
}

/// Fields for creating or refreshing a librarian row from configuration.
#[derive(Debug, Clone)]
pub struct NewLibrarian {
    pub name: String,
    pub url: String,
    pub auth_token: String,
    pub network_transport: bool,
    pub sneakernet_transport: bool,
}

/// A local store's catalog record. Byte accounting (`used_bytes`) is
/// maintained in the same transaction as the instance mutation it mirrors.
#[derive(Debug, Clone, FromRow)]
pub struct StoreRow {
    pub id: i64,
    pub name: String,
    pub backend_kind: String,
    pub root: String,
    pub capacity_bytes: i64,
    pub used_bytes: i64,
    pub enabled: bool,
    pub ingestable: bool,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct NewStore {
    pub name: String,
    pub backend_kind: String,
    pub root: String,
    pub capacity_bytes: i64,
    pub enabled: bool,
    pub ingestable: bool,
}

// =============================================================================
// Observations, files, instances
// =============================================================================

/// An observation; immutable after creation. Ids are externally supplied by
/// the originating instrument.
#[derive(Debug, Clone, FromRow)]
pub struct ObservationRow {
    pub id: i64,
    pub julian_date: f64,
    pub polarization: String,
    pub length_seconds: f64,
}

/// A logical file. Uniqueness is by name; the checksum is immutable after
/// first ingest.
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub name: String,
    pub source_librarian: String,
    pub size_bytes: i64,
    pub checksum: String,
    pub uploaded_at: OffsetDateTime,
    pub observation_id: Option<i64>,
}

impl FileRow {
    pub fn checksum(&self) -> archivist_core::Result<Checksum> {
        Checksum::parse(&self.checksum)
    }
}

#[derive(Debug, Clone)]
pub struct NewFile {
    pub name: String,
    pub source_librarian: String,
    pub size_bytes: i64,
    pub checksum: Checksum,
    pub uploaded_at: OffsetDateTime,
    pub observation_id: Option<i64>,
}

/// Local bytes of a file on one store.
#[derive(Debug, Clone, FromRow)]
pub struct InstanceRow {
    pub id: i64,
    pub file_name: String,
    pub store_id: i64,
    pub path: String,
    pub deletion_policy: String,
    pub created_at: OffsetDateTime,
    pub available: bool,
    /// Checksum last measured on disk, reused while fresh.
    pub calculated_checksum: Option<String>,
    pub calculated_size: Option<i64>,
    pub checksum_time: Option<OffsetDateTime>,
}

impl InstanceRow {
    pub fn deletion_policy(&self) -> archivist_core::Result<DeletionPolicy> {
        self.deletion_policy.parse()
    }
}

#[derive(Debug, Clone)]
pub struct NewInstance {
    pub file_name: String,
    pub store_id: i64,
    pub path: String,
    pub deletion_policy: DeletionPolicy,
    pub created_at: OffsetDateTime,
}

/// A peer's claimed copy of one of our files.
#[derive(Debug, Clone, FromRow)]
pub struct RemoteInstanceRow {
    pub id: i64,
    pub file_name: String,
    pub librarian_id: i64,
    pub copy_time: OffsetDateTime,
    pub last_verified_at: Option<OffsetDateTime>,
    pub verified_checksum: Option<String>,
    /// Name of the librarian that sent the copy.
    pub sender: String,
}

// =============================================================================
// Transfers
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct OutgoingTransferRow {
    pub id: Uuid,
    pub file_name: String,
    pub destination_id: i64,
    pub source_store_id: Option<i64>,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub remote_transfer_id: Option<Uuid>,
    pub attempt_count: i64,
    pub transport: String,
    pub bytes_transferred: i64,
}

impl OutgoingTransferRow {
    pub fn transfer_status(&self) -> archivist_core::Result<TransferStatus> {
        self.status.parse()
    }
}

#[derive(Debug, Clone)]
pub struct NewOutgoingTransfer {
    pub id: Uuid,
    pub file_name: String,
    pub destination_id: i64,
    pub source_store_id: Option<i64>,
    pub transport: Transport,
    pub created_at: OffsetDateTime,
}

#[derive(Debug, Clone, FromRow)]
pub struct IncomingTransferRow {
    pub id: Uuid,
    pub file_name: String,
    pub source_librarian_id: i64,
    pub store_id: Option<i64>,
    pub staging_path: Option<String>,
    pub declared_size: i64,
    pub declared_checksum: String,
    /// Observation the file belongs to; only set on ingest uploads.
    pub observation_id: Option<i64>,
    pub status: String,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    /// The sender's outgoing transfer id; idempotency key for
    /// prepare_transfer together with the source librarian.
    pub source_transfer_id: Uuid,
}

impl IncomingTransferRow {
    pub fn transfer_status(&self) -> archivist_core::Result<TransferStatus> {
        self.status.parse()
    }

    pub fn declared_checksum(&self) -> archivist_core::Result<Checksum> {
        Checksum::parse(&self.declared_checksum)
    }
}

#[derive(Debug, Clone)]
pub struct NewIncomingTransfer {
    pub id: Uuid,
    pub file_name: String,
    pub source_librarian_id: i64,
    pub store_id: Option<i64>,
    pub staging_path: Option<String>,
    pub declared_size: i64,
    pub declared_checksum: Checksum,
    pub observation_id: Option<i64>,
    pub source_transfer_id: Uuid,
    pub created_at: OffsetDateTime,
}

/// Column updates that may ride along a transfer state transition.
#[derive(Debug, Clone, Default)]
pub struct TransferUpdates {
    pub remote_transfer_id: Option<Uuid>,
    pub bytes_transferred: Option<i64>,
    pub increment_attempts: bool,
}

/// Column updates for an incoming transfer transition.
#[derive(Debug, Clone, Default)]
pub struct IncomingTransferUpdates {
    pub store_id: Option<i64>,
    pub staging_path: Option<String>,
}

// =============================================================================
// Send queue and corruption tracking
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct SendQueueItemRow {
    pub id: i64,
    pub outgoing_transfer_id: Uuid,
    pub priority: i64,
    pub enqueued_at: OffsetDateTime,
    pub claimed_by: Option<Uuid>,
    pub claim_deadline: Option<OffsetDateTime>,
    pub status: String,
}

impl SendQueueItemRow {
    pub fn item_status(&self) -> archivist_core::Result<QueueItemStatus> {
        self.status.parse()
    }
}

/// A detected corruption and its remediation progress.
#[derive(Debug, Clone, FromRow)]
pub struct CorruptFileRow {
    pub id: i64,
    pub file_name: String,
    /// Origin librarian of the file, kept here so remediation can still
    /// reach the origin after the file row itself was deleted.
    pub file_source: String,
    pub instance_id: i64,
    pub detected_at: OffsetDateTime,
    /// Which check found it: `integrity_check` or `predeletion_audit`.
    pub detector: String,
    /// Times this corruption has been re-detected.
    pub corrupt_count: i64,
    pub replacement_requested: bool,
    /// The origin's outgoing transfer id for the replacement copy.
    pub repair_transfer_id: Option<Uuid>,
}
