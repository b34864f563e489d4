//! Transfer state machine and related enums.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Unique identifier for a transfer (either direction).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Generate a new random transfer ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse from a string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| crate::Error::InvalidTransferId(e.to_string()))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for TransferId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl fmt::Debug for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransferId({})", self.0)
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transfer state, shared by outgoing and incoming transfers.
///
/// An incoming transfer reaches `Completed` when its staged bytes have been
/// committed into a store and an instance row exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    /// Transfer row exists; no bytes have moved yet.
    Initiated,
    /// Bytes are moving.
    Ongoing,
    /// All bytes arrived in staging and matched the declared size/checksum.
    Staged,
    /// Terminal success.
    Completed,
    /// Terminal failure.
    Failed,
    /// Terminal, cancelled before staging.
    Cancelled,
}

impl TransferStatus {
    /// Check if the transfer reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Check whether the state machine permits moving to `next`.
    ///
    /// Terminal states are absorbing. Cancellation is only legal before
    /// bytes are fully staged.
    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        match (self, next) {
            (Initiated, Ongoing) => true,
            (Ongoing, Staged) => true,
            (Staged, Completed) => true,
            (Initiated | Ongoing, Cancelled) => true,
            (Initiated | Ongoing | Staged, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initiated => "initiated",
            Self::Ongoing => "ongoing",
            Self::Staged => "staged",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "initiated" => Ok(Self::Initiated),
            "ongoing" => Ok(Self::Ongoing),
            "staged" => Ok(Self::Staged),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(crate::Error::InvalidTransferStatus(other.to_string())),
        }
    }
}

/// Whether an instance's bytes may be removed by rolling deletion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionPolicy {
    Allowed,
    Disallowed,
}

impl DeletionPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Allowed => "allowed",
            Self::Disallowed => "disallowed",
        }
    }
}

impl FromStr for DeletionPolicy {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "allowed" => Ok(Self::Allowed),
            "disallowed" => Ok(Self::Disallowed),
            other => Err(crate::Error::Config(format!(
                "unknown deletion policy: {other}"
            ))),
        }
    }
}

/// Transport used to move bytes between librarians.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Streamed over the peer HTTP surface.
    Network,
    /// Physical drive shuffle; bytes arrive out of band.
    Sneakernet,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Sneakernet => "sneakernet",
        }
    }
}

impl FromStr for Transport {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "network" => Ok(Self::Network),
            "sneakernet" => Ok(Self::Sneakernet),
            other => Err(crate::Error::Config(format!("unknown transport: {other}"))),
        }
    }
}

/// Send-queue item lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    Pending,
    Claimed,
    Done,
    Failed,
}

impl QueueItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

impl FromStr for QueueItemStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "claimed" => Ok(Self::Claimed),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(crate::Error::Config(format!(
                "unknown queue item status: {other}"
            ))),
        }
    }
}
