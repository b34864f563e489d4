//! Core domain types for the archivist federated data librarian.
//!
//! This crate defines the canonical data model used across all other crates:
//! - Content checksums and incremental hashing
//! - Transfer state machines and deletion policy
//! - Peer RPC request/response models
//! - Server and background-task configuration

pub mod checksum;
pub mod config;
pub mod error;
pub mod rpc;
pub mod transfer;

pub use checksum::{Checksum, ChecksumHasher};
pub use error::{Error, Result};
pub use transfer::{DeletionPolicy, QueueItemStatus, TransferId, TransferStatus, Transport};
