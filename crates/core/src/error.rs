//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid checksum: {0}")]
    InvalidChecksum(String),

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid transfer id: {0}")]
    InvalidTransferId(String),

    #[error("invalid transfer status: {0}")]
    InvalidTransferStatus(String),

    #[error("illegal transfer transition: {from} -> {to}")]
    IllegalTransition { from: String, to: String },

    #[error("invalid duration: {0}")]
    InvalidDuration(String),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
