//! Catalog error types.

use thiserror::Error;

/// Catalog operation errors.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("stale state on {entity}: expected {expected}, found {found}")]
    StaleState {
        entity: String,
        expected: String,
        found: String,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl CatalogError {
    /// Whether a retry with backoff is worthwhile (connection resets, pool
    /// timeouts, lock contention). Logical errors are never transient.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Database(sqlx::Error::Io(_))
            | Self::Database(sqlx::Error::PoolTimedOut)
            | Self::Database(sqlx::Error::PoolClosed) => true,
            Self::Database(sqlx::Error::Database(db)) => {
                // SQLITE_BUSY / SQLITE_LOCKED surface as database errors.
                db.message().contains("locked") || db.message().contains("busy")
            }
            _ => false,
        }
    }
}

/// Result type for catalog operations.
pub type CatalogResult<T> = std::result::Result<T, CatalogError>;
