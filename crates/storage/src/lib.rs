//! Store backends for the archivist librarian.
//!
//! A store holds file bytes plus a staging subtree; nothing else. The
//! catalog owns all metadata. Backends expose staged writes with an atomic
//! commit-rename so readers never observe partial files.

pub mod backends;
pub mod error;
pub mod manager;
pub mod traits;

pub use error::{StorageError, StorageResult};
pub use manager::StoreManager;
pub use traits::{CommittedFile, PathInfo, StagingHandle, StoreBackend};
