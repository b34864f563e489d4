//! Durable catalog of librarians, stores, files, instances, transfers and
//! the send queue.
//!
//! The catalog is the sole owner of persistent state; every other component
//! reaches logical state only through the [`Catalog`] trait. Hot-path
//! mutations (transfer transitions, queue claims) are guarded compare-and-set
//! updates inside short transactions.

pub mod error;
pub mod models;
pub mod repos;
pub mod schema;
pub mod store;

pub use error::{CatalogError, CatalogResult};
pub use store::{Catalog, SqliteCatalog};
