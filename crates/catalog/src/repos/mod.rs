//! Repository traits for catalog operations.

pub mod corrupt;
pub mod files;
pub mod instances;
pub mod librarians;
pub mod observations;
pub mod queue;
pub mod remote_instances;
pub mod stores;
pub mod transfers;

pub use corrupt::CorruptFileRepo;
pub use files::FileRepo;
pub use instances::InstanceRepo;
pub use librarians::LibrarianRepo;
pub use observations::ObservationRepo;
pub use queue::QueueRepo;
pub use remote_instances::RemoteInstanceRepo;
pub use stores::StoreRepo;
pub use transfers::TransferRepo;
