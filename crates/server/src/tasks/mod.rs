//! Background task framework and the task catalog.
//!
//! Every task is a pure function over the catalog, the stores, the
//! transfer engine and the peer RPC, parameterized by its config entry.
//! Tasks check their deadline between work units and catch non-fatal
//! errors at the work-unit boundary.

pub mod check_consumed_queue;
pub mod check_integrity;
pub mod consume_queue;
pub mod corruption_fixer;
pub mod create_local_clone;
pub mod hypervisor;
pub mod receive_clone;
pub mod rolling_deletion;
pub mod send_clone;

pub use check_consumed_queue::CheckConsumedQueue;
pub use check_integrity::CheckIntegrity;
pub use consume_queue::ConsumeQueue;
pub use corruption_fixer::CorruptionFixer;
pub use create_local_clone::CreateLocalClone;
pub use hypervisor::{
    DuplicateRemoteInstanceHypervisor, IncomingTransferHypervisor, OutgoingTransferHypervisor,
};
pub use receive_clone::ReceiveClone;
pub use rolling_deletion::RollingDeletion;
pub use send_clone::SendClone;

use crate::error::ApiError;
use crate::peer::PeerError;
use crate::state::AppState;
use crate::transfer::TransferManager;
use archivist_catalog::CatalogError;
use archivist_core::config::TaskConfig;
use archivist_storage::StorageError;
use async_trait::async_trait;
use std::sync::Arc;
use time::OffsetDateTime;

/// Context threaded into every task run.
#[derive(Clone)]
pub struct TaskContext {
    pub state: AppState,
    pub transfers: Arc<TransferManager>,
}

impl TaskContext {
    pub fn new(state: AppState) -> Self {
        let transfers = Arc::new(TransferManager::new(state.clone()));
        Self { state, transfers }
    }
}

/// Errors that abort a task's current tick. Per-work-unit failures are
/// logged and skipped instead.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("peer error: {0}")]
    Peer(#[from] PeerError),

    #[error("core error: {0}")]
    Core(#[from] archivist_core::Error),

    #[error("missing: {0}")]
    Missing(String),

    #[error("task misconfigured: {0}")]
    Config(String),
}

impl From<ApiError> for TaskError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::Catalog(inner) => Self::Catalog(inner),
            ApiError::Storage(inner) => Self::Storage(inner),
            ApiError::Core(inner) => Self::Core(inner),
            ApiError::NotFound(what) => Self::Missing(what),
            other => Self::Config(other.to_string()),
        }
    }
}

pub type TaskResult<T> = std::result::Result<T, TaskError>;

/// How a tick ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// All eligible work was processed.
    Completed,
    /// The soft timeout landed mid-batch; the rest waits for the next tick.
    DeadlineExceeded,
}

/// A schedulable background task.
#[async_trait]
pub trait Task: Send + Sync {
    /// Instance name for logs.
    fn name(&self) -> &str;

    /// Run one tick, finishing the current work unit once `deadline`
    /// passes.
    async fn run(&self, ctx: &TaskContext, deadline: OffsetDateTime) -> TaskResult<TaskOutcome>;
}

/// Construct the task for a config entry.
pub fn build(config: &TaskConfig) -> Box<dyn Task> {
    match config {
        TaskConfig::CheckIntegrity(c) => Box::new(CheckIntegrity::new(c.clone())),
        TaskConfig::CreateLocalClone(c) => Box::new(CreateLocalClone::new(c.clone())),
        TaskConfig::SendClone(c) => Box::new(SendClone::new(c.clone())),
        TaskConfig::ConsumeQueue(c) => Box::new(ConsumeQueue::new(c.clone())),
        TaskConfig::CheckConsumedQueue(c) => Box::new(CheckConsumedQueue::new(c.clone())),
        TaskConfig::ReceiveClone(c) => Box::new(ReceiveClone::new(c.clone())),
        TaskConfig::IncomingTransferHypervisor(c) => {
            Box::new(IncomingTransferHypervisor::new(c.clone()))
        }
        TaskConfig::OutgoingTransferHypervisor(c) => {
            Box::new(OutgoingTransferHypervisor::new(c.clone()))
        }
        TaskConfig::DuplicateRemoteInstanceHypervisor(c) => {
            Box::new(DuplicateRemoteInstanceHypervisor::new(c.clone()))
        }
        TaskConfig::RollingDeletion(c) => Box::new(RollingDeletion::new(c.clone())),
        TaskConfig::CorruptionFixer(c) => Box::new(CorruptionFixer::new(c.clone())),
    }
}

/// True once `deadline` has passed; callers finish their current work unit
/// and return.
pub(crate) fn past_deadline(deadline: OffsetDateTime) -> bool {
    OffsetDateTime::now_utc() >= deadline
}
