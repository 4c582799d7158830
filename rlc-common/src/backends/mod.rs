//! Narrow interfaces onto the controller's external collaborators.
//!
//! The run registry, the orchestrator's pod API, the result archive and the
//! hot configuration source are all owned by other systems. Reconcilers only
//! ever talk to them through these traits.

pub mod file;
pub mod memory;

use crate::selector::LabelSelector;
use crate::types::{ArchiveRecord, Pod, Run, RunStatus};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

pub use file::{FileArchiveStore, FileConfigSource, FileRunRegistry, LocalOrchestrator};
pub use memory::{
    MemoryArchiveDirectory, MemoryArchiveStore, MemoryConfigSource, MemoryOrchestrator,
    MemoryRunRegistry,
};

/// Failure talking to an external collaborator.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0} is unavailable")]
    Unavailable(String),
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Message(String),
}

pub type BackendResult<T> = Result<T, BackendError>;

/// The shared registry of live run records.
///
/// Implementations serialize writes to a single run record; last writer wins.
#[async_trait]
pub trait RunRegistry: Send + Sync {
    async fn list_all_runs(&self) -> BackendResult<Vec<Run>>;

    async fn get_run(&self, name: &str) -> BackendResult<Option<Run>>;

    /// Setting a status the run already has is a no-op. Finishing a run also
    /// takes it off the waiting list.
    async fn set_status(&self, name: &str, status: RunStatus) -> BackendResult<()>;

    /// Record an interrupt. The reason and timestamp are only written if the
    /// run has no interrupt recorded yet, so the grace-period clock is never
    /// reset by a second interrupt.
    async fn mark_interrupted(&self, name: &str, reason: &str) -> BackendResult<()>;

    /// Park a run on the waiting list for a later retry.
    async fn mark_waiting(&self, name: &str) -> BackendResult<()>;

    /// Returns whether a record was removed.
    async fn delete(&self, name: &str) -> BackendResult<bool>;
}

/// The orchestrator hosting one pod per active remote run.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Whether the stores the controller depends on are ready for scans.
    async fn is_ready(&self) -> bool {
        true
    }

    async fn list_pods(&self, selector: &LabelSelector) -> BackendResult<Vec<Pod>>;

    /// Deleting a pod that no longer exists succeeds.
    async fn delete_pod(&self, pod: &Pod) -> BackendResult<()>;
}

/// One backing store of the result archive.
#[async_trait]
pub trait ArchiveDirectory: Send + Sync {
    async fn find_record_by_id(&self, run_id: &str) -> BackendResult<Option<ArchiveRecord>>;
}

/// The result archive, possibly partitioned across several directories.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Directories in lookup order.
    fn directories(&self) -> Vec<Arc<dyn ArchiveDirectory>>;

    async fn update_record(&self, run_id: &str, record: &ArchiveRecord) -> BackendResult<()>;

    /// Find a record by checking each directory in turn, stopping at the first hit.
    async fn find_record_by_id(&self, run_id: &str) -> BackendResult<Option<ArchiveRecord>> {
        for directory in self.directories() {
            if let Some(record) = directory.find_record_by_id(run_id).await? {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

/// One read of the hot configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigSnapshot {
    /// Token that changes whenever the data changes.
    pub version: Option<String>,
    pub data: BTreeMap<String, String>,
}

/// External source of hot-reloadable settings.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn read_config(&self) -> BackendResult<ConfigSnapshot>;
}
