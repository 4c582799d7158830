//! End-of-run finalization.

use crate::archive_sync::ArchiveSync;
use rlc_common::{ArchiveStore, BackendResult, Run, RunRegistry, RunStatus};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Parked for retry; archive actions were held back.
    Waiting,
    Finished,
    /// Local run finished and removed from the registry.
    Deleted,
}

pub struct RunFinalizer {
    registry: Arc<dyn RunRegistry>,
    archive_sync: ArchiveSync,
}

impl RunFinalizer {
    pub fn new(registry: Arc<dyn RunRegistry>, archive: Arc<dyn ArchiveStore>) -> Self {
        Self {
            registry,
            archive_sync: ArchiveSync::new(archive),
        }
    }

    /// Finish `run`, or park it on the waiting list when a remote run could
    /// not get the resources it needed. Archive actions only run for a real
    /// finish, so a parked run never records a premature result.
    pub async fn finalize_run(
        &self,
        run: &Run,
        resources_available: bool,
    ) -> BackendResult<FinalizeOutcome> {
        if !resources_available && !run.is_local {
            info!(run = %run.name, "Resources unavailable, placing run {} on the waiting list", run.name);
            self.registry.mark_waiting(&run.name).await?;
            return Ok(FinalizeOutcome::Waiting);
        }

        self.registry.set_status(&run.name, RunStatus::Finished).await?;
        self.archive_sync.sync(&run.name, &run.ras_actions).await;

        if run.is_local {
            self.registry.delete(&run.name).await?;
            info!(run = %run.name, "Local run {} finished and removed", run.name);
            return Ok(FinalizeOutcome::Deleted);
        }
        info!(run = %run.name, "Run {} finished", run.name);
        Ok(FinalizeOutcome::Finished)
    }
}
