//! Deferred archive updates.
//!
//! A run may carry actions describing how its archived record should look
//! once the run is finalized. Applying them compares the archived status
//! with the desired one first, so delivering the same action twice writes
//! only once.

use rlc_common::{ArchiveStore, BackendResult, RasAction};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ActionOutcome {
    Updated,
    Unchanged,
    Missing,
}

/// Counts from one sync call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub updated: usize,
    pub unchanged: usize,
    pub missing: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct ArchiveSync {
    archive: Arc<dyn ArchiveStore>,
}

impl ArchiveSync {
    pub fn new(archive: Arc<dyn ArchiveStore>) -> Self {
        Self { archive }
    }

    /// Apply `actions` in order. A failing action is logged and skipped.
    pub async fn sync(&self, run_name: &str, actions: &[RasAction]) -> SyncReport {
        let mut report = SyncReport::default();
        for action in actions {
            match self.apply(action).await {
                Ok(ActionOutcome::Updated) => report.updated += 1,
                Ok(ActionOutcome::Unchanged) => report.unchanged += 1,
                Ok(ActionOutcome::Missing) => report.missing += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        run = %run_name,
                        run_id = %action.run_id,
                        "Failed to apply archive action: {}", e
                    );
                }
            }
        }
        if !actions.is_empty() {
            debug!(
                run = %run_name,
                updated = report.updated,
                unchanged = report.unchanged,
                missing = report.missing,
                failed = report.failed,
                "Archive sync complete"
            );
        }
        report
    }

    async fn apply(&self, action: &RasAction) -> BackendResult<ActionOutcome> {
        let Some(mut record) = self.archive.find_record_by_id(&action.run_id).await? else {
            debug!(run_id = %action.run_id, "No archived record yet, skipping action");
            return Ok(ActionOutcome::Missing);
        };

        if record.status == action.desired_status {
            return Ok(ActionOutcome::Unchanged);
        }

        info!(
            "Updating archived run {} ({}) from '{}' to '{}'",
            record.run_name, action.run_id, record.status, action.desired_status
        );
        record.status = action.desired_status.clone();
        record.result = Some(action.desired_result.clone());
        self.archive.update_record(&action.run_id, &record).await?;
        Ok(ActionOutcome::Updated)
    }
}
