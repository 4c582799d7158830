//! Lifecycle timeout policies.
//!
//! Each policy scans every run, picks the ones its predicate covers, and
//! acts on those whose deadline has passed. A failed scan is logged and the
//! pass still counts as completed; the next pass scans again from scratch.

use crate::reconciler::{Backends, Reconciler, SettingsHandle, current};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rlc_common::{BackendResult, Clock, Run, RunRegistry, RunStatus, interrupt_reason};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Interrupt `name` as hung if it still satisfies `predicate` at write time.
async fn interrupt_if_still(
    registry: &dyn RunRegistry,
    name: &str,
    predicate: impl Fn(&Run) -> bool,
) -> BackendResult<bool> {
    match registry.get_run(name).await? {
        Some(run) if predicate(&run) => {
            registry.mark_interrupted(name, interrupt_reason::HUNG).await?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

async fn list_runs(registry: &dyn RunRegistry, policy: &str) -> Option<Vec<Run>> {
    match registry.list_all_runs().await {
        Ok(runs) => Some(runs),
        Err(e) => {
            warn!("Scan of runs for {} failed: {}", policy, e);
            None
        }
    }
}

// ── Allocation timeout ───────────────────────────────────────────────────

/// Interrupts runs that stayed allocated past their allocation deadline.
pub struct AllocatedRunTimeout {
    registry: Arc<dyn RunRegistry>,
    clock: Arc<dyn Clock>,
}

impl AllocatedRunTimeout {
    pub const NAME: &'static str = "allocated-run-timeout";

    pub fn new(backends: &Backends) -> Self {
        Self {
            registry: backends.registry.clone(),
            clock: backends.clock.clone(),
        }
    }

    fn expired(run: &Run, now: DateTime<Utc>) -> bool {
        run.status == RunStatus::Allocated
            && run.allocated_timeout.is_some_and(|deadline| now > deadline)
    }
}

#[async_trait]
impl Reconciler for AllocatedRunTimeout {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn reconcile(&self) {
        let Some(runs) = list_runs(self.registry.as_ref(), Self::NAME).await else {
            return;
        };
        let now = self.clock.now();

        for run in runs.iter().filter(|run| Self::expired(run, now)) {
            info!(
                run = %run.name,
                "Interrupting run {} as it has been allocated for too long", run.name
            );
            match interrupt_if_still(self.registry.as_ref(), &run.name, |r| Self::expired(r, now))
                .await
            {
                Ok(true) => {}
                Ok(false) => debug!(run = %run.name, "Run moved on before it could be interrupted"),
                Err(e) => warn!(run = %run.name, "Failed to interrupt allocated run: {}", e),
            }
        }
    }
}

// ── Local queue timeout ──────────────────────────────────────────────────

/// Interrupts local runs that sat in the queue longer than `local_queued_timeout`.
pub struct LocalQueuedRunTimeout {
    registry: Arc<dyn RunRegistry>,
    clock: Arc<dyn Clock>,
    settings: SettingsHandle,
}

impl LocalQueuedRunTimeout {
    pub const NAME: &'static str = "local-queued-run-timeout";

    pub fn new(backends: &Backends, settings: SettingsHandle) -> Self {
        Self {
            registry: backends.registry.clone(),
            clock: backends.clock.clone(),
            settings,
        }
    }

    fn expired(run: &Run, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        run.is_local
            && run.status == RunStatus::Queued
            && run
                .queued
                .and_then(|queued| queued.checked_add_signed(timeout))
                .is_some_and(|deadline| now > deadline)
    }
}

#[async_trait]
impl Reconciler for LocalQueuedRunTimeout {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn reconcile(&self) {
        let timeout = current(&self.settings).local_queued_timeout();
        let Some(runs) = list_runs(self.registry.as_ref(), Self::NAME).await else {
            return;
        };
        let now = self.clock.now();

        for run in runs.iter().filter(|run| Self::expired(run, now, timeout)) {
            info!(
                run = %run.name,
                "Interrupting local run {} as it has been queued for more than {}s",
                run.name,
                timeout.num_seconds()
            );
            let still_expired = |r: &Run| Self::expired(r, now, timeout);
            match interrupt_if_still(self.registry.as_ref(), &run.name, still_expired).await {
                Ok(true) => {}
                Ok(false) => debug!(run = %run.name, "Run moved on before it could be interrupted"),
                Err(e) => warn!(run = %run.name, "Failed to interrupt queued local run: {}", e),
            }
        }
    }
}

// ── Finished-run retention ───────────────────────────────────────────────

/// Deletes finished runs once the retention window has passed.
///
/// A finished run without a finish time has no window and is deleted on
/// sight. Runs parked on the waiting list are kept.
pub struct FinishedRunRetention {
    registry: Arc<dyn RunRegistry>,
    clock: Arc<dyn Clock>,
    settings: SettingsHandle,
}

impl FinishedRunRetention {
    pub const NAME: &'static str = "finished-run-retention";

    pub fn new(backends: &Backends, settings: SettingsHandle) -> Self {
        Self {
            registry: backends.registry.clone(),
            clock: backends.clock.clone(),
            settings,
        }
    }

    fn expired(run: &Run, now: DateTime<Utc>, retention: chrono::Duration) -> bool {
        run.status.is_finished()
            && !run.waiting
            && run.finished.is_none_or(|finished| {
                finished
                    .checked_add_signed(retention)
                    .is_some_and(|expires| expires <= now)
            })
    }
}

#[async_trait]
impl Reconciler for FinishedRunRetention {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn reconcile(&self) {
        let retention = current(&self.settings).finished_timeout();
        let Some(runs) = list_runs(self.registry.as_ref(), Self::NAME).await else {
            return;
        };
        let now = self.clock.now();

        for run in runs.iter().filter(|run| Self::expired(run, now, retention)) {
            match run.finished {
                Some(finished) => info!(
                    run = %run.name,
                    "Deleting run {}, finished at {}", run.name, finished.to_rfc3339()
                ),
                None => info!(run = %run.name, "Deleting run {}, finish time unknown", run.name),
            }
            match self.registry.delete(&run.name).await {
                Ok(true) => {}
                Ok(false) => debug!(run = %run.name, "Run was already deleted"),
                Err(e) => warn!(run = %run.name, "Failed to delete finished run: {}", e),
            }
        }
    }
}
