//! Interrupt detection and processing.
//!
//! Detection and finalization are split across a queue. A detector stops the
//! interrupted run's pod and queues an event; the processor later writes the
//! terminal status. Detectors never write to the registry, so a crash between
//! the two steps only means the run is detected again on the next pass.
//!
//! Two detection strategies exist. [`GracePeriodInterruptDetector`] scans the
//! registry and waits out the configured grace period before acting.
//! [`LivePodsInterruptDetector`] walks the live test pods and acts at once.
//! Exactly one of them is scheduled, chosen by the `interrupt_detection`
//! setting at startup.

use crate::archive_sync::ArchiveSync;
use crate::queue::{EventOrigin, EventQueue, InterruptEvent};
use crate::reconciler::{Backends, Reconciler, SettingsHandle, current};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rlc_common::{
    BackendResult, ENGINE_POD_LABEL, LabelSelector, Pod, RUN_POD_LABEL, Run, RunStatus,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

fn test_pod_selector(engine_label: &str) -> LabelSelector {
    LabelSelector::new()
        .equals(ENGINE_POD_LABEL, engine_label)
        .exists(RUN_POD_LABEL)
}

fn event_for(run: &Run, origin: EventOrigin) -> InterruptEvent {
    InterruptEvent {
        run_name: run.name.clone(),
        ras_actions: run.ras_actions.clone(),
        interrupt_reason: run.interrupt_reason.clone().unwrap_or_default(),
        origin,
    }
}

async fn delete_pod(backends: &Backends, pod: &Pod, run_name: &str) {
    info!(run = %run_name, pod = %pod, "Deleting pod {} as the run has been interrupted", pod);
    if let Err(e) = backends.orchestrator.delete_pod(pod).await {
        warn!(run = %run_name, pod = %pod, "Failed to delete pod: {}", e);
    }
}

// ── Grace-period detector ────────────────────────────────────────────────

/// Whether the grace period for `run`'s interrupt has elapsed at `now`.
///
/// An interrupt without a timestamp is treated as long past. A grace period
/// that runs past the end of representable time never elapses.
pub fn grace_elapsed(run: &Run, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
    match run.interrupted_at {
        Some(interrupted_at) => interrupted_at
            .checked_add_signed(grace)
            .is_some_and(|time_to_act| now >= time_to_act),
        None => true,
    }
}

pub struct GracePeriodInterruptDetector {
    backends: Backends,
    queue: Arc<EventQueue>,
    settings: SettingsHandle,
}

impl GracePeriodInterruptDetector {
    pub const NAME: &'static str = "interrupted-run-detector";

    pub fn new(backends: Backends, queue: Arc<EventQueue>, settings: SettingsHandle) -> Self {
        Self {
            backends,
            queue,
            settings,
        }
    }

    async fn candidates(&self, grace: chrono::Duration) -> BackendResult<Vec<Run>> {
        let runs = self.backends.registry.list_all_runs().await?;
        let now = self.backends.clock.now();
        Ok(runs
            .into_iter()
            .filter(|run| run.is_pending_interrupt())
            .filter(|run| {
                let due = grace_elapsed(run, now, grace);
                if !due {
                    debug!(run = %run.name, "Interrupted run is still within its grace period");
                }
                due
            })
            .collect())
    }

    /// Delete every test pod belonging to `run`. Failures are logged only.
    async fn stop_pods(&self, run: &Run, engine_label: &str) {
        let selector = test_pod_selector(engine_label).equals(RUN_POD_LABEL, run.name.as_str());
        match self.backends.orchestrator.list_pods(&selector).await {
            Ok(pods) => {
                for pod in &pods {
                    delete_pod(&self.backends, pod, &run.name).await;
                }
            }
            Err(e) => warn!(run = %run.name, "Failed to look up pods for interrupted run: {}", e),
        }
    }
}

#[async_trait]
impl Reconciler for GracePeriodInterruptDetector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn reconcile(&self) {
        if !self.backends.orchestrator.is_ready().await {
            warn!("Backends are not ready, skipping scan for interrupted runs");
            return;
        }
        let settings = current(&self.settings);

        let candidates = match self.candidates(settings.interrupt_grace_period()).await {
            Ok(candidates) => candidates,
            Err(e) => {
                error!("Scan for interrupted runs failed: {}", e);
                return;
            }
        };
        if candidates.is_empty() {
            return;
        }
        info!("Found {} interrupted runs to clean up", candidates.len());

        for run in &candidates {
            self.stop_pods(run, &settings.engine_label).await;
        }

        self.queue.extend(candidates.iter().map(|run| {
            event_for(
                run,
                EventOrigin::Registry {
                    interrupted_at: run.interrupted_at,
                },
            )
        }));
    }
}

// ── Live-pods detector ───────────────────────────────────────────────────

pub struct LivePodsInterruptDetector {
    backends: Backends,
    queue: Arc<EventQueue>,
    settings: SettingsHandle,
}

impl LivePodsInterruptDetector {
    pub const NAME: &'static str = "interrupted-pod-detector";

    pub fn new(backends: Backends, queue: Arc<EventQueue>, settings: SettingsHandle) -> Self {
        Self {
            backends,
            queue,
            settings,
        }
    }

    async fn interrupted_run_for(&self, pod: &Pod) -> Option<Run> {
        let run_name = pod.run_name()?;
        match self.backends.registry.get_run(run_name).await {
            Ok(run) => run.filter(Run::is_pending_interrupt),
            Err(e) => {
                warn!(pod = %pod, run = %run_name, "Failed to look up run for pod: {}", e);
                None
            }
        }
    }
}

#[async_trait]
impl Reconciler for LivePodsInterruptDetector {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn reconcile(&self) {
        if !self.backends.orchestrator.is_ready().await {
            warn!("Backends are not ready, skipping scan for interrupted pods");
            return;
        }
        let selector = test_pod_selector(&current(&self.settings).engine_label);

        let pods = match self.backends.orchestrator.list_pods(&selector).await {
            Ok(pods) => pods,
            Err(e) => {
                error!("Scan for interrupted pods failed: {}", e);
                return;
            }
        };

        // Every pod of a run is stopped, but the run is queued once per pass.
        let mut queued = HashSet::new();
        for pod in pods {
            let Some(run) = self.interrupted_run_for(&pod).await else {
                continue;
            };
            delete_pod(&self.backends, &pod, &run.name).await;
            if queued.insert(run.name.clone()) {
                self.queue.enqueue(event_for(&run, EventOrigin::Pod(pod)));
            }
        }
    }
}

// ── Processor ────────────────────────────────────────────────────────────

/// Drains the event queue, finishing each run and applying its archive actions.
pub struct InterruptEventProcessor {
    backends: Backends,
    queue: Arc<EventQueue>,
    archive_sync: ArchiveSync,
}

impl InterruptEventProcessor {
    pub const NAME: &'static str = "interrupt-event-processor";

    pub fn new(backends: Backends, queue: Arc<EventQueue>) -> Self {
        let archive_sync = ArchiveSync::new(backends.archive.clone());
        Self {
            backends,
            queue,
            archive_sync,
        }
    }

    async fn process(&self, event: &InterruptEvent) -> BackendResult<()> {
        match &event.origin {
            EventOrigin::Registry {
                interrupted_at: Some(at),
            } => info!(
                run = %event.run_name,
                reason = %event.interrupt_reason,
                "Marking run {} as finished, interrupted at {}", event.run_name, at.to_rfc3339()
            ),
            EventOrigin::Registry { interrupted_at: None } => info!(
                run = %event.run_name,
                reason = %event.interrupt_reason,
                "Marking run {} as finished", event.run_name
            ),
            EventOrigin::Pod(pod) => info!(
                run = %event.run_name,
                reason = %event.interrupt_reason,
                "Marking run {} as finished, pod {} was stopped", event.run_name, pod
            ),
        }
        self.backends
            .registry
            .set_status(&event.run_name, RunStatus::Finished)
            .await?;
        self.archive_sync
            .sync(&event.run_name, &event.ras_actions)
            .await;
        Ok(())
    }
}

#[async_trait]
impl Reconciler for InterruptEventProcessor {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn reconcile(&self) {
        if self.queue.is_empty() {
            return;
        }
        debug!("Processing {} queued interrupt events", self.queue.size());
        let mut processed = 0usize;
        while let Some(event) = self.queue.dequeue() {
            if let Err(e) = self.process(&event).await {
                error!(run = %event.run_name, "Failed to finish interrupted run: {}", e);
                continue;
            }
            processed += 1;
        }
        if processed > 0 {
            debug!("Processed {} interrupt events", processed);
        }
    }
}
