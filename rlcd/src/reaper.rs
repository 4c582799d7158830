//! Orphan pod reaper.
//!
//! Walks the live test pods and deletes those whose run is finished or no
//! longer in the registry. The scan starts from pods, so a queued run that
//! has no pod yet is never considered.
//!
//! A run record whose lifecycle state cannot be read is a defect. It is
//! logged at error level and its pod is reaped.

use crate::reconciler::{Backends, Reconciler, SettingsHandle, current};
use async_trait::async_trait;
use rlc_common::{
    BackendError, BackendResult, ENGINE_POD_LABEL, LabelSelector, Pod, RUN_POD_LABEL,
};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    RunFinished,
    RunMissing,
    RunUnreadable,
    Keep,
}

pub struct OrphanPodReaper {
    backends: Backends,
    settings: SettingsHandle,
}

impl OrphanPodReaper {
    pub const NAME: &'static str = "orphan-pod-reaper";

    pub fn new(backends: Backends, settings: SettingsHandle) -> Self {
        Self { backends, settings }
    }

    async fn judge(&self, run_name: &str) -> BackendResult<Verdict> {
        match self.backends.registry.get_run(run_name).await {
            Ok(None) => Ok(Verdict::RunMissing),
            Ok(Some(run)) if run.status.is_finished() => Ok(Verdict::RunFinished),
            Ok(Some(_)) => Ok(Verdict::Keep),
            Err(BackendError::Serialization(e)) => {
                error!(run = %run_name, "Run record has an unrecognised lifecycle state: {}", e);
                Ok(Verdict::RunUnreadable)
            }
            Err(e) => Err(e),
        }
    }

    async fn reap(&self, pod: &Pod) {
        let Some(run_name) = pod.run_name() else {
            return;
        };
        let verdict = match self.judge(run_name).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(pod = %pod, run = %run_name, "Failed to look up run for pod: {}", e);
                return;
            }
        };
        match verdict {
            Verdict::Keep => {
                debug!(pod = %pod, run = %run_name, "Run is still active, keeping pod");
                return;
            }
            Verdict::RunFinished => {
                info!(pod = %pod, run = %run_name, "Deleting pod {} as run {} has finished", pod, run_name)
            }
            Verdict::RunMissing => {
                info!(pod = %pod, run = %run_name, "Deleting pod {} as run {} no longer exists", pod, run_name)
            }
            Verdict::RunUnreadable => {
                warn!(pod = %pod, run = %run_name, "Deleting pod {} as run {} cannot be interpreted", pod, run_name)
            }
        }
        if let Err(e) = self.backends.orchestrator.delete_pod(pod).await {
            warn!(pod = %pod, run = %run_name, "Failed to delete orphaned pod: {}", e);
        }
    }
}

#[async_trait]
impl Reconciler for OrphanPodReaper {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    async fn reconcile(&self) {
        let selector = LabelSelector::new()
            .equals(ENGINE_POD_LABEL, current(&self.settings).engine_label.as_str())
            .exists(RUN_POD_LABEL);

        let pods = match self.backends.orchestrator.list_pods(&selector).await {
            Ok(pods) => pods,
            Err(e) => {
                error!("Scan for orphaned pods failed: {}", e);
                return;
            }
        };
        for pod in &pods {
            self.reap(pod).await;
        }
    }
}
