//! The shape shared by every periodic reconciler.

use async_trait::async_trait;
use rlc_common::{ArchiveStore, Clock, Orchestrator, RunRegistry, Settings};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Receiver side of the published settings snapshot.
pub type SettingsHandle = watch::Receiver<Arc<Settings>>;

/// How often a reconciler is scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Period {
    /// Follow the hot-reloadable `run_poll` setting.
    Poll,
    /// A fixed delay that ignores settings changes.
    Fixed(Duration),
}

impl Period {
    pub fn resolve(self, settings: &Settings) -> Duration {
        match self {
            Self::Poll => settings.run_poll(),
            Self::Fixed(delay) => delay,
        }
    }
}

/// One independently scheduled reconciliation pass.
///
/// `reconcile` never fails: every error is logged inside the pass and the
/// next pass starts from a fresh scan.
#[async_trait]
pub trait Reconciler: Send + Sync {
    fn name(&self) -> &'static str;

    fn period(&self) -> Period {
        Period::Poll
    }

    async fn reconcile(&self);
}

/// The external collaborators shared by all reconcilers.
#[derive(Clone)]
pub struct Backends {
    pub registry: Arc<dyn RunRegistry>,
    pub orchestrator: Arc<dyn Orchestrator>,
    pub archive: Arc<dyn ArchiveStore>,
    pub clock: Arc<dyn Clock>,
}

/// Read the current settings snapshot without holding the borrow.
pub fn current(settings: &SettingsHandle) -> Arc<Settings> {
    settings.borrow().clone()
}
