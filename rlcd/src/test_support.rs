//! Shared fixtures for reconciler tests.

use crate::reconciler::{Backends, SettingsHandle};
use chrono::Utc;
use rlc_common::{
    Clock, ManualClock, MemoryArchiveStore, MemoryOrchestrator, MemoryRunRegistry, Settings,
};
use std::sync::Arc;
use tokio::sync::watch;

pub struct Fixture {
    pub registry: Arc<MemoryRunRegistry>,
    pub orchestrator: Arc<MemoryOrchestrator>,
    pub archive: Arc<MemoryArchiveStore>,
    pub clock: Arc<ManualClock>,
    pub backends: Backends,
    pub settings: SettingsHandle,
    pub settings_tx: watch::Sender<Arc<Settings>>,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_settings(Settings::default())
    }

    pub fn with_settings(settings: Settings) -> Self {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(MemoryRunRegistry::with_clock(clock.clone()));
        let orchestrator = Arc::new(MemoryOrchestrator::new());
        let archive = Arc::new(MemoryArchiveStore::new(2));
        let (settings_tx, settings) = watch::channel(Arc::new(settings));
        let backends = Backends {
            registry: registry.clone(),
            orchestrator: orchestrator.clone(),
            archive: archive.clone(),
            clock: clock.clone(),
        };
        Self {
            registry,
            orchestrator,
            archive,
            clock,
            backends,
            settings,
            settings_tx,
        }
    }

    pub fn now(&self) -> chrono::DateTime<Utc> {
        self.clock.now()
    }

    pub fn update_settings(&self, update: impl FnOnce(&mut Settings)) {
        self.settings_tx.send_modify(|current| update(Arc::make_mut(current)));
    }
}
