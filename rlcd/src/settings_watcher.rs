//! Hot settings reload.
//!
//! The watcher re-reads the configuration source on a fixed period. A read
//! whose version token matches the last applied one is ignored. Otherwise
//! the data is applied on top of the current snapshot, each changed field is
//! logged, and the new snapshot is published to every subscriber. The
//! scheduler subscribes too, so a new `run_poll` takes effect without a
//! restart.

use crate::reconciler::{Period, Reconciler, SettingsHandle};
use async_trait::async_trait;
use rlc_common::{BackendResult, ConfigSource, SettingChange, Settings};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const SETTINGS_POLL_INTERVAL: Duration = Duration::from_secs(20);

/// Settings read once when the daemon wires up its reconcilers.
const STARTUP_ONLY_KEYS: [&str; 3] = ["interrupt_detection", "monitor_includes", "monitor_excludes"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// Same version token as last time; nothing was read into the settings.
    Unchanged,
    /// A new version was applied. Empty when the data matched anyway.
    Applied(Vec<SettingChange>),
}

pub struct SettingsWatcher {
    source: Arc<dyn ConfigSource>,
    last_version: Mutex<Option<String>>,
    tx: watch::Sender<Arc<Settings>>,
}

impl SettingsWatcher {
    pub const NAME: &'static str = "settings-watcher";

    pub fn new(source: Arc<dyn ConfigSource>, initial: Settings) -> Self {
        let (tx, _) = watch::channel(Arc::new(initial));
        Self {
            source,
            last_version: Mutex::new(None),
            tx,
        }
    }

    pub fn subscribe(&self) -> SettingsHandle {
        self.tx.subscribe()
    }

    pub fn current(&self) -> Arc<Settings> {
        self.tx.borrow().clone()
    }

    pub async fn reload(&self) -> BackendResult<ReloadOutcome> {
        let snapshot = self.source.read_config().await?;

        let mut last_version = self.last_version.lock().unwrap_or_else(|e| e.into_inner());
        if snapshot.version.is_some() && *last_version == snapshot.version {
            return Ok(ReloadOutcome::Unchanged);
        }
        debug!(version = ?snapshot.version, "Applying new settings version");

        let first_load = last_version.is_none();
        let (next, changes) = self.current().apply(&snapshot.data);
        for change in &changes {
            info!("{}", change);
            if !first_load && STARTUP_ONLY_KEYS.contains(&change.key) {
                warn!("Change to {} takes effect after a restart", change.key);
            }
        }
        if !changes.is_empty() {
            self.tx.send_replace(Arc::new(next));
        }
        *last_version = snapshot.version;
        Ok(ReloadOutcome::Applied(changes))
    }
}

#[async_trait]
impl Reconciler for SettingsWatcher {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn period(&self) -> Period {
        Period::Fixed(SETTINGS_POLL_INTERVAL)
    }

    async fn reconcile(&self) {
        if let Err(e) = self.reload().await {
            warn!("Failed to reload settings, keeping current values: {}", e);
        }
    }
}
