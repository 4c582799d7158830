//! Core run model shared by the controller and its backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Pod label whose value is the name of the run the pod executes.
pub const RUN_POD_LABEL: &str = "rlc-run";

/// Pod label whose value names the engine controller that launched the pod.
pub const ENGINE_POD_LABEL: &str = "rlc-engine-controller";

/// Well-known interrupt reasons written by the controller.
pub mod interrupt_reason {
    /// The run sat in a state for longer than its policy allows.
    pub const HUNG: &str = "hung";
    /// The run was cancelled by a user or requester.
    pub const CANCELLED: &str = "cancelled";
}

/// Lifecycle status of a run.
///
/// Statuses progress monotonically from `Queued` to `Finished`. The only
/// backward moves are made by reconcilers interrupting `Allocated` runs and
/// local `Queued` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Allocated,
    Building,
    Provstart,
    Running,
    Rundone,
    Ending,
    Up,
    Finished,
}

impl RunStatus {
    pub const ALL: [RunStatus; 9] = [
        Self::Queued,
        Self::Allocated,
        Self::Building,
        Self::Provstart,
        Self::Running,
        Self::Rundone,
        Self::Ending,
        Self::Up,
        Self::Finished,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Allocated => "allocated",
            Self::Building => "building",
            Self::Provstart => "provstart",
            Self::Running => "running",
            Self::Rundone => "rundone",
            Self::Ending => "ending",
            Self::Up => "up",
            Self::Finished => "finished",
        }
    }

    pub fn is_finished(self) -> bool {
        self == Self::Finished
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a status string does not name a known lifecycle status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown run status '{0}'")]
pub struct UnknownRunStatus(pub String);

impl FromStr for RunStatus {
    type Err = UnknownRunStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim();
        Self::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| UnknownRunStatus(s.to_string()))
    }
}

/// A deferred update to apply to a run's archived record once the run is
/// finalized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RasAction {
    /// Identifier of the archived record (not the run name).
    pub run_id: String,
    pub desired_status: String,
    pub desired_result: String,
}

impl RasAction {
    pub fn new(
        run_id: impl Into<String>,
        desired_status: impl Into<String>,
        desired_result: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            desired_status: desired_status.into(),
            desired_result: desired_result.into(),
        }
    }
}

/// A test run record as held by the run registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub name: String,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupted_at: Option<DateTime<Utc>>,
    /// Deadline by which an allocated run must have started building.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_timeout: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queued: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
    /// Local runs execute without an orchestrator pod.
    #[serde(default)]
    pub is_local: bool,
    /// Set while the run is parked for retry because resources were unavailable.
    #[serde(default)]
    pub waiting: bool,
    #[serde(default)]
    pub ras_actions: Vec<RasAction>,
}

impl Run {
    pub fn new(name: impl Into<String>, status: RunStatus) -> Self {
        Self {
            name: name.into(),
            status,
            interrupt_reason: None,
            interrupted_at: None,
            allocated_timeout: None,
            queued: None,
            finished: None,
            is_local: false,
            waiting: false,
            ras_actions: Vec::new(),
        }
    }

    pub fn local(mut self) -> Self {
        self.is_local = true;
        self
    }

    pub fn with_interrupt(
        mut self,
        reason: impl Into<String>,
        interrupted_at: Option<DateTime<Utc>>,
    ) -> Self {
        self.interrupt_reason = Some(reason.into());
        self.interrupted_at = interrupted_at;
        self
    }

    pub fn with_allocated_timeout(mut self, deadline: DateTime<Utc>) -> Self {
        self.allocated_timeout = Some(deadline);
        self
    }

    pub fn with_queued(mut self, queued: DateTime<Utc>) -> Self {
        self.queued = Some(queued);
        self
    }

    pub fn with_finished(mut self, finished: DateTime<Utc>) -> Self {
        self.finished = Some(finished);
        self
    }

    pub fn with_ras_action(mut self, action: RasAction) -> Self {
        self.ras_actions.push(action);
        self
    }

    /// A run that carries an interrupt reason but has not yet finished.
    pub fn is_pending_interrupt(&self) -> bool {
        !self.status.is_finished() && self.interrupt_reason.is_some()
    }
}

/// An orchestrator pod. The controller only ever reads and deletes pods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl Pod {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            labels: BTreeMap::new(),
        }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Test pod for `run_name` launched by the engine controller `engine`.
    pub fn for_run(name: impl Into<String>, run_name: &str, engine: &str) -> Self {
        Self::new(name)
            .with_label(RUN_POD_LABEL, run_name)
            .with_label(ENGINE_POD_LABEL, engine)
    }

    pub fn run_name(&self) -> Option<&str> {
        self.labels.get(RUN_POD_LABEL).map(String::as_str)
    }
}

impl fmt::Display for Pod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// The terminal record of a run in the result archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveRecord {
    pub run_id: String,
    pub run_name: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl ArchiveRecord {
    pub fn new(
        run_id: impl Into<String>,
        run_name: impl Into<String>,
        status: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            run_name: run_name.into(),
            status: status.into(),
            result: None,
        }
    }
}
