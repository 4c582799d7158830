//! Hot-reloadable controller settings.
//!
//! Settings are an immutable snapshot. A reload builds a new snapshot from
//! the previous one plus the freshly read key/value data, reporting each
//! field that changed. Invalid numeric values are reported and the previous
//! value is kept.

pub mod capabilities;

pub use capabilities::Capabilities;

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const DEFAULT_RUN_POLL_SECS: u64 = 20;
pub const DEFAULT_INTERRUPT_GRACE_PERIOD_SECS: u64 = 0;
pub const DEFAULT_LOCAL_QUEUED_TIMEOUT_SECS: u64 = 15 * 60;
pub const DEFAULT_FINISHED_TIMEOUT_SECS: u64 = 5 * 60;
pub const DEFAULT_ENGINE_LABEL: &str = "rlc-engine";
pub const DEFAULT_MAX_ENGINES: u64 = 1;

/// Largest accepted numeric setting: ten years in seconds.
pub const MAX_NUMERIC_SETTING: u64 = 10 * 365 * 24 * 60 * 60;

/// How interrupted runs are discovered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InterruptDetection {
    /// Scan the registry and act once the grace period has elapsed.
    #[default]
    GracePeriod,
    /// Scan live pods and act immediately.
    LivePods,
}

impl InterruptDetection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GracePeriod => "grace-period",
            Self::LivePods => "live-pods",
        }
    }
}

impl fmt::Display for InterruptDetection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterruptDetection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "grace-period" => Ok(Self::GracePeriod),
            "live-pods" => Ok(Self::LivePods),
            other => Err(format!("unknown interrupt detection strategy '{other}'")),
        }
    }
}

/// One field that differs between two settings snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingChange {
    pub key: &'static str,
    pub old: String,
    pub new: String,
}

impl fmt::Display for SettingChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Setting {} from '{}' to '{}'", self.key, self.old, self.new)
    }
}

/// A complete, immutable settings snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub run_poll_secs: u64,
    pub interrupt_grace_period_secs: u64,
    pub local_queued_timeout_secs: u64,
    pub finished_timeout_secs: u64,
    pub engine_label: String,
    pub capabilities: Capabilities,
    pub scheduled_requestors: Vec<String>,
    pub max_engines: u64,
    pub interrupt_detection: InterruptDetection,
    pub monitor_includes: Vec<String>,
    pub monitor_excludes: Vec<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            run_poll_secs: DEFAULT_RUN_POLL_SECS,
            interrupt_grace_period_secs: DEFAULT_INTERRUPT_GRACE_PERIOD_SECS,
            local_queued_timeout_secs: DEFAULT_LOCAL_QUEUED_TIMEOUT_SECS,
            finished_timeout_secs: DEFAULT_FINISHED_TIMEOUT_SECS,
            engine_label: DEFAULT_ENGINE_LABEL.to_string(),
            capabilities: Capabilities::default(),
            scheduled_requestors: Vec::new(),
            max_engines: DEFAULT_MAX_ENGINES,
            interrupt_detection: InterruptDetection::default(),
            monitor_includes: vec!["*".to_string()],
            monitor_excludes: Vec::new(),
        }
    }
}

impl Settings {
    pub fn run_poll(&self) -> Duration {
        Duration::from_secs(self.run_poll_secs.clamp(1, MAX_NUMERIC_SETTING))
    }

    pub fn interrupt_grace_period(&self) -> chrono::Duration {
        seconds(self.interrupt_grace_period_secs)
    }

    pub fn local_queued_timeout(&self) -> chrono::Duration {
        seconds(self.local_queued_timeout_secs)
    }

    pub fn finished_timeout(&self) -> chrono::Duration {
        seconds(self.finished_timeout_secs)
    }

    /// Build the snapshot that results from applying `data` on top of `self`.
    ///
    /// Missing or blank keys fall back to their defaults. Returns the new
    /// snapshot together with every field that changed.
    pub fn apply(&self, data: &BTreeMap<String, String>) -> (Settings, Vec<SettingChange>) {
        let defaults = Settings::default();
        let mut fields = FieldReader {
            data,
            changes: Vec::new(),
        };

        let next = Settings {
            run_poll_secs: fields.number("run_poll", defaults.run_poll_secs, self.run_poll_secs),
            interrupt_grace_period_secs: fields.number(
                "interrupt_grace_period",
                defaults.interrupt_grace_period_secs,
                self.interrupt_grace_period_secs,
            ),
            local_queued_timeout_secs: fields.number(
                "local_queued_timeout",
                defaults.local_queued_timeout_secs,
                self.local_queued_timeout_secs,
            ),
            finished_timeout_secs: fields.number(
                "finished_timeout",
                defaults.finished_timeout_secs,
                self.finished_timeout_secs,
            ),
            engine_label: fields.string("engine_label", &defaults.engine_label, &self.engine_label),
            capabilities: fields.capabilities("engine_capabilities", &self.capabilities),
            scheduled_requestors: fields.list(
                "scheduled_requestors",
                &defaults.scheduled_requestors,
                &self.scheduled_requestors,
            ),
            max_engines: fields.number("max_engines", defaults.max_engines, self.max_engines),
            interrupt_detection: fields.parsed(
                "interrupt_detection",
                defaults.interrupt_detection,
                self.interrupt_detection,
            ),
            monitor_includes: fields.list(
                "monitor_includes",
                &defaults.monitor_includes,
                &self.monitor_includes,
            ),
            monitor_excludes: fields.list(
                "monitor_excludes",
                &defaults.monitor_excludes,
                &self.monitor_excludes,
            ),
        };

        (next, fields.changes)
    }
}

fn seconds(secs: u64) -> chrono::Duration {
    // The bound fits in i64 seconds with room to spare.
    let secs = i64::try_from(secs.min(MAX_NUMERIC_SETTING)).unwrap_or(i64::MAX);
    chrono::Duration::try_seconds(secs).unwrap_or(chrono::Duration::MAX)
}

struct FieldReader<'a> {
    data: &'a BTreeMap<String, String>,
    changes: Vec<SettingChange>,
}

impl FieldReader<'_> {
    fn raw(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn record<T: fmt::Display + PartialEq>(&mut self, key: &'static str, old: &T, new: &T) {
        if old != new {
            self.changes.push(SettingChange {
                key,
                old: old.to_string(),
                new: new.to_string(),
            });
        }
    }

    fn parsed<T>(&mut self, key: &'static str, default: T, old: T) -> T
    where
        T: FromStr + fmt::Display + PartialEq + Copy,
        T::Err: fmt::Display,
    {
        let new = match self.raw(key) {
            None => default,
            Some(value) => match value.parse::<T>() {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!(
                        "Invalid value '{}' for {} in settings ({}), keeping '{}'",
                        value, key, e, old
                    );
                    old
                }
            },
        };
        self.record(key, &old, &new);
        new
    }

    fn number(&mut self, key: &'static str, default: u64, old: u64) -> u64 {
        let oversized = self
            .raw(key)
            .filter(|value| value.parse::<u64>().is_ok_and(|n| n > MAX_NUMERIC_SETTING));
        if let Some(value) = oversized {
            warn!(
                "Value '{}' for {} in settings exceeds {}, keeping '{}'",
                value, key, MAX_NUMERIC_SETTING, old
            );
            return old;
        }
        self.parsed(key, default, old)
    }

    fn string(&mut self, key: &'static str, default: &str, old: &str) -> String {
        let new = self.raw(key).unwrap_or(default).to_string();
        self.record(key, &old.to_string(), &new);
        new
    }

    fn list(&mut self, key: &'static str, default: &[String], old: &[String]) -> Vec<String> {
        let new: Vec<String> = match self.raw(key) {
            None => default.to_vec(),
            Some(value) => value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(str::to_string)
                .collect(),
        };
        self.record(key, &old.join(","), &new.join(","));
        new
    }

    fn capabilities(&mut self, key: &'static str, old: &Capabilities) -> Capabilities {
        let new = self.raw(key).map(Capabilities::parse).unwrap_or_default();
        self.record(key, old, &new);
        new
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_guard;

    fn data(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults_match_documented_values() {
        let _guard = test_guard!();
        let settings = Settings::default();
        assert_eq!(settings.local_queued_timeout_secs, 900);
        assert_eq!(settings.finished_timeout_secs, 300);
        assert_eq!(settings.interrupt_detection, InterruptDetection::GracePeriod);
        assert_eq!(settings.monitor_includes, vec!["*".to_string()]);
    }

    #[test]
    fn test_apply_with_no_data_changes_nothing() {
        let _guard = test_guard!();
        let (next, changes) = Settings::default().apply(&BTreeMap::new());
        assert_eq!(next, Settings::default());
        assert!(changes.is_empty());
    }

    #[test]
    fn test_apply_reports_each_changed_field() {
        let _guard = test_guard!();
        let (next, changes) = Settings::default().apply(&data(&[
            ("run_poll", "5"),
            ("engine_label", "  k8s-standard-engine "),
            ("engine_capabilities", "+docker,java"),
            ("interrupt_detection", "live_pods"),
        ]));

        assert_eq!(next.run_poll_secs, 5);
        assert_eq!(next.engine_label, "k8s-standard-engine");
        assert_eq!(next.interrupt_detection, InterruptDetection::LivePods);
        assert_eq!(next.capabilities.report().as_deref(), Some("+docker,java"));

        let keys: Vec<_> = changes.iter().map(|c| c.key).collect();
        assert_eq!(
            keys,
            vec!["run_poll", "engine_label", "engine_capabilities", "interrupt_detection"]
        );
        assert_eq!(changes[0].to_string(), "Setting run_poll from '20' to '5'");
    }

    #[test]
    fn test_invalid_number_keeps_previous_value() {
        let _guard = test_guard!();
        let (first, _) = Settings::default().apply(&data(&[("finished_timeout", "600")]));
        let (second, changes) = first.apply(&data(&[("finished_timeout", "ten minutes")]));
        assert_eq!(second.finished_timeout_secs, 600);
        assert!(changes.is_empty());
    }

    #[test]
    fn test_oversized_number_keeps_previous_value() {
        let _guard = test_guard!();
        let (second, changes) = Settings::default().apply(&data(&[
            ("finished_timeout", "9000000000000000"),
            ("run_poll", "18446744073709551615"),
        ]));
        assert_eq!(second.finished_timeout_secs, DEFAULT_FINISHED_TIMEOUT_SECS);
        assert_eq!(second.run_poll_secs, DEFAULT_RUN_POLL_SECS);
        assert!(changes.is_empty());

        let (bounded, _) =
            Settings::default().apply(&data(&[("finished_timeout", &MAX_NUMERIC_SETTING.to_string())]));
        assert_eq!(bounded.finished_timeout_secs, MAX_NUMERIC_SETTING);
    }

    #[test]
    fn test_durations_saturate_for_out_of_range_fields() {
        let _guard = test_guard!();
        let settings = Settings {
            run_poll_secs: u64::MAX,
            finished_timeout_secs: u64::MAX,
            ..Settings::default()
        };
        assert_eq!(settings.run_poll(), Duration::from_secs(MAX_NUMERIC_SETTING));
        assert_eq!(
            settings.finished_timeout(),
            chrono::Duration::seconds(MAX_NUMERIC_SETTING as i64)
        );
    }

    #[test]
    fn test_removed_key_reverts_to_default() {
        let _guard = test_guard!();
        let (first, _) = Settings::default().apply(&data(&[("local_queued_timeout", "60")]));
        let (second, changes) = first.apply(&BTreeMap::new());
        assert_eq!(second.local_queued_timeout_secs, DEFAULT_LOCAL_QUEUED_TIMEOUT_SECS);
        assert_eq!(changes.len(), 1);
    }

    #[test]
    fn test_lists_ignore_blank_entries() {
        let _guard = test_guard!();
        let (next, _) = Settings::default().apply(&data(&[
            ("scheduled_requestors", " alice, ,bob ,"),
            ("monitor_excludes", "orphan-*"),
        ]));
        assert_eq!(next.scheduled_requestors, vec!["alice", "bob"]);
        assert_eq!(next.monitor_excludes, vec!["orphan-*"]);
    }

    #[test]
    fn test_run_poll_never_zero() {
        let _guard = test_guard!();
        let (next, _) = Settings::default().apply(&data(&[("run_poll", "0")]));
        assert_eq!(next.run_poll(), Duration::from_secs(1));
    }
}
