//! Per-run timeout watch.
//!
//! Bound to a single run, the watch polls the clock and marks the run hung
//! once its deadline has passed. It stops early if the run finishes or
//! disappears, or when it is cancelled.

use chrono::{DateTime, Utc};
use rlc_common::{Clock, RunRegistry, interrupt_reason};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchOutcome {
    Interrupted,
    RunFinished,
    RunGone,
    Cancelled,
}

pub struct RunTimeoutWatch {
    registry: Arc<dyn RunRegistry>,
    clock: Arc<dyn Clock>,
    run_name: String,
    deadline: DateTime<Utc>,
    poll_interval: Duration,
}

impl RunTimeoutWatch {
    /// Watch `run_name` until `timeout` from now has passed.
    pub fn new(
        registry: Arc<dyn RunRegistry>,
        clock: Arc<dyn Clock>,
        run_name: impl Into<String>,
        timeout: chrono::Duration,
    ) -> Self {
        let run_name = run_name.into();
        let deadline = clock
            .now()
            .checked_add_signed(timeout)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        info!(run = %run_name, "Run will be interrupted if it is still active after {}", deadline.to_rfc3339());
        Self {
            registry,
            clock,
            run_name,
            deadline,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Poll until the run times out, ends, or `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> WatchOutcome {
        let outcome = loop {
            if let Some(outcome) = self.check().await {
                break outcome;
            }
            tokio::select! {
                _ = cancel.cancelled() => break WatchOutcome::Cancelled,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        };
        info!(run = %self.run_name, ?outcome, "Run timeout watch stopped");
        outcome
    }

    async fn check(&self) -> Option<WatchOutcome> {
        match self.registry.get_run(&self.run_name).await {
            Ok(None) => return Some(WatchOutcome::RunGone),
            Ok(Some(run)) if run.status.is_finished() => return Some(WatchOutcome::RunFinished),
            Ok(Some(_)) => {}
            Err(e) => warn!(run = %self.run_name, "Failed to read run state: {}", e),
        }

        if self.clock.now() <= self.deadline {
            return None;
        }
        warn!(run = %self.run_name, "Run has exceeded its timeout, marking it as hung");
        match self
            .registry
            .mark_interrupted(&self.run_name, interrupt_reason::HUNG)
            .await
        {
            Ok(()) => Some(WatchOutcome::Interrupted),
            Err(e) => {
                warn!(run = %self.run_name, "Failed to mark run as hung, will retry: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rlc_common::{ManualClock, MemoryRunRegistry, Run, RunStatus, test_guard};

    fn watch(
        registry: &Arc<MemoryRunRegistry>,
        clock: &Arc<ManualClock>,
        timeout_secs: i64,
    ) -> RunTimeoutWatch {
        RunTimeoutWatch::new(
            registry.clone(),
            clock.clone(),
            "W1",
            ChronoDuration::seconds(timeout_secs),
        )
        .with_poll_interval(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_marks_run_hung_after_deadline() {
        let _guard = test_guard!();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(MemoryRunRegistry::with_clock(clock.clone()));
        registry.insert(Run::new("W1", RunStatus::Running));
        let watch = watch(&registry, &clock, 60);

        clock.advance(ChronoDuration::seconds(61));
        let outcome = watch.run(CancellationToken::new()).await;

        assert_eq!(outcome, WatchOutcome::Interrupted);
        assert_eq!(
            registry.snapshot("W1").unwrap().interrupt_reason.as_deref(),
            Some(interrupt_reason::HUNG)
        );
    }

    #[tokio::test]
    async fn test_cancel_stops_watch_before_deadline() {
        let _guard = test_guard!();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(MemoryRunRegistry::with_clock(clock.clone()));
        registry.insert(Run::new("W1", RunStatus::Running));
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch(&registry, &clock, 3600).run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();

        assert_eq!(handle.await.unwrap(), WatchOutcome::Cancelled);
        assert!(registry.snapshot("W1").unwrap().interrupt_reason.is_none());
    }

    #[tokio::test]
    async fn test_stops_when_run_finishes() {
        let _guard = test_guard!();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(MemoryRunRegistry::with_clock(clock.clone()));
        registry.insert(Run::new("W1", RunStatus::Running));
        let handle = tokio::spawn(watch(&registry, &clock, 3600).run(CancellationToken::new()));

        registry.insert(Run::new("W1", RunStatus::Finished));

        assert_eq!(handle.await.unwrap(), WatchOutcome::RunFinished);
    }

    #[test]
    fn test_huge_timeout_saturates_deadline() {
        let _guard = test_guard!();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(MemoryRunRegistry::with_clock(clock.clone()));

        let watch = RunTimeoutWatch::new(registry, clock, "W1", ChronoDuration::MAX);

        assert_eq!(watch.deadline(), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_missing_run_ends_watch() {
        let _guard = test_guard!();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = Arc::new(MemoryRunRegistry::with_clock(clock.clone()));

        let outcome = watch(&registry, &clock, 60).run(CancellationToken::new()).await;

        assert_eq!(outcome, WatchOutcome::RunGone);
    }
}
