//! Fixed-delay reconciler scheduling.
//!
//! Each reconciler gets its own task. The task waits a random initial delay
//! bounded by the reconciler's period, then alternates between a pass and a
//! sleep of one period measured from the end of that pass, so two passes of
//! the same reconciler never overlap and a slow pass never runs back to
//! back. Poll-paced reconcilers watch the settings channel while they sleep
//! and re-arm their timer as soon as `run_poll` changes.
//!
//! Shutdown stops new passes from starting and waits a bounded time for
//! passes already in flight.

use crate::health::RunHealth;
use crate::reconciler::{Period, Reconciler, SettingsHandle, current};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Stand-in deadline for delays too long to represent.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Random initial delay in `[0, period)`.
pub fn initial_jitter(period: Duration) -> Duration {
    let bound = u64::try_from(period.as_millis()).unwrap_or(u64::MAX);
    if bound == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(fastrand::u64(0..bound))
}

pub struct Scheduler {
    tasks: JoinSet<()>,
    cancel: CancellationToken,
    settings: SettingsHandle,
    health: Arc<RunHealth>,
    jitter: bool,
}

impl Scheduler {
    pub fn new(settings: SettingsHandle, health: Arc<RunHealth>) -> Self {
        Self {
            tasks: JoinSet::new(),
            cancel: CancellationToken::new(),
            settings,
            health,
            jitter: true,
        }
    }

    /// Start every reconciler's first pass immediately.
    #[cfg(test)]
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn schedule(&mut self, reconciler: Arc<dyn Reconciler>) {
        let period = reconciler.period();
        let first_delay = if self.jitter {
            initial_jitter(period.resolve(&current(&self.settings)))
        } else {
            Duration::ZERO
        };
        info!(
            "Scheduling {} ({:?}, first pass in {:?})",
            reconciler.name(),
            period,
            first_delay
        );
        let task = ReconcilerTask {
            reconciler,
            period,
            settings: self.settings.clone(),
            health: self.health.clone(),
            cancel: self.cancel.clone(),
        };
        self.tasks.spawn(task.run(first_delay));
    }

    /// Stop scheduling passes and wait up to `drain` for in-flight passes.
    ///
    /// Returns false when tasks had to be abandoned.
    pub async fn shutdown(mut self, drain: Duration) -> bool {
        info!("Stopping {} reconcilers", self.tasks.len());
        self.cancel.cancel();

        let tasks = &mut self.tasks;
        let drained = tokio::time::timeout(drain, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!("Reconciler task ended abnormally: {}", e);
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                "{} reconcilers still busy after {:?}, abandoning them",
                self.tasks.len(),
                drain
            );
            self.tasks.abort_all();
        }
        drained
    }
}

/// Run each reconciler once, in order.
pub async fn run_once(reconcilers: &[Arc<dyn Reconciler>], health: &RunHealth) {
    for reconciler in reconcilers {
        debug!("Running {} once", reconciler.name());
        isolated_pass(reconciler.clone(), health).await;
    }
}

/// One pass in its own task, so a panic only costs this pass.
async fn isolated_pass(reconciler: Arc<dyn Reconciler>, health: &RunHealth) {
    let name = reconciler.name();
    match tokio::spawn(async move { reconciler.reconcile().await }).await {
        Ok(()) => health.record_success(name),
        Err(e) => error!("Reconciler {} pass aborted: {}", name, e),
    }
}

fn deadline_after(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

struct ReconcilerTask {
    reconciler: Arc<dyn Reconciler>,
    period: Period,
    settings: SettingsHandle,
    health: Arc<RunHealth>,
    cancel: CancellationToken,
}

impl ReconcilerTask {
    async fn run(mut self, first_delay: Duration) {
        let name = self.reconciler.name();
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(first_delay) => {}
        }

        loop {
            isolated_pass(self.reconciler.clone(), &self.health).await;
            if !self.wait_next(Instant::now()).await {
                break;
            }
        }
        debug!("Reconciler {} stopped", name);
    }

    /// Sleep one period measured from `ended`. Returns false on cancel.
    async fn wait_next(&mut self, ended: Instant) -> bool {
        let mut delay = self.period.resolve(&current(&self.settings));
        let mut follow_settings = matches!(self.period, Period::Poll);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = tokio::time::sleep_until(deadline_after(ended, delay)) => return true,
                changed = self.settings.changed(), if follow_settings => {
                    if changed.is_err() {
                        follow_settings = false;
                        continue;
                    }
                    let next = self.period.resolve(&current(&self.settings));
                    if next != delay {
                        info!(
                            "Reconciler {} now runs every {:?} (was {:?})",
                            self.reconciler.name(),
                            next,
                            delay
                        );
                        delay = next;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Fixture;
    use async_trait::async_trait;
    use rlc_common::test_guard;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        period: Period,
        work: Duration,
        passes: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        starts: Mutex<Vec<Instant>>,
        panic_on_first: bool,
    }

    impl Counter {
        fn new(period: Period) -> Self {
            Self {
                period,
                work: Duration::ZERO,
                passes: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                starts: Mutex::new(Vec::new()),
                panic_on_first: false,
            }
        }

        fn working_for(mut self, work: Duration) -> Self {
            self.work = work;
            self
        }

        fn passes(&self) -> usize {
            self.passes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Reconciler for Counter {
        fn name(&self) -> &'static str {
            "counter"
        }

        fn period(&self) -> Period {
            self.period
        }

        async fn reconcile(&self) {
            self.starts.lock().unwrap().push(Instant::now());
            let pass = self.passes.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.work.is_zero() {
                tokio::time::sleep(self.work).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if self.panic_on_first && pass == 0 {
                panic!("counter failure");
            }
        }
    }

    fn health() -> Arc<RunHealth> {
        Arc::new(RunHealth::new(Arc::new(rlc_common::SystemClock)).unwrap())
    }

    async fn wait_for(counter: &Counter, passes: usize, limit: Duration) {
        let deadline = Instant::now() + limit;
        while counter.passes() < passes && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_initial_jitter_is_bounded_by_period() {
        let _guard = test_guard!();
        assert_eq!(initial_jitter(Duration::ZERO), Duration::ZERO);
        for _ in 0..200 {
            assert!(initial_jitter(Duration::from_secs(20)) < Duration::from_secs(20));
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_passes_repeat_without_overlap() {
        let _guard = test_guard!();
        let f = Fixture::new();
        let health = health();
        let counter = Arc::new(
            Counter::new(Period::Fixed(Duration::from_millis(5))).working_for(Duration::from_millis(10)),
        );
        let mut scheduler = Scheduler::new(f.settings.clone(), health.clone());
        scheduler.schedule(counter.clone());

        wait_for(&counter, 4, Duration::from_secs(5)).await;
        assert!(scheduler.shutdown(Duration::from_secs(5)).await);

        assert!(counter.passes() >= 4);
        assert_eq!(counter.max_in_flight.load(Ordering::SeqCst), 1);
        assert_eq!(health.successful_runs("counter"), counter.passes() as u64);
    }

    #[tokio::test]
    async fn test_next_pass_waits_a_full_period_after_the_previous_ends() {
        let _guard = test_guard!();
        let f = Fixture::new();
        let work = Duration::from_millis(100);
        let period = Duration::from_millis(100);
        let counter = Arc::new(Counter::new(Period::Fixed(period)).working_for(work));
        let mut scheduler = Scheduler::new(f.settings.clone(), health()).without_jitter();
        scheduler.schedule(counter.clone());

        wait_for(&counter, 3, Duration::from_secs(5)).await;
        assert!(scheduler.shutdown(Duration::from_secs(5)).await);

        let starts = counter.starts.lock().unwrap().clone();
        assert!(starts.len() >= 3);
        for pair in starts.windows(2) {
            let gap = pair[1] - pair[0];
            assert!(gap >= work + period, "passes only {:?} apart", gap);
        }
    }

    #[test]
    fn test_deadline_after_saturates() {
        let _guard = test_guard!();
        let now = Instant::now();
        assert_eq!(deadline_after(now, Duration::from_secs(1)), now + Duration::from_secs(1));
        assert!(deadline_after(now, Duration::MAX) > now + Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_poll_change_reschedules_sleeping_reconciler() {
        let _guard = test_guard!();
        let f = Fixture::new();
        f.update_settings(|s| s.run_poll_secs = 3600);
        let counter = Arc::new(Counter::new(Period::Poll));
        let mut scheduler = Scheduler::new(f.settings.clone(), health()).without_jitter();
        scheduler.schedule(counter.clone());

        wait_for(&counter, 1, Duration::from_secs(2)).await;
        assert_eq!(counter.passes(), 1);

        f.update_settings(|s| s.run_poll_secs = 1);
        wait_for(&counter, 2, Duration::from_secs(5)).await;
        assert_eq!(counter.passes(), 2);

        assert!(scheduler.shutdown(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_shutdown_lets_in_flight_pass_finish() {
        let _guard = test_guard!();
        let f = Fixture::new();
        let counter = Arc::new(
            Counter::new(Period::Fixed(Duration::from_secs(3600))).working_for(Duration::from_millis(50)),
        );
        let mut scheduler = Scheduler::new(f.settings.clone(), health()).without_jitter();
        scheduler.schedule(counter.clone());
        while counter.in_flight.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert!(scheduler.shutdown(Duration::from_secs(5)).await);
        assert_eq!(counter.passes(), 1);
        assert_eq!(counter.in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_shutdown_abandons_pass_exceeding_drain_timeout() {
        let _guard = test_guard!();
        let f = Fixture::new();
        let counter = Arc::new(
            Counter::new(Period::Fixed(Duration::from_secs(3600))).working_for(Duration::from_secs(30)),
        );
        let mut scheduler = Scheduler::new(f.settings.clone(), health()).without_jitter();
        scheduler.schedule(counter.clone());
        while counter.in_flight.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        assert!(!scheduler.shutdown(Duration::from_millis(50)).await);
    }

    #[tokio::test]
    async fn test_panicking_pass_does_not_stop_reconciler() {
        let _guard = test_guard!();
        let f = Fixture::new();
        let health = health();
        let mut counter = Counter::new(Period::Fixed(Duration::from_millis(5)));
        counter.panic_on_first = true;
        let counter = Arc::new(counter);
        let mut scheduler = Scheduler::new(f.settings.clone(), health.clone()).without_jitter();
        scheduler.schedule(counter.clone());

        wait_for(&counter, 3, Duration::from_secs(5)).await;
        assert!(scheduler.shutdown(Duration::from_secs(5)).await);

        assert!(counter.passes() >= 3);
        assert_eq!(health.successful_runs("counter"), counter.passes() as u64 - 1);
    }

    #[tokio::test]
    async fn test_run_once_runs_each_reconciler_once() {
        let _guard = test_guard!();
        let health = health();
        let a = Arc::new(Counter::new(Period::Poll));
        let reconcilers: Vec<Arc<dyn Reconciler>> = vec![a.clone(), a.clone()];

        run_once(&reconcilers, &health).await;

        assert_eq!(a.passes(), 2);
        assert_eq!(health.successful_runs("counter"), 2);
    }

    #[tokio::test]
    async fn test_run_once_survives_a_panicking_reconciler() {
        let _guard = test_guard!();
        let health = health();
        let mut failing = Counter::new(Period::Poll);
        failing.panic_on_first = true;
        let failing = Arc::new(failing);
        let healthy = Arc::new(Counter::new(Period::Poll));
        let reconcilers: Vec<Arc<dyn Reconciler>> = vec![failing.clone(), healthy.clone()];

        run_once(&reconcilers, &health).await;

        assert_eq!(failing.passes(), 1);
        assert_eq!(healthy.passes(), 1);
        assert_eq!(health.successful_runs("counter"), 1);
    }
}
