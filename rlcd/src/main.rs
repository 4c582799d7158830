//! Run Lifecycle Controller - reconciler daemon
//!
//! The daemon keeps run records consistent with reality. It interrupts runs
//! that time out, stops the pods of interrupted runs and finishes them,
//! reaps pods whose run is gone, applies deferred archive updates, and
//! deletes finished runs once their retention window has passed.

#![forbid(unsafe_code)]

mod archive_sync;
mod finalizer;
mod health;
mod interrupts;
mod queue;
mod reaper;
mod reconciler;
mod run_timeout;
mod scheduler;
mod settings_watcher;
mod timeouts;

#[cfg(test)]
mod test_support;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rlc_common::{
    Clock, ConfigSource, FileArchiveStore, FileConfigSource, FileRunRegistry, InterruptDetection,
    LocalOrchestrator, MemoryConfigSource, PatternError, ReconcilerFilter, Settings, SystemClock,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use finalizer::RunFinalizer;
use health::RunHealth;
use interrupts::{GracePeriodInterruptDetector, InterruptEventProcessor, LivePodsInterruptDetector};
use queue::EventQueue;
use reaper::OrphanPodReaper;
use reconciler::{Backends, Reconciler, SettingsHandle};
use run_timeout::RunTimeoutWatch;
use scheduler::Scheduler;
use settings_watcher::{ReloadOutcome, SettingsWatcher};
use timeouts::{AllocatedRunTimeout, FinishedRunRetention, LocalQueuedRunTimeout};

#[derive(Parser)]
#[command(name = "rlcd")]
#[command(author, version, about = "RLC daemon - run lifecycle reconciliation")]
struct Cli {
    /// Directory holding the run registry and result archive
    #[arg(long, env = "RLC_STATE_DIR", default_value = ".rlc")]
    state_dir: PathBuf,

    /// Hot-reloadable settings file (TOML)
    #[arg(short, long, env = "RLC_CONFIG")]
    config: Option<PathBuf>,

    /// Size of the reconciler worker pool
    #[arg(long, env = "RLC_WORKER_THREADS", default_value_t = 5)]
    worker_threads: usize,

    /// How long shutdown waits for in-flight passes
    #[arg(long, env = "RLC_SHUTDOWN_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    shutdown_timeout: Duration,

    /// Run every reconciler once and exit
    #[arg(long)]
    once: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Finish a run and apply its archive actions
    Finalize {
        /// Run name
        run: String,

        /// The run could not get its resources; park it for retry instead
        #[arg(long)]
        resources_unavailable: bool,
    },

    /// Mark a run hung if it is still active after a timeout
    Watch {
        /// Run name
        run: String,

        /// Time the run is allowed before it is interrupted
        #[arg(long, value_parser = humantime::parse_duration)]
        timeout: Duration,

        /// How often the run is checked
        #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
        poll_interval: Duration,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Invalid process-level settings.
#[derive(Debug, Error)]
enum SettingsError {
    #[error("--worker-threads must be at least 1")]
    NoWorkerThreads,
    #[error(transparent)]
    Pattern(#[from] PatternError),
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    if cli.worker_threads == 0 {
        return Err(SettingsError::NoWorkerThreads.into());
    }
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(cli.worker_threads)
        .thread_name("rlc-worker")
        .enable_all()
        .build()
        .context("Failed to start worker pool")?;

    runtime.block_on(async move {
        match cli.command {
            Some(Command::Finalize {
                ref run,
                resources_unavailable,
            }) => finalize(&cli.state_dir, run, !resources_unavailable).await,
            Some(Command::Watch {
                ref run,
                timeout,
                poll_interval,
            }) => watch(&cli.state_dir, run, timeout, poll_interval).await,
            None => serve(&cli).await,
        }
    })
}

fn init_logging(verbose: bool, format: LogFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

async fn open_backends(state_dir: &Path) -> Result<Backends> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let registry = FileRunRegistry::open_with_clock(state_dir.join("runs"), clock.clone())
        .await
        .with_context(|| format!("Failed to open run registry under {:?}", state_dir))?;
    let archive = FileArchiveStore::open(vec![state_dir.join("archive")])
        .await
        .with_context(|| format!("Failed to open result archive under {:?}", state_dir))?;

    Ok(Backends {
        registry: Arc::new(registry),
        orchestrator: Arc::new(LocalOrchestrator),
        archive: Arc::new(archive),
        clock,
    })
}

fn config_source(path: Option<&Path>) -> Arc<dyn ConfigSource> {
    match path {
        Some(path) => {
            info!("Reading settings from {:?}", path);
            Arc::new(FileConfigSource::new(path))
        }
        None => {
            info!("No settings file configured, using defaults");
            Arc::new(MemoryConfigSource::default())
        }
    }
}

/// The reconcilers the daemon runs, in one-shot order.
///
/// Only one interrupt detector is built, picked by `interrupt_detection`.
fn build_reconcilers(
    backends: &Backends,
    queue: &Arc<EventQueue>,
    settings: &Settings,
    handle: &SettingsHandle,
) -> Vec<Arc<dyn Reconciler>> {
    let detector: Arc<dyn Reconciler> = match settings.interrupt_detection {
        InterruptDetection::GracePeriod => Arc::new(GracePeriodInterruptDetector::new(
            backends.clone(),
            queue.clone(),
            handle.clone(),
        )),
        InterruptDetection::LivePods => Arc::new(LivePodsInterruptDetector::new(
            backends.clone(),
            queue.clone(),
            handle.clone(),
        )),
    };

    vec![
        Arc::new(AllocatedRunTimeout::new(backends)),
        Arc::new(LocalQueuedRunTimeout::new(backends, handle.clone())),
        detector,
        Arc::new(InterruptEventProcessor::new(backends.clone(), queue.clone())),
        Arc::new(OrphanPodReaper::new(backends.clone(), handle.clone())),
        Arc::new(FinishedRunRetention::new(backends, handle.clone())),
    ]
}

fn select_reconcilers(
    reconcilers: Vec<Arc<dyn Reconciler>>,
    settings: &Settings,
) -> Result<Vec<Arc<dyn Reconciler>>, SettingsError> {
    let filter = ReconcilerFilter::new(
        settings.monitor_includes.as_slice(),
        settings.monitor_excludes.as_slice(),
    )?;
    Ok(reconcilers
        .into_iter()
        .filter(|reconciler| {
            let selected = filter.is_selected(reconciler.name());
            if !selected {
                info!("Reconciler {} is excluded by settings", reconciler.name());
            }
            selected
        })
        .collect())
}

async fn serve(cli: &Cli) -> Result<()> {
    info!("Starting RLC daemon...");
    let backends = open_backends(&cli.state_dir).await?;

    let watcher = Arc::new(SettingsWatcher::new(
        config_source(cli.config.as_deref()),
        Settings::default(),
    ));
    match watcher.reload().await {
        Ok(ReloadOutcome::Applied(changes)) if !changes.is_empty() => {
            info!("Loaded settings, {} values differ from defaults", changes.len())
        }
        Ok(_) => info!("Loaded settings, all values at defaults"),
        Err(e) => warn!("Failed to load settings, using defaults: {}", e),
    }
    let settings = watcher.current();
    info!(
        "Interrupt detection: {}, poll interval: {:?}",
        settings.interrupt_detection,
        settings.run_poll()
    );
    if let Some(capabilities) = settings.capabilities.report() {
        info!("Engine capabilities: {}", capabilities);
    }

    let queue = Arc::new(EventQueue::new());
    let handle = watcher.subscribe();
    let reconcilers =
        select_reconcilers(build_reconcilers(&backends, &queue, &settings, &handle), &settings)?;
    let health = Arc::new(RunHealth::new(backends.clock.clone())?);

    if cli.once {
        scheduler::run_once(&reconcilers, &health).await;
        info!("Completed one pass of {} reconcilers", reconcilers.len());
        return Ok(());
    }

    let mut names: Vec<&'static str> = vec![SettingsWatcher::NAME];
    names.extend(reconcilers.iter().map(|r| r.name()));
    let mut scheduler = Scheduler::new(handle, health.clone());
    scheduler.schedule(watcher.clone());
    for reconciler in reconcilers {
        scheduler.schedule(reconciler);
    }
    info!(
        "Scheduled {} reconcilers on {} worker threads",
        scheduler.len(),
        cli.worker_threads
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, draining reconcilers (timeout {:?})", cli.shutdown_timeout);

    if scheduler.shutdown(cli.shutdown_timeout).await {
        info!("All reconcilers stopped");
    }
    for name in names {
        match health.last_success(name) {
            Some(at) => info!(
                "Reconciler {} completed {} passes, last at {}",
                name,
                health.successful_runs(name),
                at.to_rfc3339()
            ),
            None => info!("Reconciler {} never completed a pass", name),
        }
    }
    match health.render() {
        Ok(metrics) => debug!("Final reconciler metrics:\n{}", metrics),
        Err(e) => warn!("Failed to render reconciler metrics: {}", e),
    }
    Ok(())
}

async fn finalize(state_dir: &Path, run_name: &str, resources_available: bool) -> Result<()> {
    let backends = open_backends(state_dir).await?;
    let run = backends
        .registry
        .get_run(run_name)
        .await?
        .with_context(|| format!("Run {} not found", run_name))?;

    let finalizer = RunFinalizer::new(backends.registry.clone(), backends.archive.clone());
    let outcome = finalizer.finalize_run(&run, resources_available).await?;
    info!("Run {} finalized: {:?}", run_name, outcome);
    Ok(())
}

async fn watch(
    state_dir: &Path,
    run_name: &str,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let backends = open_backends(state_dir).await?;
    let timeout = chrono::Duration::from_std(timeout).context("Timeout is too large")?;
    let watch = RunTimeoutWatch::new(backends.registry, backends.clock, run_name, timeout)
        .with_poll_interval(poll_interval);
    info!("Watching run {} until {}", run_name, watch.deadline().to_rfc3339());

    let cancel = CancellationToken::new();
    let on_signal = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };
    let outcome = watch.run(cancel).await;
    on_signal.abort();
    info!("Watch of run {} ended: {:?}", run_name, outcome);
    Ok(())
}
