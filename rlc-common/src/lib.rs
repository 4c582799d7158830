//! Shared types and utilities for the run lifecycle controller.
//!
//! The controller reconciles run records held in a shared registry against
//! the orchestrator's pods, elapsed time and the result archive. This crate
//! holds the pieces every component agrees on: the run model, the narrow
//! backend interfaces, the settings snapshot and the backends used for local
//! deployments and tests.

pub mod backends;
pub mod clock;
pub mod config;
pub mod filter;
pub mod selector;
pub mod testing;
pub mod types;

pub use backends::{
    ArchiveDirectory, ArchiveStore, BackendError, BackendResult, ConfigSnapshot, ConfigSource,
    FileArchiveStore, FileConfigSource, FileRunRegistry, LocalOrchestrator, MemoryArchiveStore,
    MemoryConfigSource, MemoryOrchestrator, MemoryRunRegistry, Orchestrator, RunRegistry,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Capabilities, InterruptDetection, SettingChange, Settings};
pub use filter::{PatternError, ReconcilerFilter};
pub use selector::LabelSelector;
pub use types::{
    ArchiveRecord, ENGINE_POD_LABEL, Pod, RUN_POD_LABEL, RasAction, Run, RunStatus,
    UnknownRunStatus, interrupt_reason,
};
