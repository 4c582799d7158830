//! Reconciler run-health reporting.
//!
//! Every completed pass is counted per reconciler and its completion time
//! recorded. The metrics live in a private prometheus registry that can be
//! rendered in the text exposition format.

use chrono::{DateTime, Utc};
use prometheus::{Encoder, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use rlc_common::Clock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("metrics registry error: {0}")]
    Prometheus(#[from] prometheus::Error),
    #[error("metrics output is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
}

pub struct RunHealth {
    registry: Registry,
    successful_runs: IntCounterVec,
    last_success_seconds: GaugeVec,
    last_success: Mutex<HashMap<&'static str, DateTime<Utc>>>,
    clock: Arc<dyn Clock>,
}

impl RunHealth {
    pub fn new(clock: Arc<dyn Clock>) -> Result<Self, HealthError> {
        let registry = Registry::new_custom(Some("rlc".to_string()), None)?;
        let successful_runs = IntCounterVec::new(
            Opts::new(
                "reconciler_successful_runs_total",
                "Completed reconciler passes",
            ),
            &["reconciler"],
        )?;
        let last_success_seconds = GaugeVec::new(
            Opts::new(
                "reconciler_last_success_timestamp_seconds",
                "Unix time of the last completed reconciler pass",
            ),
            &["reconciler"],
        )?;
        registry.register(Box::new(successful_runs.clone()))?;
        registry.register(Box::new(last_success_seconds.clone()))?;
        Ok(Self {
            registry,
            successful_runs,
            last_success_seconds,
            last_success: Mutex::new(HashMap::new()),
            clock,
        })
    }

    pub fn record_success(&self, reconciler: &'static str) {
        let now = self.clock.now();
        self.successful_runs.with_label_values(&[reconciler]).inc();
        self.last_success_seconds
            .with_label_values(&[reconciler])
            .set(now.timestamp_millis() as f64 / 1000.0);
        self.last_success
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(reconciler, now);
    }

    pub fn successful_runs(&self, reconciler: &str) -> u64 {
        self.successful_runs.with_label_values(&[reconciler]).get()
    }

    pub fn last_success(&self, reconciler: &str) -> Option<DateTime<Utc>> {
        self.last_success
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(reconciler)
            .copied()
    }

    /// Text exposition of every metric.
    pub fn render(&self) -> Result<String, HealthError> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8(buf)?)
    }
}
