//! In-memory backends.
//!
//! Used by tests and by the daemon's dry runs. Each backend records the
//! writes it receives and can be told to fail specific operations so that
//! per-item isolation can be exercised.

use super::{
    ArchiveDirectory, ArchiveStore, BackendError, BackendResult, ConfigSnapshot, ConfigSource,
    Orchestrator, RunRegistry,
};
use crate::clock::{Clock, SystemClock};
use crate::selector::LabelSelector;
use crate::types::{ArchiveRecord, Pod, Run, RunStatus};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ── Run registry ─────────────────────────────────────────────────────────

/// Registry holding runs in a map keyed by run name.
#[derive(Debug)]
pub struct MemoryRunRegistry {
    runs: Mutex<BTreeMap<String, Run>>,
    clock: Arc<dyn Clock>,
    unavailable: AtomicBool,
    failing_writes: Mutex<HashSet<String>>,
    interrupt_calls: Mutex<Vec<(String, String)>>,
}

impl MemoryRunRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Interrupt timestamps are taken from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            runs: Mutex::new(BTreeMap::new()),
            clock,
            unavailable: AtomicBool::new(false),
            failing_writes: Mutex::new(HashSet::new()),
            interrupt_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn insert(&self, run: Run) {
        lock(&self.runs).insert(run.name.clone(), run);
    }

    pub fn snapshot(&self, name: &str) -> Option<Run> {
        lock(&self.runs).get(name).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.runs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every call fail as if the registry were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make writes to `name` fail.
    pub fn fail_writes_for(&self, name: &str) {
        lock(&self.failing_writes).insert(name.to_string());
    }

    /// Every `(name, reason)` passed to `mark_interrupted`, in call order.
    pub fn interrupt_calls(&self) -> Vec<(String, String)> {
        lock(&self.interrupt_calls).clone()
    }

    fn check_available(&self) -> BackendResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("run registry".to_string()));
        }
        Ok(())
    }

    fn check_writable(&self, name: &str) -> BackendResult<()> {
        self.check_available()?;
        if lock(&self.failing_writes).contains(name) {
            return Err(BackendError::Message(format!(
                "write rejected for run '{name}'"
            )));
        }
        Ok(())
    }
}

impl Default for MemoryRunRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RunRegistry for MemoryRunRegistry {
    async fn list_all_runs(&self) -> BackendResult<Vec<Run>> {
        self.check_available()?;
        Ok(lock(&self.runs).values().cloned().collect())
    }

    async fn get_run(&self, name: &str) -> BackendResult<Option<Run>> {
        self.check_available()?;
        Ok(lock(&self.runs).get(name).cloned())
    }

    async fn set_status(&self, name: &str, status: RunStatus) -> BackendResult<()> {
        self.check_writable(name)?;
        let now = self.clock.now();
        let mut runs = lock(&self.runs);
        let run = runs.get_mut(name).ok_or_else(|| BackendError::NotFound {
            kind: "run",
            name: name.to_string(),
        })?;
        if run.status != status {
            run.status = status;
            if status.is_finished() && run.finished.is_none() {
                run.finished = Some(now);
            }
        }
        if status.is_finished() {
            run.waiting = false;
        }
        Ok(())
    }

    async fn mark_interrupted(&self, name: &str, reason: &str) -> BackendResult<()> {
        self.check_writable(name)?;
        lock(&self.interrupt_calls).push((name.to_string(), reason.to_string()));
        let now = self.clock.now();
        let mut runs = lock(&self.runs);
        let run = runs.get_mut(name).ok_or_else(|| BackendError::NotFound {
            kind: "run",
            name: name.to_string(),
        })?;
        if run.interrupt_reason.is_none() {
            run.interrupt_reason = Some(reason.to_string());
            run.interrupted_at = Some(now);
        }
        Ok(())
    }

    async fn mark_waiting(&self, name: &str) -> BackendResult<()> {
        self.check_writable(name)?;
        let mut runs = lock(&self.runs);
        let run = runs.get_mut(name).ok_or_else(|| BackendError::NotFound {
            kind: "run",
            name: name.to_string(),
        })?;
        run.waiting = true;
        Ok(())
    }

    async fn delete(&self, name: &str) -> BackendResult<bool> {
        self.check_writable(name)?;
        Ok(lock(&self.runs).remove(name).is_some())
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────

/// Orchestrator holding a fixed set of pods.
#[derive(Debug)]
pub struct MemoryOrchestrator {
    pods: Mutex<Vec<Pod>>,
    ready: AtomicBool,
    unavailable: AtomicBool,
    failing_deletes: Mutex<HashSet<String>>,
    deleted: Mutex<Vec<String>>,
    delete_attempts: AtomicUsize,
}

impl MemoryOrchestrator {
    pub fn new() -> Self {
        Self {
            pods: Mutex::new(Vec::new()),
            ready: AtomicBool::new(true),
            unavailable: AtomicBool::new(false),
            failing_deletes: Mutex::new(HashSet::new()),
            deleted: Mutex::new(Vec::new()),
            delete_attempts: AtomicUsize::new(0),
        }
    }

    pub fn add_pod(&self, pod: Pod) {
        lock(&self.pods).push(pod);
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make deletion of the pod named `pod_name` fail.
    pub fn fail_delete_for(&self, pod_name: &str) {
        lock(&self.failing_deletes).insert(pod_name.to_string());
    }

    /// Names of pods deleted successfully, in call order.
    pub fn deleted_pods(&self) -> Vec<String> {
        lock(&self.deleted).clone()
    }

    pub fn delete_attempts(&self) -> usize {
        self.delete_attempts.load(Ordering::SeqCst)
    }

    pub fn pod_names(&self) -> Vec<String> {
        lock(&self.pods).iter().map(|p| p.name.clone()).collect()
    }
}

impl Default for MemoryOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Orchestrator for MemoryOrchestrator {
    async fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn list_pods(&self, selector: &LabelSelector) -> BackendResult<Vec<Pod>> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable("orchestrator".to_string()));
        }
        Ok(lock(&self.pods)
            .iter()
            .filter(|pod| selector.matches(&pod.labels))
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, pod: &Pod) -> BackendResult<()> {
        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        if lock(&self.failing_deletes).contains(&pod.name) {
            return Err(BackendError::Message(format!(
                "orchestrator refused to delete pod '{}'",
                pod.name
            )));
        }
        let mut pods = lock(&self.pods);
        let before = pods.len();
        pods.retain(|p| p.name != pod.name);
        if pods.len() != before {
            lock(&self.deleted).push(pod.name.clone());
        }
        Ok(())
    }
}

// ── Archive ──────────────────────────────────────────────────────────────

/// One archive partition.
#[derive(Debug, Default)]
pub struct MemoryArchiveDirectory {
    records: Mutex<HashMap<String, ArchiveRecord>>,
}

impl MemoryArchiveDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: ArchiveRecord) {
        lock(&self.records).insert(record.run_id.clone(), record);
    }

    fn replace(&self, run_id: &str, record: &ArchiveRecord) -> bool {
        let mut records = lock(&self.records);
        match records.get_mut(run_id) {
            Some(existing) => {
                *existing = record.clone();
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ArchiveDirectory for MemoryArchiveDirectory {
    async fn find_record_by_id(&self, run_id: &str) -> BackendResult<Option<ArchiveRecord>> {
        Ok(lock(&self.records).get(run_id).cloned())
    }
}

/// Archive spread over one or more in-memory directories.
#[derive(Debug)]
pub struct MemoryArchiveStore {
    directories: Vec<Arc<MemoryArchiveDirectory>>,
    updates: Mutex<Vec<ArchiveRecord>>,
    failing_updates: Mutex<HashSet<String>>,
}

impl MemoryArchiveStore {
    pub fn new(directory_count: usize) -> Self {
        Self {
            directories: (0..directory_count.max(1))
                .map(|_| Arc::new(MemoryArchiveDirectory::new()))
                .collect(),
            updates: Mutex::new(Vec::new()),
            failing_updates: Mutex::new(HashSet::new()),
        }
    }

    pub fn directory(&self, index: usize) -> Option<Arc<MemoryArchiveDirectory>> {
        self.directories.get(index).cloned()
    }

    /// Every record written through `update_record`, in call order.
    pub fn updates(&self) -> Vec<ArchiveRecord> {
        lock(&self.updates).clone()
    }

    pub fn fail_updates_for(&self, run_id: &str) {
        lock(&self.failing_updates).insert(run_id.to_string());
    }
}

impl Default for MemoryArchiveStore {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl ArchiveStore for MemoryArchiveStore {
    fn directories(&self) -> Vec<Arc<dyn ArchiveDirectory>> {
        self.directories
            .iter()
            .map(|d| d.clone() as Arc<dyn ArchiveDirectory>)
            .collect()
    }

    async fn update_record(&self, run_id: &str, record: &ArchiveRecord) -> BackendResult<()> {
        if lock(&self.failing_updates).contains(run_id) {
            return Err(BackendError::Message(format!(
                "archive rejected update for '{run_id}'"
            )));
        }
        let stored = self.directories.iter().any(|d| d.replace(run_id, record));
        if !stored {
            return Err(BackendError::NotFound {
                kind: "archive record",
                name: run_id.to_string(),
            });
        }
        lock(&self.updates).push(record.clone());
        Ok(())
    }
}

// ── Config source ────────────────────────────────────────────────────────

/// Config source whose contents are set directly.
#[derive(Debug, Default)]
pub struct MemoryConfigSource {
    snapshot: Mutex<ConfigSnapshot>,
    reads: AtomicUsize,
}

impl MemoryConfigSource {
    pub fn new(version: &str, data: &[(&str, &str)]) -> Self {
        let source = Self::default();
        source.set(version, data);
        source
    }

    pub fn set(&self, version: &str, data: &[(&str, &str)]) {
        *lock(&self.snapshot) = ConfigSnapshot {
            version: Some(version.to_string()),
            data: data
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn read_config(&self) -> BackendResult<ConfigSnapshot> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.snapshot).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::test_guard;
    use crate::types::interrupt_reason;
    use chrono::{Duration, Utc};

    #[tokio::test]
    async fn test_mark_interrupted_keeps_first_reason_and_timestamp() {
        let _guard = test_guard!();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = MemoryRunRegistry::with_clock(clock.clone());
        registry.insert(Run::new("U1", RunStatus::Allocated));

        registry
            .mark_interrupted("U1", interrupt_reason::HUNG)
            .await
            .unwrap();
        let first = registry.snapshot("U1").unwrap();

        clock.advance(Duration::seconds(120));
        registry
            .mark_interrupted("U1", interrupt_reason::CANCELLED)
            .await
            .unwrap();
        let second = registry.snapshot("U1").unwrap();

        assert_eq!(second.interrupt_reason.as_deref(), Some(interrupt_reason::HUNG));
        assert_eq!(second.interrupted_at, first.interrupted_at);
        assert_eq!(registry.interrupt_calls().len(), 2);
    }

    #[tokio::test]
    async fn test_set_status_finished_stamps_finished_time_once() {
        let _guard = test_guard!();
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let registry = MemoryRunRegistry::with_clock(clock.clone());
        registry.insert(Run::new("U2", RunStatus::Running));

        registry.set_status("U2", RunStatus::Finished).await.unwrap();
        let finished_at = registry.snapshot("U2").unwrap().finished;
        assert!(finished_at.is_some());

        clock.advance(Duration::seconds(30));
        registry.set_status("U2", RunStatus::Finished).await.unwrap();
        assert_eq!(registry.snapshot("U2").unwrap().finished, finished_at);
    }

    #[tokio::test]
    async fn test_unavailable_registry_fails_listing() {
        let _guard = test_guard!();
        let registry = MemoryRunRegistry::new();
        registry.set_unavailable(true);
        assert!(matches!(
            registry.list_all_runs().await,
            Err(BackendError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_deleting_missing_pod_is_not_an_error() {
        let _guard = test_guard!();
        let orchestrator = MemoryOrchestrator::new();
        orchestrator.add_pod(Pod::for_run("pod-a", "A1", "engine"));

        let pod = Pod::for_run("pod-a", "A1", "engine");
        orchestrator.delete_pod(&pod).await.unwrap();
        orchestrator.delete_pod(&pod).await.unwrap();

        assert_eq!(orchestrator.deleted_pods(), vec!["pod-a".to_string()]);
        assert_eq!(orchestrator.delete_attempts(), 2);
    }

    #[tokio::test]
    async fn test_archive_lookup_stops_at_first_directory_hit() {
        let _guard = test_guard!();
        let store = MemoryArchiveStore::new(2);
        store
            .directory(1)
            .unwrap()
            .insert(ArchiveRecord::new("id-9", "U9", "finished"));

        let record = store.find_record_by_id("id-9").await.unwrap();
        assert_eq!(record.map(|r| r.run_name), Some("U9".to_string()));
        assert!(store.find_record_by_id("missing").await.unwrap().is_none());
    }
}
