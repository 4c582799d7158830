//! File-backed backends for local deployments.
//!
//! A local controller keeps its run registry as one JSON document per run
//! and its result archive as one or more directories of JSON records. Local
//! runs never have pods, so the local orchestrator always reports none.

use super::{
    ArchiveDirectory, ArchiveStore, BackendError, BackendResult, ConfigSnapshot, ConfigSource,
    Orchestrator, RunRegistry,
};
use crate::clock::{Clock, SystemClock};
use crate::selector::LabelSelector;
use crate::types::{ArchiveRecord, Pod, Run, RunStatus};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

fn validate_key(kind: &'static str, key: &str) -> BackendResult<()> {
    let bad = key.is_empty()
        || key.starts_with('.')
        || key.contains(['/', '\\'])
        || key.chars().any(char::is_control);
    if bad {
        return Err(BackendError::Message(format!("invalid {kind} name '{key}'")));
    }
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> BackendResult<Option<T>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write via a sibling temp file and rename so readers never see a torn record.
async fn write_json<T: Serialize>(path: &Path, value: &T) -> BackendResult<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, bytes).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

// ── Run registry ─────────────────────────────────────────────────────────

/// Registry storing each run as `<dir>/<run name>.json`.
pub struct FileRunRegistry {
    dir: PathBuf,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
}

impl FileRunRegistry {
    pub async fn open(dir: impl Into<PathBuf>) -> BackendResult<Self> {
        Self::open_with_clock(dir, Arc::new(SystemClock)).await
    }

    pub async fn open_with_clock(
        dir: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> BackendResult<Self> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            clock,
            write_lock: Mutex::new(()),
        })
    }

    fn path_for(&self, name: &str) -> BackendResult<PathBuf> {
        validate_key("run", name)?;
        Ok(self.dir.join(format!("{name}.json")))
    }

    /// Store a run record, replacing any existing one.
    pub async fn put(&self, run: &Run) -> BackendResult<()> {
        let path = self.path_for(&run.name)?;
        let _guard = self.write_lock.lock().await;
        write_json(&path, run).await
    }

    /// Read-modify-write one record under the registry's write lock.
    async fn update<F>(&self, name: &str, apply: F) -> BackendResult<()>
    where
        F: FnOnce(&mut Run) + Send,
    {
        let path = self.path_for(name)?;
        let _guard = self.write_lock.lock().await;
        let mut run: Run = read_json(&path).await?.ok_or_else(|| BackendError::NotFound {
            kind: "run",
            name: name.to_string(),
        })?;
        let before = run.clone();
        apply(&mut run);
        if run != before {
            write_json(&path, &run).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl RunRegistry for FileRunRegistry {
    async fn list_all_runs(&self) -> BackendResult<Vec<Run>> {
        let mut runs = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_json::<Run>(&path).await {
                Ok(Some(run)) => runs.push(run),
                Ok(None) => {}
                Err(e) => error!("Skipping unreadable run record {:?}: {}", path, e),
            }
        }
        runs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(runs)
    }

    async fn get_run(&self, name: &str) -> BackendResult<Option<Run>> {
        read_json(&self.path_for(name)?).await
    }

    async fn set_status(&self, name: &str, status: RunStatus) -> BackendResult<()> {
        let now = self.clock.now();
        self.update(name, |run| {
            if run.status != status {
                run.status = status;
                if status.is_finished() && run.finished.is_none() {
                    run.finished = Some(now);
                }
            }
            if status.is_finished() {
                run.waiting = false;
            }
        })
        .await
    }

    async fn mark_interrupted(&self, name: &str, reason: &str) -> BackendResult<()> {
        let now = self.clock.now();
        self.update(name, |run| {
            if run.interrupt_reason.is_none() {
                run.interrupt_reason = Some(reason.to_string());
                run.interrupted_at = Some(now);
            }
        })
        .await
    }

    async fn mark_waiting(&self, name: &str) -> BackendResult<()> {
        self.update(name, |run| run.waiting = true).await
    }

    async fn delete(&self, name: &str) -> BackendResult<bool> {
        let path = self.path_for(name)?;
        let _guard = self.write_lock.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

// ── Archive ──────────────────────────────────────────────────────────────

/// One archive directory holding `<run id>.json` records.
pub struct FileArchiveDirectory {
    dir: PathBuf,
}

impl FileArchiveDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, run_id: &str) -> BackendResult<PathBuf> {
        validate_key("archive record", run_id)?;
        Ok(self.dir.join(format!("{run_id}.json")))
    }
}

#[async_trait]
impl ArchiveDirectory for FileArchiveDirectory {
    async fn find_record_by_id(&self, run_id: &str) -> BackendResult<Option<ArchiveRecord>> {
        read_json(&self.path_for(run_id)?).await
    }
}

/// Archive spread over several directories, searched in order.
pub struct FileArchiveStore {
    directories: Vec<Arc<FileArchiveDirectory>>,
}

impl FileArchiveStore {
    pub async fn open(dirs: Vec<PathBuf>) -> BackendResult<Self> {
        for dir in &dirs {
            tokio::fs::create_dir_all(dir).await?;
        }
        Ok(Self {
            directories: dirs
                .into_iter()
                .map(|d| Arc::new(FileArchiveDirectory::new(d)))
                .collect(),
        })
    }
}

#[async_trait]
impl ArchiveStore for FileArchiveStore {
    fn directories(&self) -> Vec<Arc<dyn ArchiveDirectory>> {
        self.directories
            .iter()
            .map(|d| d.clone() as Arc<dyn ArchiveDirectory>)
            .collect()
    }

    async fn update_record(&self, run_id: &str, record: &ArchiveRecord) -> BackendResult<()> {
        for directory in &self.directories {
            let path = directory.path_for(run_id)?;
            if tokio::fs::try_exists(&path).await? {
                return write_json(&path, record).await;
            }
        }
        Err(BackendError::NotFound {
            kind: "archive record",
            name: run_id.to_string(),
        })
    }
}

// ── Orchestrator ─────────────────────────────────────────────────────────

/// Orchestrator for local deployments, where runs have no pods.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalOrchestrator;

#[async_trait]
impl Orchestrator for LocalOrchestrator {
    async fn list_pods(&self, selector: &LabelSelector) -> BackendResult<Vec<Pod>> {
        debug!("Local orchestrator has no pods matching '{}'", selector);
        Ok(Vec::new())
    }

    async fn delete_pod(&self, pod: &Pod) -> BackendResult<()> {
        debug!("Local orchestrator ignoring delete of pod {}", pod);
        Ok(())
    }
}

// ── Config source ────────────────────────────────────────────────────────

/// Hot settings read from a TOML file.
///
/// String values live in a `[data]` table. The version token is
/// `[metadata] resource_version` when present, otherwise a hash of the file.
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn parse_config_document(text: &str) -> BackendResult<ConfigSnapshot> {
    let table: toml::Table = toml::from_str(text)
        .map_err(|e| BackendError::Message(format!("invalid settings document: {e}")))?;

    let version = table
        .get("metadata")
        .and_then(|m| m.get("resource_version"))
        .map(|v| match v {
            toml::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| blake3::hash(text.as_bytes()).to_hex().to_string());

    let data = match table.get("data") {
        Some(toml::Value::Table(data)) => data
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect(),
        Some(_) => {
            return Err(BackendError::Message(
                "settings document 'data' must be a table".to_string(),
            ));
        }
        None => BTreeMap::new(),
    };

    Ok(ConfigSnapshot {
        version: Some(version),
        data,
    })
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn read_config(&self) -> BackendResult<ConfigSnapshot> {
        let text = tokio::fs::read_to_string(&self.path).await?;
        parse_config_document(&text)
    }
}
