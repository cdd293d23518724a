//! Run/event store: append-only per-run event log plus a
//! run manifest, with query/tail/summarize/prune/find_resumable contracts.
//! A filesystem implementation keeps one directory per run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use treadle_event::{EngineEvent, EventType};

#[derive(Debug, Error)]
pub enum RunStoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("run {0} not found")]
    NotFound(String),
}

/// Per-run persistent status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Per-run persistent record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub pipeline_file: String,
    pub status: RunStatus,
    pub source: Option<String>,
    pub source_hash: Option<String>,
    pub start_time: DateTime<Utc>,
    pub completion_time: Option<DateTime<Utc>>,
    pub current_node: Option<String>,
    pub completed_nodes: Vec<String>,
    pub context_snapshot: HashMap<String, Value>,
    pub error: Option<String>,
}

impl RunManifest {
    pub fn new(run_id: impl Into<String>, pipeline_file: impl Into<String>, source_hash: Option<String>) -> Self {
        Self {
            run_id: run_id.into(),
            pipeline_file: pipeline_file.into(),
            status: RunStatus::Running,
            source: None,
            source_hash,
            start_time: Utc::now(),
            completion_time: None,
            current_node: None,
            completed_nodes: Vec::new(),
            context_snapshot: HashMap::new(),
            error: None,
        }
    }
}

/// Generates a random-hex run id.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Query parameters for [`RunEventStore::query`].
#[derive(Clone, Debug, Default)]
pub struct EventFilter {
    pub types: Option<Vec<EventType>>,
    pub node_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// Result of a filtered query: the page of matching events plus the
/// pre-pagination total.
pub struct QueryResult {
    pub events: Vec<EngineEvent>,
    pub total: usize,
}

/// Aggregate counts returned by [`RunEventStore::summarize`].
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub by_type: HashMap<String, usize>,
    pub by_node: HashMap<String, usize>,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

/// A run whose status is not `running` is treated as stale/eligible for resume
/// once this long has passed since it was created.
pub const STALE_RUNNING_THRESHOLD_SECS: i64 = 300;

pub trait RunEventStore: Send + Sync {
    fn create_run(&self, manifest: &RunManifest) -> Result<(), RunStoreError>;
    fn load_manifest(&self, run_id: &str) -> Result<RunManifest, RunStoreError>;
    fn save_manifest(&self, manifest: &RunManifest) -> Result<(), RunStoreError>;
    fn append(&self, run_id: &str, event: EngineEvent) -> Result<(), RunStoreError>;
    fn query(&self, run_id: &str, filter: &EventFilter) -> Result<QueryResult, RunStoreError>;
    fn tail(&self, run_id: &str, n: usize) -> Result<Vec<EngineEvent>, RunStoreError>;
    fn summarize(&self, run_id: &str) -> Result<RunSummary, RunStoreError>;
    fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, RunStoreError>;
    fn find_resumable(&self, source_hash: &str) -> Result<Option<String>, RunStoreError>;
}

/// Filesystem implementation: one directory per run (`<base>/<run_id>/`)
/// holding `manifest.json` and a line-delimited `events.jsonl`, plus a
/// top-level `index.json` for fast enumeration. All writes are atomic
/// (write-temp + rename), matching [`crate::checkpoint`]'s durability idiom.
pub struct FsRunStore {
    base_dir: PathBuf,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct IndexEntry {
    run_id: String,
    pipeline_file: String,
    status: RunStatus,
    start_time: DateTime<Utc>,
    source_hash: Option<String>,
}

impl FsRunStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.base_dir.join(run_id)
    }

    fn manifest_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("manifest.json")
    }

    fn events_path(&self, run_id: &str) -> PathBuf {
        self.run_dir(run_id).join("events.jsonl")
    }

    fn index_path(&self) -> PathBuf {
        self.base_dir.join("index.json")
    }

    fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), RunStoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut tmp = tempfile::NamedTempFile::new_in(path.parent().unwrap_or_else(|| Path::new(".")))?;
        use std::io::Write as _;
        tmp.write_all(bytes)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| RunStoreError::Io(e.error))?;
        Ok(())
    }

    fn load_index(&self) -> Result<Vec<IndexEntry>, RunStoreError> {
        match std::fs::read(self.index_path()) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_index(&self, entries: &[IndexEntry]) -> Result<(), RunStoreError> {
        let bytes = serde_json::to_vec_pretty(entries)?;
        Self::atomic_write(&self.index_path(), &bytes)
    }

    fn upsert_index(&self, manifest: &RunManifest) -> Result<(), RunStoreError> {
        let mut entries = self.load_index()?;
        let entry = IndexEntry {
            run_id: manifest.run_id.clone(),
            pipeline_file: manifest.pipeline_file.clone(),
            status: manifest.status,
            start_time: manifest.start_time,
            source_hash: manifest.source_hash.clone(),
        };
        match entries.iter_mut().find(|e| e.run_id == manifest.run_id) {
            Some(existing) => *existing = entry,
            None => entries.push(entry),
        }
        self.save_index(&entries)
    }

    fn read_all_events(&self, run_id: &str) -> Result<Vec<EngineEvent>, RunStoreError> {
        let path = self.events_path(run_id);
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut events = Vec::new();
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            // A malformed line is skipped rather than failing the whole query.
            if let Ok(event) = serde_json::from_str::<EngineEvent>(line) {
                events.push(event);
            }
        }
        Ok(events)
    }
}

impl RunEventStore for FsRunStore {
    fn create_run(&self, manifest: &RunManifest) -> Result<(), RunStoreError> {
        std::fs::create_dir_all(self.run_dir(&manifest.run_id))?;
        self.save_manifest(manifest)?;
        self.upsert_index(manifest)
    }

    fn load_manifest(&self, run_id: &str) -> Result<RunManifest, RunStoreError> {
        let bytes = std::fs::read(self.manifest_path(run_id)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RunStoreError::NotFound(run_id.to_string())
            } else {
                RunStoreError::Io(e)
            }
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save_manifest(&self, manifest: &RunManifest) -> Result<(), RunStoreError> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        Self::atomic_write(&self.manifest_path(&manifest.run_id), &bytes)?;
        self.upsert_index(manifest)
    }

    fn append(&self, run_id: &str, mut event: EngineEvent) -> Result<(), RunStoreError> {
        event.ensure_timestamp();
        let line = serde_json::to_string(&event)?;
        let path = self.events_path(run_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        use std::io::Write as _;
        let mut file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn query(&self, run_id: &str, filter: &EventFilter) -> Result<QueryResult, RunStoreError> {
        let all = self.read_all_events(run_id)?;
        let matched: Vec<EngineEvent> = all
            .into_iter()
            .filter(|e| {
                if let Some(types) = &filter.types {
                    if !types.contains(&e.event_type) {
                        return false;
                    }
                }
                if let Some(node_id) = &filter.node_id {
                    if e.node_id.as_deref() != Some(node_id.as_str()) {
                        return false;
                    }
                }
                if let Some(since) = filter.since {
                    if e.timestamp.map(|t| t < since).unwrap_or(false) {
                        return false;
                    }
                }
                if let Some(until) = filter.until {
                    if e.timestamp.map(|t| t > until).unwrap_or(false) {
                        return false;
                    }
                }
                true
            })
            .collect();
        let total = matched.len();
        let offset = filter.offset.unwrap_or(0);
        let events = matched
            .into_iter()
            .skip(offset)
            .take(filter.limit.unwrap_or(usize::MAX))
            .collect();
        Ok(QueryResult { events, total })
    }

    fn tail(&self, run_id: &str, n: usize) -> Result<Vec<EngineEvent>, RunStoreError> {
        let all = self.read_all_events(run_id)?;
        let start = all.len().saturating_sub(n);
        Ok(all[start..].to_vec())
    }

    fn summarize(&self, run_id: &str) -> Result<RunSummary, RunStoreError> {
        let all = self.read_all_events(run_id)?;
        let mut summary = RunSummary {
            total: all.len(),
            ..Default::default()
        };
        for event in &all {
            *summary.by_type.entry(event.event_type.as_str().to_string()).or_insert(0) += 1;
            if let Some(node_id) = &event.node_id {
                *summary.by_node.entry(node_id.clone()).or_insert(0) += 1;
            }
            if let Some(ts) = event.timestamp {
                summary.first = Some(summary.first.map_or(ts, |f| f.min(ts)));
                summary.last = Some(summary.last.map_or(ts, |l| l.max(ts)));
            }
        }
        Ok(summary)
    }

    fn prune(&self, older_than: DateTime<Utc>) -> Result<usize, RunStoreError> {
        let entries = self.load_index()?;
        let mut pruned = 0;
        let mut kept = Vec::new();
        for entry in entries {
            if entry.start_time < older_than {
                let dir = self.run_dir(&entry.run_id);
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)?;
                }
                pruned += 1;
            } else {
                kept.push(entry);
            }
        }
        self.save_index(&kept)?;
        Ok(pruned)
    }

    fn find_resumable(&self, source_hash: &str) -> Result<Option<String>, RunStoreError> {
        let entries = self.load_index()?;
        let now = Utc::now();
        let stale_threshold = ChronoDuration::seconds(STALE_RUNNING_THRESHOLD_SECS);

        let mut candidates: Vec<&IndexEntry> = entries
            .iter()
            .filter(|e| e.source_hash.as_deref() == Some(source_hash))
            .filter(|e| match e.status {
                RunStatus::Completed => false,
                RunStatus::Running => now - e.start_time > stale_threshold,
                RunStatus::Failed | RunStatus::Cancelled => true,
            })
            .filter(|e| {
                let checkpoint = self.run_dir(&e.run_id).join("auto.json");
                checkpoint.exists()
            })
            .collect();

        candidates.sort_by_key(|e| std::cmp::Reverse(e.start_time));
        Ok(candidates.first().map(|e| e.run_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(event_type: EventType, node_id: &str) -> EngineEvent {
        let mut e = EngineEvent::new(event_type, Some(node_id.to_string()));
        e.ensure_timestamp();
        e
    }

    /// **Scenario**: append then tail returns events in insertion order.
    #[test]
    fn append_then_tail_preserves_order() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRunStore::new(dir.path().to_path_buf());
        store.append("run1", event(EventType::StageStarted, "a")).unwrap();
        store.append("run1", event(EventType::StageCompleted, "a")).unwrap();
        let tailed = store.tail("run1", 1).unwrap();
        assert_eq!(tailed.len(), 1);
        assert_eq!(tailed[0].event_type, EventType::StageCompleted);
    }

    /// **Scenario**: summarize reports total, by_type, and by_node counts.
    #[test]
    fn summarize_counts_by_type_and_node() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRunStore::new(dir.path().to_path_buf());
        store.append("run1", event(EventType::StageStarted, "a")).unwrap();
        store.append("run1", event(EventType::StageStarted, "b")).unwrap();
        let summary = store.summarize("run1").unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.by_type["stage.started"], 2);
        assert_eq!(summary.by_node["a"], 1);
    }

    /// **Scenario**: a running run younger than the stale threshold is not resumable.
    #[test]
    fn recent_running_run_is_not_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRunStore::new(dir.path().to_path_buf());
        let manifest = RunManifest::new("run1", "p.dot", Some("hash1".to_string()));
        store.create_run(&manifest).unwrap();
        std::fs::write(dir.path().join("run1").join("auto.json"), "{}").unwrap();
        assert_eq!(store.find_resumable("hash1").unwrap(), None);
    }

    /// **Scenario**: a failed run with a checkpoint is resumable.
    #[test]
    fn failed_run_with_checkpoint_is_resumable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRunStore::new(dir.path().to_path_buf());
        let mut manifest = RunManifest::new("run1", "p.dot", Some("hash1".to_string()));
        manifest.status = RunStatus::Failed;
        store.create_run(&manifest).unwrap();
        std::fs::write(dir.path().join("run1").join("auto.json"), "{}").unwrap();
        assert_eq!(store.find_resumable("hash1").unwrap(), Some("run1".to_string()));
    }

    /// **Scenario**: prune removes runs started before the cutoff and keeps the rest.
    #[test]
    fn prune_removes_old_runs() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRunStore::new(dir.path().to_path_buf());
        let mut old = RunManifest::new("old", "p.dot", None);
        old.start_time = Utc::now() - ChronoDuration::days(10);
        store.create_run(&old).unwrap();
        let recent = RunManifest::new("recent", "p.dot", None);
        store.create_run(&recent).unwrap();

        let pruned = store.prune(Utc::now() - ChronoDuration::days(1)).unwrap();
        assert_eq!(pruned, 1);
        assert!(!dir.path().join("old").exists());
        assert!(dir.path().join("recent").exists());
    }
}
