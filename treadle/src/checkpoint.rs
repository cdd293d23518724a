//! Checkpoint store: a serializable snapshot of traversal
//! progress, persisted atomically, with resume support and fidelity
//! degradation on the first post-resume hop.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::context::Context;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("io error writing checkpoint: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("current node {0} not found in graph on resume")]
    CurrentNodeMissing(String),
}

/// Captured at each node boundary: completed node ids,
/// current node id, per-node retry counters, and a full context snapshot
/// (values + log).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub completed_nodes: Vec<String>,
    pub current_node: String,
    pub retry_counts: HashMap<String, u32>,
    pub context_values: HashMap<String, Value>,
    pub context_logs: Vec<String>,
}

impl Checkpoint {
    pub fn capture(
        current_node: impl Into<String>,
        completed_nodes: Vec<String>,
        retry_counts: HashMap<String, u32>,
        context: &Context,
    ) -> Self {
        Self {
            completed_nodes,
            current_node: current_node.into(),
            retry_counts,
            context_values: context.snapshot(),
            context_logs: context.logs(),
        }
    }

    /// Rehydrates a [`Context`] from this checkpoint's values and log.
    pub fn rehydrate_context(&self) -> Context {
        let context = Context::from_map(self.context_values.clone());
        context.replace_logs(self.context_logs.clone());
        context
    }
}

/// Writes `bytes` to `path` atomically: write to a sibling temp file, then
/// rename over the destination. The rename is atomic on a single filesystem.
fn atomic_write(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = tempfile::NamedTempFile::new_in(path.parent().unwrap_or_else(|| Path::new(".")))?;
    use std::io::Write as _;
    tmp.write_all(bytes)?;
    tmp.flush()?;
    tmp.persist(path).map_err(|e| CheckpointError::Io(e.error))?;
    Ok(())
}

/// Filesystem-backed checkpoint persistence for one run.
///
/// Maintains a single overwriting `auto.json` file for crash recovery, plus
/// (when `per_node` is true) a timestamped file per node for a full history.
pub struct FsCheckpointStore {
    run_dir: PathBuf,
    per_node: bool,
}

impl FsCheckpointStore {
    pub fn new(run_dir: PathBuf, per_node: bool) -> Self {
        Self { run_dir, per_node }
    }

    fn auto_path(&self) -> PathBuf {
        self.run_dir.join("auto.json")
    }

    fn per_node_path(&self, node_id: &str, seq: u64) -> PathBuf {
        self.run_dir
            .join("checkpoints")
            .join(format!("{seq:010}-{node_id}.json"))
    }

    /// Persists `checkpoint`, overwriting the auto-recovery file and, if
    /// per-node history is enabled, also writing a timestamped snapshot.
    pub fn save(&self, checkpoint: &Checkpoint, seq: u64) -> Result<(), CheckpointError> {
        let bytes = serde_json::to_vec_pretty(checkpoint)?;
        atomic_write(&self.auto_path(), &bytes)?;
        if self.per_node {
            atomic_write(&self.per_node_path(&checkpoint.current_node, seq), &bytes)?;
        }
        Ok(())
    }

    /// Loads the most recent checkpoint (the auto-recovery file).
    pub fn load(&self) -> Result<Checkpoint, CheckpointError> {
        let bytes = std::fs::read(self.auto_path())?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn has_checkpoint(&self) -> bool {
        self.auto_path().exists()
    }
}

/// Fidelity degradation rule applied to the first hop after a resume: an edge resolved to `full` is forced down to `summary:high`
/// because an in-flight LLM session cannot survive the serialization
/// boundary a checkpoint represents.
pub fn degrade_first_hop_fidelity(mode: crate::fidelity::FidelityMode) -> crate::fidelity::FidelityMode {
    if mode.is_full() {
        crate::fidelity::FidelityMode::SummaryHigh
    } else {
        mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_checkpoint() -> Checkpoint {
        let mut retry_counts = HashMap::new();
        retry_counts.insert("work".to_string(), 2);
        let mut values = HashMap::new();
        values.insert("outcome".to_string(), json!("success"));
        Checkpoint {
            completed_nodes: vec!["start".to_string(), "work".to_string()],
            current_node: "work".to_string(),
            retry_counts,
            context_values: values,
            context_logs: vec!["did work".to_string()],
        }
    }

    /// **Scenario**: save then load round-trips the checkpoint byte-for-byte in content.
    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path().to_path_buf(), false);
        let checkpoint = sample_checkpoint();
        store.save(&checkpoint, 1).unwrap();
        assert!(store.has_checkpoint());

        let loaded = store.load().unwrap();
        assert_eq!(loaded.current_node, "work");
        assert_eq!(loaded.completed_nodes, vec!["start", "work"]);
        assert_eq!(loaded.retry_counts.get("work"), Some(&2));
    }

    /// **Scenario**: per_node=true also writes a timestamped history file alongside auto.json.
    #[test]
    fn per_node_writes_history_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCheckpointStore::new(dir.path().to_path_buf(), true);
        store.save(&sample_checkpoint(), 7).unwrap();
        let history_dir = dir.path().join("checkpoints");
        let entries: Vec<_> = std::fs::read_dir(&history_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    /// **Scenario**: rehydrate_context restores both values and the log.
    #[test]
    fn rehydrate_context_restores_values_and_log() {
        let checkpoint = sample_checkpoint();
        let context = checkpoint.rehydrate_context();
        assert_eq!(context.get("outcome"), Some(json!("success")));
        assert_eq!(context.logs(), vec!["did work".to_string()]);
    }

    /// **Scenario**: a resolved-full fidelity mode is forced to summary:high on the first
    /// post-resume hop; every other mode passes through unchanged.
    #[test]
    fn degrade_first_hop_forces_summary_high_only_for_full() {
        use crate::fidelity::FidelityMode;
        assert_eq!(degrade_first_hop_fidelity(FidelityMode::Full), FidelityMode::SummaryHigh);
        assert_eq!(degrade_first_hop_fidelity(FidelityMode::Compact), FidelityMode::Compact);
    }
}
