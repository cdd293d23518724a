//! Top-level error type returned by the engine's public entry points.

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::parallel_exec::ParallelError;
use crate::run_store::RunStoreError;

/// Errors surfaced across the PARSE → VALIDATE → PREFLIGHT → EXECUTE lifecycle.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("parse failed: {0}")]
    Parse(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("preflight check failed: {0}")]
    Preflight(String),

    #[error("no handler registered for node {node_id} (resolved type {node_type})")]
    NoHandler { node_id: String, node_type: String },

    #[error("node {node_id} failed: {reason}")]
    NodeFailed { node_id: String, reason: String },

    #[error("dead end at node {node_id}: fail outcome with no matching fail edge")]
    DeadEnd { node_id: String },

    #[error("goal gate failed at node {node_id} with no retry target configured")]
    GoalGateUnrecoverable { node_id: String },

    #[error("exceeded max restarts ({max_restarts}) via loop_restart")]
    TooManyRestarts { max_restarts: u32 },

    #[error("exceeded traversal safety ceiling ({limit} iterations)")]
    TraversalCeilingExceeded { limit: u32 },

    #[error(transparent)]
    Parallel(#[from] ParallelError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    RunStore(#[from] RunStoreError),

    #[error("run cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
