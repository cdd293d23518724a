//! External interfaces the core consumes: parser, validator, codergen backend,
//! interviewer, artifact store, event sink. These are typed boundaries, not
//! wire formats — the DOT textual format, the CLI, and any HTTP/SSE surface
//! live outside this crate.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::graph::Graph;

#[derive(Debug, Error)]
#[error("parse error: {0}")]
pub struct ParseError(pub String);

/// Severity of a single validation finding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// One validation finding.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub node_id: Option<String>,
    pub fix_suggestion: Option<String>,
}

impl Diagnostic {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
            node_id: None,
            fix_suggestion: None,
        }
    }

    pub fn with_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix_suggestion = Some(fix.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }
}

/// Parses pipeline source text into a [`Graph`]. Lives outside this crate in
/// production (the DOT dialect is a system-boundary concern); tests and the
/// sub-pipeline inliner are generic over this trait.
pub trait Parser: Send + Sync {
    fn parse(&self, text: &str) -> Result<Graph, ParseError>;
}

/// A user-supplied structural check, run alongside the built-in validation
/// rules during VALIDATE.
pub type ValidationRule = Box<dyn Fn(&Graph) -> Vec<Diagnostic> + Send + Sync>;

/// Runs structural validation over a parsed graph.
pub trait Validator: Send + Sync {
    fn validate(&self, graph: &Graph, extra_rules: &[ValidationRule]) -> Vec<Diagnostic>;
}

/// Token accounting returned by a codergen backend invocation.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub reasoning: u64,
    pub cache_read: u64,
    pub cache_write: u64,
}

/// Configuration for one codergen/conditional backend invocation.
#[derive(Clone)]
pub struct AgentConfig {
    pub prompt: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub base_url: Option<String>,
    pub work_dir: PathBuf,
    pub goal: Option<String>,
    pub node_id: String,
    pub max_turns: u32,
    pub fidelity_mode: String,
    /// Sink for agent-level events (`agent.tool_call.*`, `agent.llm_turn`,
    /// `agent.steering`, `agent.loop_detected`); `None` when no engine event
    /// handler is wired.
    pub event_handler: Option<EventHandlerFn>,
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("prompt", &self.prompt)
            .field("model", &self.model)
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("work_dir", &self.work_dir)
            .field("goal", &self.goal)
            .field("node_id", &self.node_id)
            .field("max_turns", &self.max_turns)
            .field("fidelity_mode", &self.fidelity_mode)
            .field("event_handler", &self.event_handler.is_some())
            .finish()
    }
}

/// Result of one codergen/conditional backend invocation.
#[derive(Clone, Debug, Default)]
pub struct AgentResult {
    pub success: bool,
    pub output: String,
    pub tool_calls: u64,
    pub turn_count: u64,
    pub tokens_used: u64,
    pub token_usage: TokenUsage,
}

#[derive(Debug, Error)]
#[error("codergen backend error: {0}")]
pub struct BackendError(pub String);

/// Runs an LLM coding agent. Injected into the `codergen` and `conditional`
/// handlers at INITIALIZE via decorator unwrap.
#[async_trait]
pub trait CodergenBackend: Send + Sync {
    async fn run_agent(&self, cancel: CancelToken, config: AgentConfig) -> Result<AgentResult, BackendError>;
}

#[derive(Debug, Error)]
#[error("interviewer error: {0}")]
pub struct InterviewError(pub String);

/// A question posed by `wait.human`, along with the labeled choices derived
/// from the node's outgoing edges.
#[derive(Clone, Debug)]
pub struct Question {
    pub text: String,
    pub options: Vec<String>,
    pub node_id: String,
}

/// Blocking human-in-the-loop capability. Treated like any other
/// potentially long-running handler: subject to cancellation, and an
/// implementation may return on timeout to let `wait.human` re-dispatch.
#[async_trait]
pub trait Interviewer: Send + Sync {
    async fn ask(&self, cancel: CancelToken, question: Question) -> Result<String, InterviewError>;
}

#[derive(Debug, Error)]
#[error("artifact store error: {0}")]
pub struct ArtifactError(pub String);

/// Content-addressed-by-id blob storage for handler outputs.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn store(&self, artifact_id: &str, kind: &str, bytes: Vec<u8>) -> Result<String, ArtifactError>;
    async fn retrieve(&self, artifact_id: &str) -> Result<Vec<u8>, ArtifactError>;
    async fn has(&self, artifact_id: &str) -> bool;
    fn base_dir(&self) -> PathBuf;
}

/// Filesystem-backed artifact store: `<base_dir>/<artifact_id>`, with `/`-free
/// ids. Non-existent parent directories are created on first store.
pub struct FsArtifactStore {
    base_dir: PathBuf,
}

impl FsArtifactStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    fn path_for(&self, artifact_id: &str) -> PathBuf {
        self.base_dir.join(artifact_id)
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn store(&self, artifact_id: &str, _kind: &str, bytes: Vec<u8>) -> Result<String, ArtifactError> {
        let path = self.path_for(artifact_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ArtifactError(e.to_string()))?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| ArtifactError(e.to_string()))?;
        Ok(artifact_id.to_string())
    }

    async fn retrieve(&self, artifact_id: &str) -> Result<Vec<u8>, ArtifactError> {
        tokio::fs::read(self.path_for(artifact_id))
            .await
            .map_err(|e| ArtifactError(e.to_string()))
    }

    async fn has(&self, artifact_id: &str) -> bool {
        tokio::fs::metadata(self.path_for(artifact_id)).await.is_ok()
    }

    fn base_dir(&self) -> PathBuf {
        self.base_dir.clone()
    }
}

/// Single event sink per engine instance. The core invokes this only when a
/// handler is wired; every emit call must tolerate no sink being configured.
pub type EventHandlerFn = std::sync::Arc<dyn Fn(treadle_event::EngineEvent) + Send + Sync>;

/// Graph-attribute map mirrored into context at INITIALIZE.
pub type GraphAttrs = HashMap<String, String>;
