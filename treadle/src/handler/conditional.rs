//! Branching gate: an LLM-backed gate when the node
//! has a `prompt`, otherwise a pass-through that reads the `outcome` context key.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::codergen::{build_agent_config, result_context_updates};
use super::Handler;
use crate::cancel::CancelToken;
use crate::context::Context;
use crate::graph::{Graph, Node};
use crate::interfaces::{ArtifactStore, CodergenBackend};
use crate::outcome::{Outcome, Status};
use crate::retry::HandlerError;

const PASS_MARKER: &str = "OUTCOME:PASS";
const FAIL_MARKER: &str = "OUTCOME:FAIL";

/// `conditional` runs the same backend as `codergen` when `prompt` is set, else
/// it is a pure pass-through over the `outcome` context key.
pub struct ConditionalHandler {
    backend: RwLock<Option<Arc<dyn CodergenBackend>>>,
}

impl ConditionalHandler {
    pub fn new() -> Self {
        Self { backend: RwLock::new(None) }
    }

    pub fn set_backend(&self, backend: Arc<dyn CodergenBackend>) {
        *self.backend.write().expect("conditional backend lock poisoned") = Some(backend);
    }

    fn backend(&self) -> Option<Arc<dyn CodergenBackend>> {
        self.backend.read().expect("conditional backend lock poisoned").clone()
    }
}

impl Default for ConditionalHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Fail takes precedence when both terminators appear; absent both, fall back
/// to the backend's own success flag.
fn interpret_output(output: &str, backend_success: bool) -> bool {
    let has_fail = output.contains(FAIL_MARKER);
    let has_pass = output.contains(PASS_MARKER);
    if has_fail {
        false
    } else if has_pass {
        true
    } else {
        backend_success
    }
}

#[async_trait]
impl Handler for ConditionalHandler {
    fn type_name(&self) -> &'static str {
        "conditional"
    }

    async fn execute(
        &self,
        cancel: CancelToken,
        _graph: &Graph,
        node: &Node,
        context: &Context,
        artifacts: &dyn ArtifactStore,
    ) -> Result<Outcome, HandlerError> {
        let prompt = node.attr("prompt");
        if prompt.is_none() || prompt == Some("") {
            let status = match context.get("outcome") {
                Some(serde_json::Value::String(s)) if s == "fail" => Status::Fail,
                _ => Status::Success,
            };
            let mut outcome = Outcome { status: Some(status), ..Default::default() };
            outcome = outcome.with_context_update("last_stage", node.id.clone());
            context.apply_updates(outcome.context_updates.clone());
            return Ok(outcome);
        }

        let backend = self
            .backend()
            .ok_or_else(|| HandlerError::new(format!("conditional node {} has no backend wired", node.id)))?;

        let config = build_agent_config(node, context, artifacts, None, None);
        let result = backend
            .run_agent(cancel, config)
            .await
            .map_err(|e| HandlerError::new(e.0))?;

        let artifact_id = format!("{}.output", node.id);
        artifacts
            .store(&artifact_id, "text", result.output.as_bytes().to_vec())
            .await
            .map_err(|e| HandlerError::new(format!("failed to store conditional output: {e}")))?;

        let passed = interpret_output(&result.output, result.success);
        let mut updates = result_context_updates(&result);
        updates.insert("last_stage".into(), node.id.clone().into());
        let updates_map: std::collections::HashMap<String, serde_json::Value> = updates.into_iter().collect();
        context.apply_updates(updates_map.clone());

        Ok(Outcome {
            status: Some(if passed { Status::Success } else { Status::Fail }),
            context_updates: updates_map,
            notes: Some(result.output),
            ..Default::default()
        })
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{AgentResult, BackendError, FsArtifactStore};

    struct StubBackend(AgentResult);

    #[async_trait]
    impl CodergenBackend for StubBackend {
        async fn run_agent(&self, _cancel: CancelToken, _config: crate::interfaces::AgentConfig) -> Result<AgentResult, BackendError> {
            Ok(self.0.clone())
        }
    }

    fn result_with_output(text: &str, success: bool) -> AgentResult {
        AgentResult { success, output: text.to_string(), ..Default::default() }
    }

    /// **Scenario**: without a prompt, the handler is a pass-through over the outcome key.
    #[tokio::test]
    async fn pass_through_reads_outcome_key() {
        let handler = ConditionalHandler::new();
        let graph = Graph::new();
        let node = Node::new("gate");
        let context = Context::new();
        context.set("outcome", "fail");
        let artifacts = FsArtifactStore::new(std::env::temp_dir());

        let outcome = handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await
            .unwrap();
        assert!(outcome.is_fail());
    }

    /// **Scenario**: OUTCOME:FAIL takes precedence even when OUTCOME:PASS also appears.
    #[tokio::test]
    async fn fail_marker_takes_precedence_over_pass() {
        let handler = ConditionalHandler::new();
        handler.set_backend(Arc::new(StubBackend(result_with_output(
            "looked good OUTCOME:PASS but then OUTCOME:FAIL",
            true,
        ))));
        let graph = Graph::new();
        let mut node = Node::new("gate");
        node.attrs.insert("prompt".into(), "check it".into());
        let context = Context::new();
        let dir = tempfile::tempdir().unwrap();
        let artifacts = FsArtifactStore::new(dir.path().to_path_buf());

        let outcome = handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await
            .unwrap();
        assert!(outcome.is_fail());
    }

    /// **Scenario**: with neither terminator present, the backend's own success flag decides.
    #[tokio::test]
    async fn falls_back_to_backend_success_flag() {
        let handler = ConditionalHandler::new();
        handler.set_backend(Arc::new(StubBackend(result_with_output("no terminator here", true))));
        let graph = Graph::new();
        let mut node = Node::new("gate");
        node.attrs.insert("prompt".into(), "check it".into());
        let context = Context::new();
        let dir = tempfile::tempdir().unwrap();
        let artifacts = FsArtifactStore::new(dir.path().to_path_buf());

        let outcome = handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await
            .unwrap();
        assert!(!outcome.is_fail());
    }

    /// **Scenario**: a prompt with no wired backend fails loudly.
    #[tokio::test]
    async fn missing_backend_fails_loudly() {
        let handler = ConditionalHandler::new();
        let graph = Graph::new();
        let mut node = Node::new("gate");
        node.attrs.insert("prompt".into(), "check it".into());
        let context = Context::new();
        let artifacts = FsArtifactStore::new(std::env::temp_dir());

        let result = handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await;
        assert!(result.is_err());
    }
}
