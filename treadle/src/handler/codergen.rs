//! LLM coding-agent invocation: runs the injected
//! [`CodergenBackend`], resolving model/provider/base-url/working-dir/fidelity
//! from node attrs with context and handler-default fallbacks.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::Handler;
use crate::cancel::CancelToken;
use crate::context::Context;
use crate::graph::{Graph, Node};
use crate::interfaces::{AgentConfig, ArtifactStore, CodergenBackend, EventHandlerFn};
use crate::outcome::Outcome;
use crate::retry::HandlerError;

const DEFAULT_MAX_TURNS: u32 = 20;

/// Resolves `base_url`: node attr → context key → handler default.
fn resolve_base_url(node: &Node, context: &Context, handler_default: Option<&str>) -> Option<String> {
    node.attr("base_url")
        .map(str::to_string)
        .or_else(|| match context.get("base_url") {
            Some(serde_json::Value::String(s)) => Some(s),
            _ => None,
        })
        .or_else(|| handler_default.map(str::to_string))
}

/// Resolves the working directory: node attr → artifact store base dir.
fn resolve_work_dir(node: &Node, artifacts: &dyn ArtifactStore) -> std::path::PathBuf {
    node.attr("working_dir")
        .or_else(|| node.attr("workdir"))
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|| artifacts.base_dir())
}

/// Builds the shared [`AgentConfig`] used by both `codergen` and `conditional`.
pub(super) fn build_agent_config(
    node: &Node,
    context: &Context,
    artifacts: &dyn ArtifactStore,
    handler_default_base_url: Option<&str>,
    event_handler: Option<EventHandlerFn>,
) -> AgentConfig {
    let prompt = node.attr_or("prompt", "").to_string();
    let model = node.attr("llm_model").map(str::to_string);
    let provider = node.attr("llm_provider").map(str::to_string);
    let base_url = resolve_base_url(node, context, handler_default_base_url);
    let work_dir = resolve_work_dir(node, artifacts);
    let goal = match context.get("goal") {
        Some(serde_json::Value::String(s)) => Some(s),
        _ => None,
    };
    let max_turns = node.attr_parsed("max_turns", DEFAULT_MAX_TURNS);
    let fidelity_mode = node
        .attr("fidelity")
        .map(str::to_string)
        .unwrap_or_else(|| context.get_as_string_with_default("_fidelity_mode", "compact"));

    AgentConfig {
        prompt,
        model,
        provider,
        base_url,
        work_dir,
        goal,
        node_id: node.id.clone(),
        max_turns,
        fidelity_mode,
        event_handler,
    }
}

/// Applies an [`crate::interfaces::AgentResult`] to context-update keys shared by
/// `codergen` and `conditional`'s success path.
pub(super) fn result_context_updates(result: &crate::interfaces::AgentResult) -> serde_json::Map<String, serde_json::Value> {
    let mut m = serde_json::Map::new();
    m.insert("codergen.tool_calls".into(), result.tool_calls.into());
    m.insert("codergen.tokens_used".into(), result.tokens_used.into());
    m.insert("codergen.turn_count".into(), result.turn_count.into());
    m.insert("codergen.tokens_in".into(), result.token_usage.input.into());
    m.insert("codergen.tokens_out".into(), result.token_usage.output.into());
    m.insert("codergen.tokens_reasoning".into(), result.token_usage.reasoning.into());
    m.insert("codergen.tokens_cache_read".into(), result.token_usage.cache_read.into());
    m.insert("codergen.tokens_cache_write".into(), result.token_usage.cache_write.into());
    m
}

/// Runs an LLM coding agent via the injected backend. Installed post-construction
/// via [`CodergenHandler::set_backend`] at INITIALIZE, through the decorator-unwrap
/// accessor — there is no such thing as an un-backed codergen node
/// in a real run, so a missing backend is a loud error, not a silent skip.
pub struct CodergenHandler {
    backend: RwLock<Option<Arc<dyn CodergenBackend>>>,
    default_base_url: RwLock<Option<String>>,
    event_handler: RwLock<Option<EventHandlerFn>>,
}

impl CodergenHandler {
    pub fn new() -> Self {
        Self {
            backend: RwLock::new(None),
            default_base_url: RwLock::new(None),
            event_handler: RwLock::new(None),
        }
    }

    pub fn set_backend(&self, backend: Arc<dyn CodergenBackend>) {
        *self.backend.write().expect("codergen backend lock poisoned") = Some(backend);
    }

    pub fn set_default_base_url(&self, base_url: impl Into<String>) {
        *self.default_base_url.write().expect("codergen base url lock poisoned") = Some(base_url.into());
    }

    pub fn set_event_handler(&self, handler: EventHandlerFn) {
        *self.event_handler.write().expect("codergen event handler lock poisoned") = Some(handler);
    }

    fn backend(&self) -> Option<Arc<dyn CodergenBackend>> {
        self.backend.read().expect("codergen backend lock poisoned").clone()
    }

    fn event_handler_clone(&self) -> Option<EventHandlerFn> {
        self.event_handler.read().expect("codergen event handler lock poisoned").clone()
    }
}

impl Default for CodergenHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for CodergenHandler {
    fn type_name(&self) -> &'static str {
        "codergen"
    }

    async fn execute(
        &self,
        cancel: CancelToken,
        _graph: &Graph,
        node: &Node,
        context: &Context,
        artifacts: &dyn ArtifactStore,
    ) -> Result<Outcome, HandlerError> {
        let backend = self
            .backend()
            .ok_or_else(|| HandlerError::new(format!("codergen node {} has no backend wired", node.id)))?;

        let default_base_url = self.default_base_url.read().expect("codergen base url lock poisoned").clone();
        let config = build_agent_config(node, context, artifacts, default_base_url.as_deref(), self.event_handler_clone());
        let prompt = config.prompt.clone();

        match backend.run_agent(cancel, config).await {
            Ok(result) => {
                let artifact_id = format!("{}.output", node.id);
                artifacts
                    .store(&artifact_id, "text", result.output.as_bytes().to_vec())
                    .await
                    .map_err(|e| HandlerError::new(format!("failed to store agent output: {e}")))?;

                let mut updates = result_context_updates(&result);
                updates.insert("last_stage".into(), node.id.clone().into());

                let status = if result.success {
                    Outcome::success()
                } else {
                    Outcome::fail("codergen backend reported failure")
                };
                let updates_map: std::collections::HashMap<String, serde_json::Value> =
                    updates.into_iter().collect();
                context.apply_updates(updates_map.clone());
                Ok(Outcome {
                    context_updates: updates_map,
                    notes: Some(result.output),
                    ..status
                })
            }
            Err(e) => {
                let mut updates = std::collections::HashMap::new();
                updates.insert("last_stage".to_string(), node.id.clone().into());
                updates.insert("codergen.prompt".to_string(), prompt.into());
                context.apply_updates(updates.clone());
                Ok(Outcome {
                    status: Some(crate::outcome::Status::Fail),
                    context_updates: updates,
                    failure_reason: Some(e.0),
                    ..Default::default()
                })
            }
        }
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{AgentResult, BackendError, FsArtifactStore};

    struct StubBackend {
        result: Result<AgentResult, String>,
    }

    #[async_trait]
    impl CodergenBackend for StubBackend {
        async fn run_agent(&self, _cancel: CancelToken, _config: AgentConfig) -> Result<AgentResult, BackendError> {
            match &self.result {
                Ok(r) => Ok(r.clone()),
                Err(e) => Err(BackendError(e.clone())),
            }
        }
    }

    fn node_with_prompt(prompt: &str) -> Node {
        let mut n = Node::new("work");
        n.attrs.insert("prompt".into(), prompt.to_string());
        n
    }

    /// **Scenario**: without a wired backend, execution fails loudly rather than skipping.
    #[tokio::test]
    async fn missing_backend_fails_loudly() {
        let handler = CodergenHandler::new();
        let graph = Graph::new();
        let node = node_with_prompt("hi");
        let context = Context::new();
        let artifacts = FsArtifactStore::new(std::env::temp_dir());

        let result = handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await;
        assert!(result.is_err());
    }

    /// **Scenario**: a successful backend result populates token/tool counters and stores output.
    #[tokio::test]
    async fn success_populates_counters_and_stores_output() {
        let handler = CodergenHandler::new();
        handler.set_backend(Arc::new(StubBackend {
            result: Ok(AgentResult {
                success: true,
                output: "done".to_string(),
                tool_calls: 3,
                turn_count: 2,
                tokens_used: 100,
                token_usage: crate::interfaces::TokenUsage { input: 50, output: 50, reasoning: 0, cache_read: 0, cache_write: 0 },
            }),
        }));
        let graph = Graph::new();
        let node = node_with_prompt("hi");
        let context = Context::new();
        let dir = tempfile::tempdir().unwrap();
        let artifacts = FsArtifactStore::new(dir.path().to_path_buf());

        let outcome = handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await
            .unwrap();
        assert!(!outcome.is_fail());
        assert_eq!(context.get("codergen.tool_calls"), Some(serde_json::json!(3)));
        assert!(artifacts.has("work.output").await);
    }

    /// **Scenario**: a backend error yields a fail outcome with last_stage and codergen.prompt set.
    #[tokio::test]
    async fn backend_error_sets_prompt_and_last_stage() {
        let handler = CodergenHandler::new();
        handler.set_backend(Arc::new(StubBackend { result: Err("boom".to_string()) }));
        let graph = Graph::new();
        let node = node_with_prompt("do the thing");
        let context = Context::new();
        let artifacts = FsArtifactStore::new(std::env::temp_dir());

        let outcome = handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await
            .unwrap();
        assert!(outcome.is_fail());
        assert_eq!(context.get("last_stage"), Some(serde_json::json!("work")));
        assert_eq!(context.get("codergen.prompt"), Some(serde_json::json!("do the thing")));
    }
}
