//! Sub-pipeline iteration host: same backend
//! invocation mechanics as `codergen`, plus tracking of how many times this
//! node itself has been re-entered — the engine-level restart signal (an
//! edge's `loop_restart=true`) decides *whether* to loop back here; this
//! handler only records *that* it has been looped back to.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::codergen::{build_agent_config, result_context_updates};
use super::Handler;
use crate::cancel::CancelToken;
use crate::context::Context;
use crate::graph::{Graph, Node};
use crate::interfaces::{ArtifactStore, CodergenBackend};
use crate::outcome::Outcome;
use crate::retry::HandlerError;

pub struct StackManagerLoopHandler {
    backend: RwLock<Option<Arc<dyn CodergenBackend>>>,
}

impl StackManagerLoopHandler {
    pub fn new() -> Self {
        Self { backend: RwLock::new(None) }
    }

    pub fn set_backend(&self, backend: Arc<dyn CodergenBackend>) {
        *self.backend.write().expect("stack.manager_loop backend lock poisoned") = Some(backend);
    }

    fn backend(&self) -> Option<Arc<dyn CodergenBackend>> {
        self.backend.read().expect("stack.manager_loop backend lock poisoned").clone()
    }
}

impl Default for StackManagerLoopHandler {
    fn default() -> Self {
        Self::new()
    }
}

fn iteration_key(node_id: &str) -> String {
    format!("stack_manager_loop.{node_id}.iteration")
}

#[async_trait]
impl Handler for StackManagerLoopHandler {
    fn type_name(&self) -> &'static str {
        "stack.manager_loop"
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
            .ok_or_else(|| HandlerError::new(format!("stack.manager_loop node {} has no backend wired", node.id)))?;

        let key = iteration_key(&node.id);
        let iteration = match context.get(&key) {
            Some(serde_json::Value::Number(n)) => n.as_u64().unwrap_or(0) + 1,
            _ => 1,
        };
        let is_restart = iteration > 1;
        context.set(key.clone(), iteration);
        context.set("stack_manager_loop.is_restart", is_restart);

        let config = build_agent_config(node, context, artifacts, None, None);
        let result = backend.run_agent(cancel, config).await.map_err(|e| HandlerError::new(e.0))?;

        let artifact_id = format!("{}.output", node.id);
        artifacts
            .store(&artifact_id, "text", result.output.as_bytes().to_vec())
            .await
            .map_err(|e| HandlerError::new(format!("failed to store stack.manager_loop output: {e}")))?;

        let mut updates = result_context_updates(&result);
        updates.insert("last_stage".into(), node.id.clone().into());
        updates.insert(key, iteration.into());
        updates.insert("stack_manager_loop.is_restart".into(), is_restart.into());
        let updates_map: std::collections::HashMap<String, serde_json::Value> = updates.into_iter().collect();
        context.apply_updates(updates_map.clone());

        let status = if result.success { Outcome::success() } else { Outcome::fail("stack.manager_loop backend reported failure") };
        Ok(Outcome { context_updates: updates_map, notes: Some(result.output), ..status })
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
