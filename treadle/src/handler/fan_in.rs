//! Join barrier: placed after a branch subgraph.
//! Validates that the parallel executor populated `parallel.results`, then
//! optionally runs a deterministic shell check with the same contract as `tool`.

use async_trait::async_trait;

use super::tool::{env_overlay_from_node, resolve_timeout, run_shell};
use super::Handler;
use crate::cancel::CancelToken;
use crate::context::Context;
use crate::graph::{Graph, Node};
use crate::interfaces::ArtifactStore;
use crate::outcome::Outcome;
use crate::retry::HandlerError;

const DEFAULT_TIMEOUT_SECS: u64 = 30;

pub struct ParallelFanInHandler;

#[async_trait]
impl Handler for ParallelFanInHandler {
    fn type_name(&self) -> &'static str {
        "parallel.fan_in"
    }

    async fn execute(
        &self,
        cancel: CancelToken,
        _graph: &Graph,
        node: &Node,
        context: &Context,
        artifacts: &dyn ArtifactStore,
    ) -> Result<Outcome, HandlerError> {
        let results_populated = match context.get("parallel.results") {
            Some(serde_json::Value::Array(arr)) => !arr.is_empty(),
            _ => false,
        };
        if !results_populated {
            return Err(HandlerError::new(format!(
                "fan_in node {} reached with no parallel.results in context",
                node.id
            )));
        }

        let mut outcome = Outcome::success();

        if let Some(command) = node.attr("verify_command") {
            let timeout = resolve_timeout(node, DEFAULT_TIMEOUT_SECS);
            let env_overlay = env_overlay_from_node(node);
            let working_dir = node.attr("working_dir");
            let result = run_shell(command, working_dir, &env_overlay, timeout, &cancel).await?;

            let combined = if result.stderr.is_empty() {
                result.stdout.clone()
            } else {
                format!("{}\n{}", result.stdout, result.stderr)
            };
            let artifact_id = format!("{}.output", node.id);
            artifacts
                .store(&artifact_id, "text", combined.as_bytes().to_vec())
                .await
                .map_err(|e| HandlerError::new(format!("failed to store fan_in verify output: {e}")))?;

            if result.timed_out || result.exit_code != 0 {
                outcome = Outcome::fail(format!("fan_in verify_command exited with code {}", result.exit_code));
            }
        }

        outcome = outcome.with_context_update("parallel.fan_in.completed", true);
        context.apply_updates(outcome.context_updates.clone());
        Ok(outcome)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
