//! Deterministic shell gate: same execution mechanics as
//! `tool`, but semantics are binary — exit 0 sets `outcome=success`, anything
//! else sets `outcome=fail`. Output is always stored as an artifact.

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

pub struct VerifyHandler;

#[async_trait]
impl Handler for VerifyHandler {
    fn type_name(&self) -> &'static str {
        "verify"
    }

    async fn execute(
        &self,
        cancel: CancelToken,
        _graph: &Graph,
        node: &Node,
        context: &Context,
        artifacts: &dyn ArtifactStore,
    ) -> Result<Outcome, HandlerError> {
        let command = node
            .attr("verify_command")
            .or_else(|| node.attr("command"))
            .or_else(|| node.attr("prompt"))
            .ok_or_else(|| HandlerError::new("verify node has no verify_command"))?;
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
            .map_err(|e| HandlerError::new(format!("failed to store verify output: {e}")))?;

        let success = !result.timed_out && result.exit_code == 0;
        let mut outcome = if success {
            Outcome::success()
        } else if result.timed_out {
            Outcome::fail(format!("verify command timed out after {timeout:?}"))
        } else {
            Outcome::fail(format!("verify command exited with code {}", result.exit_code))
        };

        outcome = outcome
            .with_context_update("outcome", if success { "success" } else { "fail" })
            .with_context_update("tool.exit_code", result.exit_code);
        context.apply_updates(outcome.context_updates.clone());
        Ok(outcome)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}
