//! Per-node dispatch: handler resolution plus retry wrapping. Shared by the
//! main traversal and the parallel executor's branch sub-traversals so both
//! dispatch nodes exactly the same way.

use crate::cancel::CancelToken;
use crate::context::Context;
use crate::graph::{Graph, Node};
use crate::handler::HandlerRegistry;
use crate::interfaces::ArtifactStore;
use crate::outcome::Outcome;
use crate::retry::{execute_with_retry, FailureTracker, HandlerError, RetryPolicy};

const DEFAULT_MAX_RETRIES: u32 = 5;

/// Resolves `node`'s handler (loud error if the registry has no match at all,
/// which should not happen given the `codergen` fallback) and runs it under
/// the retry policy resolved from node attrs → graph default → engine default.
/// Every handler error observed is recorded in `failure_tracker` for
/// deterministic-failure detection across attempts. Returns the number of
/// attempts made alongside the outcome, for checkpoint retry-count bookkeeping.
pub async fn dispatch_node(
    cancel: CancelToken,
    graph: &Graph,
    node: &Node,
    context: &Context,
    artifacts: &dyn ArtifactStore,
    registry: &HandlerRegistry,
    failure_tracker: &FailureTracker,
) -> Result<(Outcome, u32), HandlerError> {
    let handler = registry
        .resolve(node)
        .ok_or_else(|| HandlerError::new(format!("no handler resolved for node {}", node.id)))?;

    let policy = resolve_retry_policy(node, graph);
    let allow_partial = node.attr_bool("allow_partial", false);

    let (outcome, attempts) = execute_with_retry(&policy, &cancel, allow_partial, |_attempt| {
        let cancel = cancel.child_token();
        let handler = handler.clone();
        async move {
            let result = handler.execute(cancel, graph, node, context, artifacts).await;
            if let Err(ref e) = result {
                failure_tracker.record(&e.0);
            }
            result
        }
    })
    .await;

    Ok((outcome, attempts))
}

/// retry_policy attr (preset name) wins outright; otherwise a max-attempts
/// budget from node `max_retries` → graph `max_retries` → the engine default,
/// layered over the standard preset's backoff.
fn resolve_retry_policy(node: &Node, graph: &Graph) -> RetryPolicy {
    if let Some(name) = node.attr("retry_policy") {
        return RetryPolicy::by_name(name);
    }
    let graph_default: u32 = graph
        .graph_attr("max_retries")
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_MAX_RETRIES);
    let max_retries = node.attr_parsed("max_retries", graph_default);
    RetryPolicy::with_max_attempts(max_retries.max(1))
}
