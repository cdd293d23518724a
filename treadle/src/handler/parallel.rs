//! Fan-out declaration: reads the parallel node's own
//! outgoing edges as branch roots and stashes the branch config into context
//! under `parallel.*` for the engine to pick up and hand to the parallel
//! executor. This handler never runs a branch itself.

use async_trait::async_trait;
use serde_json::json;

use super::Handler;
use crate::cancel::CancelToken;
use crate::context::Context;
use crate::graph::{Graph, Node};
use crate::interfaces::ArtifactStore;
use crate::outcome::Outcome;
use crate::retry::HandlerError;

pub struct ParallelHandler;

#[async_trait]
impl Handler for ParallelHandler {
    fn type_name(&self) -> &'static str {
        "parallel"
    }

    async fn execute(
        &self,
        _cancel: CancelToken,
        graph: &Graph,
        node: &Node,
        context: &Context,
        _artifacts: &dyn ArtifactStore,
    ) -> Result<Outcome, HandlerError> {
        let branches: Vec<String> = graph.outgoing_edges(&node.id).into_iter().map(|e| e.to.clone()).collect();
        if branches.is_empty() {
            return Err(HandlerError::new(format!("parallel node {} has no outgoing edges to fan out to", node.id)));
        }

        context.set("parallel.branches", json!(branches));
        context.set("parallel.max_parallel", json!(node.attr_parsed("max_parallel", 4u32)));
        context.set("parallel.join_policy", json!(node.attr_or("join_policy", "wait_all")));
        context.set("parallel.error_policy", json!(node.attr_or("error_policy", "continue")));
        if let Some(k) = node.attr("k_required") {
            context.set("parallel.k_required", json!(k.parse::<u32>().unwrap_or(branches.len() as u32)));
        }

        Ok(Outcome::success())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::FsArtifactStore;
    use crate::graph::Edge;

    /// **Scenario**: the parallel node's outgoing edge targets become parallel.branches.
    #[tokio::test]
    async fn writes_branch_targets_from_outgoing_edges() {
        let handler = ParallelHandler;
        let mut graph = Graph::new();
        graph.add_node(Node::new("fan"));
        graph.add_edge(Edge::new("fan", "b0"));
        graph.add_edge(Edge::new("fan", "b1"));
        let mut node = Node::new("fan");
        node.attrs.insert("join_policy".into(), "quorum".into());
        let context = Context::new();
        let artifacts = FsArtifactStore::new(std::env::temp_dir());

        handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await
            .unwrap();
        assert_eq!(context.get("parallel.branches"), Some(json!(["b0", "b1"])));
        assert_eq!(context.get("parallel.join_policy"), Some(json!("quorum")));
    }

    /// **Scenario**: a parallel node with no outgoing edges is a handler error.
    #[tokio::test]
    async fn no_outgoing_edges_errors() {
        let handler = ParallelHandler;
        let graph = Graph::new();
        let node = Node::new("fan");
        let context = Context::new();
        let artifacts = FsArtifactStore::new(std::env::temp_dir());

        let result = handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await;
        assert!(result.is_err());
    }
}
