//! The run's entry point: shape `Mdiamond`, stamps the run
//! start time and otherwise passes through unconditionally.

use async_trait::async_trait;

use super::Handler;
use crate::cancel::CancelToken;
use crate::context::Context;
use crate::graph::{Graph, Node};
use crate::interfaces::ArtifactStore;
use crate::outcome::Outcome;
use crate::retry::HandlerError;

pub struct StartHandler;

#[async_trait]
impl Handler for StartHandler {
    fn type_name(&self) -> &'static str {
        "start"
    }

    async fn execute(
        &self,
        _cancel: CancelToken,
        _graph: &Graph,
        _node: &Node,
        context: &Context,
        _artifacts: &dyn ArtifactStore,
    ) -> Result<Outcome, HandlerError> {
        if !context.contains_key("_start_time") {
            context.set("_start_time", chrono::Utc::now().to_rfc3339());
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

    /// **Scenario**: the start handler records a _start_time once and never overwrites it.
    #[tokio::test]
    async fn records_start_time_once() {
        let handler = StartHandler;
        let graph = Graph::new();
        let node = Node::new("begin");
        let context = Context::new();
        let artifacts = FsArtifactStore::new(std::env::temp_dir());

        let outcome = handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await
            .unwrap();
        assert!(outcome.status() == crate::outcome::Status::Success);
        let first = context.get("_start_time").unwrap();

        handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await
            .unwrap();
        assert_eq!(context.get("_start_time").unwrap(), first);
    }
}
