//! Builds the literal simple-linear graph by hand (`start[Mdiamond] -> work[box]
//! -> exit[Msquare]`) and runs it to completion with the built-in `tool`
//! handler standing in for a codergen node.
//!
//! Run: `cargo run -p treadle-examples --example linear_pipeline`

use std::sync::Arc;

use treadle::cancel::CancelToken;
use treadle::checkpoint::FsCheckpointStore;
use treadle::context::Context;
use treadle::engine::Engine;
use treadle::graph::{Edge, Graph, Node};
use treadle::handler::HandlerRegistry;
use treadle::interfaces::FsArtifactStore;
use treadle::run_store::{FsRunStore, RunEventStore};

#[tokio::main]
async fn main() {
    let mut graph = Graph::new();

    let mut start = Node::new("start");
    start.attrs.insert("shape".into(), "Mdiamond".into());

    let mut work = Node::new("work");
    work.attrs.insert("type".into(), "tool".into());
    work.attrs.insert("command".into(), "echo hello from work".into());

    let mut exit = Node::new("exit");
    exit.attrs.insert("shape".into(), "Msquare".into());

    graph.add_node(start);
    graph.add_node(work);
    graph.add_node(exit);
    graph.add_edge(Edge::new("start", "work"));
    graph.add_edge(Edge::new("work", "exit"));

    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Engine::new(
        graph,
        HandlerRegistry::with_defaults(),
        FsCheckpointStore::new(dir.path().join("checkpoints"), false),
        Arc::new(FsRunStore::new(dir.path().join("runs"))) as Arc<dyn RunEventStore>,
        Arc::new(FsArtifactStore::new(dir.path().join("artifacts"))),
    );

    let result = engine
        .run(CancelToken::new(), "demo-linear".to_string(), Context::new())
        .await
        .expect("run should complete");

    println!("final node: {}", result.final_node);
    println!("final outcome: {}", result.final_outcome);
    println!("completed nodes: {:?}", result.completed_nodes);
}
