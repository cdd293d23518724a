//! Builds a fan-out/fan-in graph with four branches and a `quorum` join
//! policy: `start -> fan[component] -> {b0,b1,b2,b3} -> fan_in[tripleoctagon]
//! -> exit`. One branch is wired to fail (`false`); the other three succeed,
//! so 3/4 clears the strict-majority quorum bar (2/4 would not).
//!
//! Run: `cargo run -p treadle-examples --example parallel_quorum`

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
    graph.add_node(start);

    let mut fan = Node::new("fan");
    fan.attrs.insert("shape".into(), "component".into());
    fan.attrs.insert("join_policy".into(), "quorum".into());
    fan.attrs.insert("max_parallel".into(), "4".into());
    graph.add_node(fan);

    for (i, ok) in [true, true, true, false].into_iter().enumerate() {
        let id = format!("b{i}");
        let mut branch = Node::new(id.as_str());
        branch.attrs.insert("type".into(), "tool".into());
        branch.attrs.insert("command".into(), if ok { "true".into() } else { "false".into() });
        graph.add_node(branch);
        graph.add_edge(Edge::new("fan", id.as_str()));
        graph.add_edge(Edge::new(id.as_str(), "fan_in"));
    }

    let mut fan_in = Node::new("fan_in");
    fan_in.attrs.insert("shape".into(), "tripleoctagon".into());
    graph.add_node(fan_in);

    let mut exit = Node::new("exit");
    exit.attrs.insert("shape".into(), "Msquare".into());
    graph.add_node(exit);

    graph.add_edge(Edge::new("start", "fan"));
    graph.add_edge(Edge::new("fan_in", "exit"));

    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Engine::new(
        graph,
        HandlerRegistry::with_defaults(),
        FsCheckpointStore::new(dir.path().join("checkpoints"), false),
        Arc::new(FsRunStore::new(dir.path().join("runs"))) as Arc<dyn RunEventStore>,
        Arc::new(FsArtifactStore::new(dir.path().join("artifacts"))),
    );

    let result = engine
        .run(CancelToken::new(), "demo-quorum".to_string(), Context::new())
        .await
        .expect("3/4 branches clears quorum");

    println!("final node: {}", result.final_node);
    println!("completed nodes: {:?}", result.completed_nodes);
}
