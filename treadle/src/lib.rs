//! # Treadle
//!
//! A graph-driven pipeline runner for heterogeneous work nodes: LLM
//! coding-agent invocations, conditional gates, shell verifications, human
//! approvals, parallel fan-out/fan-in regions, and sub-pipeline inclusions.
//!
//! Treadle is the execution engine and its cooperating subsystems. It does
//! not parse the DOT-like textual surface, run concrete LLM/shell handler
//! bodies, or expose a CLI/HTTP surface — those are external collaborators
//! that plug into the typed interfaces in [`interfaces`]. What lives here is
//! everything downstream of a parsed, transformed [`graph::Graph`]:
//!
//! - [`graph`]: the in-memory graph model and shape→type resolution table.
//! - [`context`]: thread-safe shared run state plus an ordered log.
//! - [`fidelity`]: context compaction modes applied at each edge transition.
//! - [`transform`]: the pre-validation AST rewrite chain (sub-pipeline
//!   inlining, variable expansion, stylesheet application).
//! - [`handler`]: the handler registry and the built-in node handlers
//!   (`start`, `exit`, `codergen`, `conditional`, `parallel`,
//!   `parallel.fan_in`, `tool`, `verify`, `wait.human`,
//!   `stack.manager_loop`).
//! - [`dispatch`]: per-node handler resolution plus retry wrapping, shared by
//!   the main traversal and parallel branch sub-traversals.
//! - [`retry`]: backoff presets and regex-normalized failure-signature
//!   tracking for deterministic-failure detection.
//! - [`edge_select`]: the five-step outgoing-edge priority algorithm.
//! - [`parallel_exec`]: branch fan-out, bounded concurrency, join policies,
//!   and context merge.
//! - [`checkpoint`]: atomic checkpoint persistence and resume support.
//! - [`run_store`]: the append-only run/event store contract and filesystem
//!   implementation.
//! - [`watchdog`]: background stall detection.
//! - [`engine`]: the orchestrator tying every subsystem above into the
//!   PARSE → VALIDATE → PREFLIGHT → INITIALIZE → EXECUTE → FINALIZE
//!   lifecycle.
//! - [`interfaces`]: the external typed boundaries (parser, validator,
//!   codergen backend, interviewer, artifact store, event handler).
//! - [`cancel`]: a cooperative cancellation token propagated to every
//!   handler invocation and sub-traversal.
//! - [`outcome`]: the per-node execution result produced by handlers and
//!   consumed by the engine.
//! - [`error`]: the top-level error type returned by the engine's public
//!   entry points.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use treadle::cancel::CancelToken;
//! use treadle::checkpoint::FsCheckpointStore;
//! use treadle::context::Context;
//! use treadle::engine::Engine;
//! use treadle::graph::{Edge, Graph, Node};
//! use treadle::handler::HandlerRegistry;
//! use treadle::interfaces::FsArtifactStore;
//! use treadle::run_store::{FsRunStore, RunEventStore};
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut graph = Graph::new();
//! let mut start = Node::new("start");
//! start.attrs.insert("shape".into(), "Mdiamond".into());
//! let mut work = Node::new("work");
//! work.attrs.insert("type".into(), "tool".into());
//! work.attrs.insert("command".into(), "true".into());
//! let mut exit = Node::new("exit");
//! exit.attrs.insert("shape".into(), "Msquare".into());
//! graph.add_node(start);
//! graph.add_node(work);
//! graph.add_node(exit);
//! graph.add_edge(Edge::new("start", "work"));
//! graph.add_edge(Edge::new("work", "exit"));
//!
//! let dir = tempfile::tempdir().unwrap();
//! let engine = Engine::new(
//!     graph,
//!     HandlerRegistry::with_defaults(),
//!     FsCheckpointStore::new(dir.path().join("checkpoints"), false),
//!     Arc::new(FsRunStore::new(dir.path().join("runs"))) as Arc<dyn RunEventStore>,
//!     Arc::new(FsArtifactStore::new(dir.path().join("artifacts"))),
//! );
//!
//! let result = engine.run(CancelToken::new(), "run-1".to_string(), Context::new()).await.unwrap();
//! assert_eq!(result.final_node, "exit");
//! # }
//! ```

pub mod cancel;
pub mod checkpoint;
pub mod context;
pub mod dispatch;
pub mod edge_select;
pub mod engine;
pub mod error;
pub mod fidelity;
pub mod graph;
pub mod handler;
pub mod interfaces;
pub mod outcome;
pub mod parallel_exec;
pub mod retry;
pub mod run_store;
pub mod transform;
pub mod watchdog;

pub use cancel::CancelToken;
pub use context::Context;
pub use engine::{Engine, EngineResult};
pub use error::EngineError;
pub use graph::{resolve_node_type, Edge, Graph, Node, NodeType, Subgraph};
pub use outcome::{Outcome, Status};

/// Initializes tracing from `RUST_LOG` so unit and integration tests can
/// print logs with `--nocapture`.
#[cfg(test)]
mod test_logging {
    use ctor::ctor;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::Layer;

    #[ctor]
    fn init() {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_test_writer()
                    .with_filter(filter),
            )
            .try_init();
    }
}
