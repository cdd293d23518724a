//! Handler registry & dispatch: maps a node's resolved
//! [`NodeType`] to the handler that executes it, with fallback to `codergen`
//! and a decorator-unwrap accessor for wiring backends post-construction.

pub mod codergen;
pub mod conditional;
pub mod exit;
pub mod fan_in;
pub mod parallel;
pub mod stack_manager_loop;
pub mod start;
pub mod tool;
pub mod verify;
pub mod wait_human;

pub use codergen::CodergenHandler;
pub use conditional::ConditionalHandler;
pub use exit::ExitHandler;
pub use fan_in::ParallelFanInHandler;
pub use parallel::ParallelHandler;
pub use stack_manager_loop::StackManagerLoopHandler;
pub use start::StartHandler;
pub use tool::ToolHandler;
pub use verify::VerifyHandler;
pub use wait_human::WaitHumanHandler;

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::cancel::CancelToken;
use crate::context::Context;
use crate::graph::{resolve_node_type, Graph, Node};
use crate::interfaces::ArtifactStore;
use crate::outcome::Outcome;
use crate::retry::HandlerError;

/// The executor bound to a node's resolved type. Handlers are stateless with
/// respect to a single run — any mutable state (e.g. a wired backend) must be
/// interior-mutable, since the registry hands out shared `Arc<dyn Handler>`s.
#[async_trait]
pub trait Handler: Send + Sync {
    fn type_name(&self) -> &'static str;

    async fn execute(
        &self,
        cancel: CancelToken,
        graph: &Graph,
        node: &Node,
        context: &Context,
        artifacts: &dyn ArtifactStore,
    ) -> Result<Outcome, HandlerError>;

    /// Decorator unwrap: a handler wrapping another returns its wrapped
    /// handler here so wiring code can walk the chain to the concrete type
    /// that needs a backend installed.
    fn as_inner(&self) -> Option<&dyn Handler> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Walks `handler`'s decorator chain (via [`Handler::as_inner`]) looking for a
/// concrete `T`. Returns `None` if no layer downcasts to `T`.
pub fn downcast_through_decorators<T: 'static>(handler: &dyn Handler) -> Option<&T> {
    let mut current = handler;
    loop {
        if let Some(found) = current.as_any().downcast_ref::<T>() {
            return Some(found);
        }
        current = current.as_inner()?;
    }
}

/// Maps a type string to a handler, with `codergen` as the universal fallback.
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self { handlers: HashMap::new() }
    }

    /// Registers `handler` under its own `type_name()`. Re-registering the
    /// same type name replaces the previous handler.
    pub fn register(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.insert(handler.type_name().to_string(), handler);
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(type_name).cloned()
    }

    /// Resolves the handler for `node`: explicit `type`/`node_type` attribute →
    /// shape→type table → fallback `codergen` (via [`resolve_node_type`]),
    /// then a final fallback to the registered `codergen` handler if the
    /// resolved type string itself has no registered handler.
    pub fn resolve(&self, node: &Node) -> Option<Arc<dyn Handler>> {
        let node_type = resolve_node_type(node);
        self.handlers
            .get(node_type.as_str())
            .or_else(|| self.handlers.get("codergen"))
            .cloned()
    }

    /// A registry pre-populated with every built-in handler.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(StartHandler));
        registry.register(Arc::new(ExitHandler));
        registry.register(Arc::new(CodergenHandler::new()));
        registry.register(Arc::new(ConditionalHandler::new()));
        registry.register(Arc::new(ParallelHandler));
        registry.register(Arc::new(ParallelFanInHandler));
        registry.register(Arc::new(ToolHandler));
        registry.register(Arc::new(VerifyHandler));
        registry.register(Arc::new(WaitHumanHandler));
        registry.register(Arc::new(StackManagerLoopHandler::new()));
        registry
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
