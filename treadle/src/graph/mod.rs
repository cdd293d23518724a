//! Graph model: nodes, edges, subgraphs, and the shape→type resolution table.
//!
//! A [`Graph`] is an immutable, in-memory representation of a parsed and
//! transformed pipeline. It owns no execution state; [`crate::engine::Engine`]
//! traverses it read-only.

mod model;
mod node_type;
mod visualization;

pub use model::{Edge, Graph, Node, Subgraph};
pub use node_type::{resolve_node_type, NodeType};
pub use visualization::{generate_dot, generate_text};
