//! Shape → type resolution: how a bare DOT-like node becomes a dispatchable [`NodeType`].

use super::model::Node;

/// The dispatchable kind of a node, resolved from its `type`/`node_type` attribute
/// or, failing that, from its `shape` attribute via the table below.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeType {
    Start,
    Exit,
    Codergen,
    Conditional,
    Parallel,
    ParallelFanIn,
    Tool,
    Verify,
    StackManagerLoop,
    WaitHuman,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Start => "start",
            NodeType::Exit => "exit",
            NodeType::Codergen => "codergen",
            NodeType::Conditional => "conditional",
            NodeType::Parallel => "parallel",
            NodeType::ParallelFanIn => "parallel.fan_in",
            NodeType::Tool => "tool",
            NodeType::Verify => "verify",
            NodeType::StackManagerLoop => "stack.manager_loop",
            NodeType::WaitHuman => "wait.human",
        }
    }

    fn from_explicit(value: &str) -> Option<Self> {
        match value {
            "start" => Some(NodeType::Start),
            "exit" => Some(NodeType::Exit),
            "codergen" => Some(NodeType::Codergen),
            "conditional" => Some(NodeType::Conditional),
            "parallel" => Some(NodeType::Parallel),
            "parallel.fan_in" => Some(NodeType::ParallelFanIn),
            "tool" => Some(NodeType::Tool),
            "verify" => Some(NodeType::Verify),
            "stack.manager_loop" => Some(NodeType::StackManagerLoop),
            "wait.human" => Some(NodeType::WaitHuman),
            _ => None,
        }
    }

    fn from_shape(shape: &str) -> Self {
        match shape {
            "Mdiamond" => NodeType::Start,
            "Msquare" => NodeType::Exit,
            "box" => NodeType::Codergen,
            "diamond" => NodeType::Conditional,
            "component" => NodeType::Parallel,
            "tripleoctagon" => NodeType::ParallelFanIn,
            "parallelogram" => NodeType::Tool,
            "octagon" => NodeType::Verify,
            "house" => NodeType::StackManagerLoop,
            "hexagon" => NodeType::WaitHuman,
            _ => NodeType::Codergen,
        }
    }
}

/// Resolves a node's dispatchable type.
///
/// An explicit `type` or `node_type` attribute always wins, even when it
/// disagrees with `shape` — the shape table is a convenience default for
/// graphs authored by hand-drawing tools, not a constraint on explicit intent.
/// A node with neither an explicit type nor a recognized shape falls back to
/// `codergen`, the same default an unadorned `box` would get.
pub fn resolve_node_type(node: &Node) -> NodeType {
    if let Some(explicit) = node.attr("type").or_else(|| node.attr("node_type")) {
        if let Some(t) = NodeType::from_explicit(explicit) {
            return t;
        }
    }
    match node.attr("shape") {
        Some(shape) => NodeType::from_shape(shape),
        None => NodeType::Codergen,
    }
}
