//! In-memory graph: nodes, edges, subgraphs. Immutable after the transform chain runs.

use std::collections::HashMap;

/// A single work node: a string id plus an attribute-name → string-value map.
///
/// Node type is not stored directly; it is resolved from `shape`/`type` via
/// [`crate::graph::resolve_node_type`] at dispatch time, not at construction time,
/// so a transform (e.g. the stylesheet) can still change attributes beforehand.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub attrs: HashMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attrs: HashMap::new(),
        }
    }

    /// Attribute value, or `None` if absent.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    /// Attribute value, or `default` if absent.
    pub fn attr_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.attr(name).unwrap_or(default)
    }

    /// Parses an attribute as the given type, falling back to `default` when
    /// absent or unparsable. Used for `weight`, `max_retries`, `timeout`, etc.
    pub fn attr_parsed<T: std::str::FromStr>(&self, name: &str, default: T) -> T {
        self.attr(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn attr_bool(&self, name: &str, default: bool) -> bool {
        match self.attr(name) {
            Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
            None => default,
        }
    }
}

/// One directed transition between two nodes, carrying its own attribute map.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Edge {
    pub from: String,
    pub to: String,
    pub attrs: HashMap<String, String>,
}

impl Edge {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            attrs: HashMap::new(),
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs.get(name).map(String::as_str)
    }

    pub fn attr_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.attr(name).unwrap_or(default)
    }

    /// Integer weight attribute, default 0.
    pub fn weight(&self) -> i64 {
        self.attr_parsed("weight", 0)
    }

    pub fn attr_parsed<T: std::str::FromStr>(&self, name: &str, default: T) -> T {
        self.attr(name)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn attr_bool(&self, name: &str, default: bool) -> bool {
        match self.attr(name) {
            Some(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
            None => default,
        }
    }
}

/// A named, scoped collection of member node ids with its own attribute defaults.
///
/// A subgraph's (lower-cased, hyphenated) name feeds the `class` attribute of
/// each member during parsing, which in turn drives
/// stylesheet selector matching in the transform chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Subgraph {
    pub name: String,
    pub members: Vec<String>,
    pub node_defaults: HashMap<String, String>,
    pub attrs: HashMap<String, String>,
}

/// Named collection of nodes keyed by unique id, an ordered sequence of edges,
/// three attribute maps (graph/node-default/edge-default), and an ordered list
/// of subgraphs. Immutable after validation.
#[derive(Clone, Debug, Default)]
pub struct Graph {
    pub nodes: HashMap<String, Node>,
    pub edges: Vec<Edge>,
    pub graph_attrs: HashMap<String, String>,
    pub node_defaults: HashMap<String, String>,
    pub edge_defaults: HashMap<String, String>,
    pub subgraphs: Vec<Subgraph>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: Node) {
        self.nodes.insert(node.id.clone(), node);
    }

    pub fn add_edge(&mut self, edge: Edge) {
        self.edges.push(edge);
    }

    /// Looks up a node by id.
    pub fn find_node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    /// Graph-level attribute, falling back to nothing (graph attrs have no parent scope).
    pub fn graph_attr(&self, name: &str) -> Option<&str> {
        self.graph_attrs.get(name).map(String::as_str)
    }

    /// Outgoing edges from `id`, in declaration order.
    pub fn outgoing_edges(&self, id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.from == id).collect()
    }

    /// Incoming edges to `id`, in declaration order.
    pub fn incoming_edges(&self, id: &str) -> Vec<&Edge> {
        self.edges.iter().filter(|e| e.to == id).collect()
    }

    /// The run's start node: shape `Mdiamond`, or `type`/`node_type` == `"start"`.
    pub fn find_start(&self) -> Option<&Node> {
        self.node_ids_sorted()
            .into_iter()
            .find_map(|id| self.nodes.get(id))
            .into_iter()
            .chain(self.nodes.values())
            .find(|n| is_marked(n, "Mdiamond", "start"))
    }

    /// The run's terminal node: shape `Msquare`, or `type`/`node_type` == `"exit"`.
    pub fn find_exit(&self) -> Option<&Node> {
        self.nodes.values().find(|n| is_marked(n, "Msquare", "exit"))
    }

    /// All node ids, lexicographically sorted — the engine's one source of
    /// deterministic iteration order over the node map.
    pub fn node_ids_sorted(&self) -> Vec<&String> {
        let mut ids: Vec<&String> = self.nodes.keys().collect();
        ids.sort();
        ids
    }
}

fn is_marked(node: &Node, shape: &str, type_name: &str) -> bool {
    if node.attr("shape") == Some(shape) {
        return true;
    }
    matches!(node.attr("type"), Some(t) if t.eq_ignore_ascii_case(type_name))
        || matches!(node.attr("node_type"), Some(t) if t.eq_ignore_ascii_case(type_name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node_with(id: &str, attrs: &[(&str, &str)]) -> Node {
        let mut n = Node::new(id);
        for (k, v) in attrs {
            n.attrs.insert(k.to_string(), v.to_string());
        }
        n
    }

    /// **Scenario**: outgoing_edges preserves declaration order, not sorted order.
    #[test]
    fn outgoing_edges_preserves_declaration_order() {
        let mut g = Graph::new();
        g.add_edge(Edge::new("a", "z"));
        g.add_edge(Edge::new("a", "b"));
        let out = g.outgoing_edges("a");
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].to, "z");
        assert_eq!(out[1].to, "b");
    }

    /// **Scenario**: find_start recognizes shape Mdiamond as well as explicit type=start.
    #[test]
    fn find_start_recognizes_shape_and_explicit_type() {
        let mut g = Graph::new();
        g.add_node(node_with("entry", &[("shape", "Mdiamond")]));
        assert_eq!(g.find_start().map(|n| n.id.as_str()), Some("entry"));

        let mut g2 = Graph::new();
        g2.add_node(node_with("kickoff", &[("type", "start")]));
        assert_eq!(g2.find_start().map(|n| n.id.as_str()), Some("kickoff"));
    }

    /// **Scenario**: node_ids_sorted is deterministic regardless of insertion order.
    #[test]
    fn node_ids_sorted_is_deterministic() {
        let mut g = Graph::new();
        g.add_node(Node::new("c"));
        g.add_node(Node::new("a"));
        g.add_node(Node::new("b"));
        assert_eq!(g.node_ids_sorted(), vec!["a", "b", "c"]);
    }

    /// **Scenario**: weight defaults to 0 when the attribute is absent or unparsable.
    #[test]
    fn edge_weight_defaults_to_zero() {
        let e = Edge::new("a", "b");
        assert_eq!(e.weight(), 0);
        let mut e2 = Edge::new("a", "b");
        e2.attrs.insert("weight".into(), "not-a-number".into());
        assert_eq!(e2.weight(), 0);
    }
}
