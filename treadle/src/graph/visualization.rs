//! Graph visualization utilities.
//!
//! Exports a [`Graph`] to Graphviz DOT format, or to a short plain-text summary,
//! for debugging and for the `--dry-run` / preflight diagnostics path. These are
//! read-only views: neither function touches execution state.

use std::fmt::Write as _;

use super::model::Graph;
use super::node_type::resolve_node_type;

/// Generates a Graphviz DOT representation of `graph`.
///
/// Node labels include the resolved [`NodeType`](super::NodeType) so a rendered
/// graph shows dispatch behavior, not just the raw shape attribute.
pub fn generate_dot(graph: &Graph) -> String {
    let mut dot = String::from("digraph {\n");
    dot.push_str("  rankdir=LR;\n\n");

    for id in graph.node_ids_sorted() {
        let node = graph.nodes.get(id).expect("id came from nodes map");
        let kind = resolve_node_type(node).as_str();
        let shape = node.attr_or("shape", "box");
        let _ = writeln!(
            dot,
            "  \"{id}\" [label=\"{id}\\n({kind})\", shape={shape}];"
        );
    }

    dot.push('\n');
    for edge in &graph.edges {
        match edge.attr("condition") {
            Some(cond) => {
                let _ = writeln!(dot, "  \"{}\" -> \"{}\" [label=\"{}\"];", edge.from, edge.to, cond);
            }
            None => {
                let _ = writeln!(dot, "  \"{}\" -> \"{}\";", edge.from, edge.to);
            }
        }
    }

    dot.push_str("}\n");
    dot
}

/// Generates a short plain-text summary: node count, edge count, and the
/// resolved start/exit node ids, if any.
pub fn generate_text(graph: &Graph) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "Graph Structure:");
    let _ = writeln!(text, "Nodes: {}", graph.nodes.len());
    let _ = writeln!(text, "Edges: {}", graph.edges.len());

    match graph.find_start() {
        Some(n) => {
            let _ = writeln!(text, "Start: {}", n.id);
        }
        None => {
            let _ = writeln!(text, "Start: <none>");
        }
    }
    match graph.find_exit() {
        Some(n) => {
            let _ = writeln!(text, "Exit: {}", n.id);
        }
        None => {
            let _ = writeln!(text, "Exit: <none>");
        }
    }

    let _ = writeln!(text, "\nNodes:");
    for id in graph.node_ids_sorted() {
        let node = graph.nodes.get(id).expect("id came from nodes map");
        let kind = resolve_node_type(node).as_str();
        let _ = writeln!(text, "  {id} ({kind})");
    }

    text
}

#[cfg(test)]
mod tests {
    use super::super::model::{Edge, Node};
    use super::*;

    fn sample_graph() -> Graph {
        let mut g = Graph::new();
        let mut start = Node::new("entry");
        start.attrs.insert("shape".into(), "Mdiamond".into());
        let mut exit = Node::new("done");
        exit.attrs.insert("shape".into(), "Msquare".into());
        g.add_node(start);
        g.add_node(Node::new("build"));
        g.add_node(exit);
        g.add_edge(Edge::new("entry", "build"));
        g.add_edge(Edge::new("build", "done"));
        g
    }

    /// **Scenario**: generate_dot emits valid-looking digraph syntax with every node and edge.
    #[test]
    fn generate_dot_includes_all_nodes_and_edges() {
        let dot = generate_dot(&sample_graph());
        assert!(dot.starts_with("digraph {"));
        assert!(dot.contains("\"entry\""));
        assert!(dot.contains("\"build\""));
        assert!(dot.contains("\"done\""));
        assert!(dot.contains("\"entry\" -> \"build\""));
        assert!(dot.contains("\"build\" -> \"done\""));
    }

    /// **Scenario**: generate_text reports the resolved start and exit nodes.
    #[test]
    fn generate_text_reports_start_and_exit() {
        let text = generate_text(&sample_graph());
        assert!(text.contains("Start: entry"));
        assert!(text.contains("Exit: done"));
        assert!(text.contains("Nodes: 3"));
        assert!(text.contains("Edges: 2"));
    }
}
