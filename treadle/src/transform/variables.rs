//! Variable expansion: replaces `$key` occurrences inside node attribute
//! values with the corresponding graph-level attribute.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{GraphTransform, TransformError};
use crate::graph::Graph;

static VARIABLE_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)").expect("variable reference regex is valid"));

/// Replaces every `$key` in a node attribute value with `graph.graph_attrs[key]`.
/// An undefined `$key` is left verbatim — the caller sees exactly what it wrote.
pub struct VariableExpansion;

fn expand(value: &str, graph_attrs: &std::collections::HashMap<String, String>) -> String {
    VARIABLE_REF
        .replace_all(value, |caps: &regex::Captures| {
            let key = &caps[1];
            match graph_attrs.get(key) {
                Some(v) => v.clone(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

impl GraphTransform for VariableExpansion {
    fn name(&self) -> &str {
        "variable_expansion"
    }

    fn apply(&self, mut graph: Graph) -> Result<Graph, TransformError> {
        let graph_attrs = graph.graph_attrs.clone();
        for node in graph.nodes.values_mut() {
            for value in node.attrs.values_mut() {
                *value = expand(value, &graph_attrs);
            }
        }
        for edge in graph.edges.iter_mut() {
            for value in edge.attrs.values_mut() {
                *value = expand(value, &graph_attrs);
            }
        }
        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;

    /// **Scenario**: a defined $key is substituted with its graph-level attribute value.
    #[test]
    fn substitutes_defined_variable() {
        let mut graph = Graph::new();
        graph.graph_attrs.insert("model".into(), "gpt-4".into());
        let mut n = Node::new("work");
        n.attrs.insert("llm_model".into(), "$model".into());
        graph.add_node(n);

        let out = VariableExpansion.apply(graph).unwrap();
        assert_eq!(out.find_node("work").unwrap().attr("llm_model"), Some("gpt-4"));
    }

    /// **Scenario**: an undefined $key is left verbatim.
    #[test]
    fn leaves_undefined_variable_verbatim() {
        let mut graph = Graph::new();
        let mut n = Node::new("work");
        n.attrs.insert("llm_model".into(), "$unset_model".into());
        graph.add_node(n);

        let out = VariableExpansion.apply(graph).unwrap();
        assert_eq!(out.find_node("work").unwrap().attr("llm_model"), Some("$unset_model"));
    }

    /// **Scenario**: multiple variable references in one value are each substituted.
    #[test]
    fn substitutes_multiple_references() {
        let mut graph = Graph::new();
        graph.graph_attrs.insert("base".into(), "https://api".into());
        graph.graph_attrs.insert("region".into(), "us".into());
        let mut n = Node::new("work");
        n.attrs.insert("base_url".into(), "$base/$region/v1".into());
        graph.add_node(n);

        let out = VariableExpansion.apply(graph).unwrap();
        assert_eq!(out.find_node("work").unwrap().attr("base_url"), Some("https://api/us/v1"));
    }
}
