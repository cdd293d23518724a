//! Edge selector: picks the next edge to follow after a node executes.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::context::Context;
use crate::graph::{Edge, Graph};
use crate::outcome::Outcome;

static ACCELERATOR_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\[\w\]|\w\)|\w\s*-)\s*").expect("accelerator prefix regex is valid"));

/// Normalizes an edge label for comparison against `outcome.preferred_label`:
/// trim, lowercase, then strip one leading accelerator prefix (`[X]`, `X)`, `X -`).
pub fn normalize_label(label: &str) -> String {
    let trimmed = label.trim();
    let stripped = ACCELERATOR_PREFIX.replace(trimmed, "");
    stripped.trim().to_ascii_lowercase()
}

/// Resolves the value of a condition-language key against the outcome and context.
fn resolve_key(key: &str, outcome: &Outcome, context: &Context) -> String {
    match key {
        "outcome" => outcome.status().as_str().to_string(),
        "preferred_label" => outcome.preferred_label.clone().unwrap_or_default(),
        _ => {
            if let Some(suffix) = key.strip_prefix("context.") {
                if let Some(v) = context.get(key) {
                    return stringify(&v);
                }
                context
                    .get(suffix)
                    .map(|v| stringify(&v))
                    .unwrap_or_default()
            } else {
                context.get(key).map(|v| stringify(&v)).unwrap_or_default()
            }
        }
    }
}

fn stringify(v: &serde_json::Value) -> String {
    match v {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Evaluates one `key op literal` term.
fn eval_term(term: &str, outcome: &Outcome, context: &Context) -> bool {
    let term = term.trim();
    if term.is_empty() {
        return true;
    }
    let (key, op, literal) = if let Some(idx) = term.find("!=") {
        (term[..idx].trim(), false, term[idx + 2..].trim())
    } else if let Some(idx) = term.find('=') {
        (term[..idx].trim(), true, term[idx + 1..].trim())
    } else {
        // Malformed term with no operator: treat as always-false rather than panic.
        return false;
    };

    let actual = resolve_key(key, outcome, context);
    let equal = actual.eq_ignore_ascii_case(literal);
    if op {
        equal
    } else {
        !equal
    }
}

/// Evaluates the condition mini-language: `term (&& term)*`, left-to-right
/// short-circuit. Empty or whitespace-only input evaluates true.
pub fn evaluate_condition(condition: &str, outcome: &Outcome, context: &Context) -> bool {
    if condition.trim().is_empty() {
        return true;
    }
    condition
        .split("&&")
        .all(|term| eval_term(term, outcome, context))
}

/// Chooses the next edge to follow, or `None` if no rule matches (a dead end
/// for `fail` outcomes, or a natural end of traversal otherwise).
pub fn select_edge<'a>(graph: &'a Graph, node_id: &str, outcome: &Outcome, context: &Context) -> Option<&'a Edge> {
    let candidates = graph.outgoing_edges(node_id);

    // 1. Condition match.
    let mut matched: Vec<&Edge> = candidates
        .iter()
        .copied()
        .filter(|e| {
            let cond = e.attr("condition").unwrap_or("");
            !cond.is_empty() && evaluate_condition(cond, outcome, context)
        })
        .collect();
    if !matched.is_empty() {
        matched.sort_by(|a, b| b.weight().cmp(&a.weight()).then_with(|| a.to.cmp(&b.to)));
        return matched.into_iter().next();
    }

    // 2. Preferred label.
    if let Some(label) = outcome.preferred_label.as_deref().filter(|l| !l.is_empty()) {
        let normalized = normalize_label(label);
        if let Some(edge) = candidates
            .iter()
            .copied()
            .find(|e| normalize_label(e.attr_or("label", "")) == normalized)
        {
            return Some(edge);
        }
    }

    // 3. Suggested next ids.
    if !outcome.suggested_next_ids.is_empty() {
        if let Some(edge) = candidates
            .iter()
            .copied()
            .find(|e| outcome.suggested_next_ids.iter().any(|id| id == &e.to))
        {
            return Some(edge);
        }
    }

    // 4. Unconditional + weight + lexical (only for non-fail outcomes).
    if !outcome.is_fail() {
        let mut unconditional: Vec<&Edge> = candidates
            .iter()
            .copied()
            .filter(|e| e.attr("condition").unwrap_or("").is_empty())
            .collect();
        if !unconditional.is_empty() {
            unconditional.sort_by(|a, b| b.weight().cmp(&a.weight()).then_with(|| a.to.cmp(&b.to)));
            return unconditional.into_iter().next();
        }
    }

    // 5. No match.
    None
}
