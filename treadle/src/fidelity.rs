//! Fidelity transformer: compacts context across a transition so downstream
//! handlers (and LLM prompts built from context) don't grow unbounded.

use std::collections::HashMap;

use serde_json::Value;

/// Keys the engine manages itself; re-injected after a non-full transform
/// in case the transform stripped them (compact drops `_`-prefixed keys).
pub const ENGINE_MANAGED_KEYS: &[&str] = &["_graph", "_workdir"];

const SUMMARY_LOW_WHITELIST: &[&str] = &["last_stage", "outcome", "goal", "error"];

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FidelityMode {
    Full,
    Truncate,
    Compact,
    SummaryLow,
    SummaryMedium,
    SummaryHigh,
}

impl FidelityMode {
    /// Parses the wire string for a mode. Unknown strings return `None`, which
    /// callers treat as "absent" when walking the precedence chain.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "full" => Some(FidelityMode::Full),
            "truncate" => Some(FidelityMode::Truncate),
            "compact" => Some(FidelityMode::Compact),
            "summary:low" => Some(FidelityMode::SummaryLow),
            "summary:medium" => Some(FidelityMode::SummaryMedium),
            "summary:high" => Some(FidelityMode::SummaryHigh),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FidelityMode::Full => "full",
            FidelityMode::Truncate => "truncate",
            FidelityMode::Compact => "compact",
            FidelityMode::SummaryLow => "summary:low",
            FidelityMode::SummaryMedium => "summary:medium",
            FidelityMode::SummaryHigh => "summary:high",
        }
    }

    pub fn is_full(&self) -> bool {
        matches!(self, FidelityMode::Full)
    }
}

/// Resolves the active mode for a transition: edge attribute → target-node
/// attribute → graph default → hardcoded default (`compact`). An invalid
/// string at any level is treated as absent and falls through to the next.
pub fn resolve_mode(
    edge_fidelity: Option<&str>,
    node_fidelity: Option<&str>,
    graph_default_fidelity: Option<&str>,
) -> FidelityMode {
    edge_fidelity
        .and_then(FidelityMode::parse)
        .or_else(|| node_fidelity.and_then(FidelityMode::parse))
        .or_else(|| graph_default_fidelity.and_then(FidelityMode::parse))
        .unwrap_or(FidelityMode::Compact)
}

/// Tunable thresholds for the compact/truncate/summary:high transforms.
#[derive(Clone, Copy, Debug)]
pub struct FidelityLimits {
    pub truncate_keep_n: usize,
    pub compact_string_threshold: usize,
    pub compact_keep_log_k: usize,
    pub summary_high_string_threshold: usize,
}

impl Default for FidelityLimits {
    fn default() -> Self {
        Self {
            truncate_keep_n: 50,
            compact_string_threshold: 1024,
            compact_keep_log_k: 20,
            summary_high_string_threshold: 500,
        }
    }
}

/// Output of applying a fidelity mode to a context snapshot.
pub struct Transformed {
    pub values: HashMap<String, Value>,
    pub logs: Vec<String>,
    pub preamble: String,
}

/// Applies `mode` to `values`/`logs`, returning the transformed state and a
/// preamble sentence describing what happened. `prev_label` names the node the
/// context is transitioning from, for the preamble text.
pub fn apply(
    mode: FidelityMode,
    values: &HashMap<String, Value>,
    logs: &[String],
    limits: FidelityLimits,
    prev_label: &str,
) -> Transformed {
    if mode.is_full() {
        return Transformed {
            values: values.clone(),
            logs: logs.to_vec(),
            preamble: String::new(),
        };
    }

    let before = values.len();
    let mut out = match mode {
        FidelityMode::Full => unreachable!(),
        FidelityMode::Truncate => truncate(values, limits.truncate_keep_n),
        FidelityMode::Compact => compact(values, limits.compact_string_threshold),
        FidelityMode::SummaryLow => summary_low(values),
        FidelityMode::SummaryMedium => summary_medium(values),
        FidelityMode::SummaryHigh => summary_high(values, limits.summary_high_string_threshold),
    };

    for key in ENGINE_MANAGED_KEYS {
        if let Some(v) = values.get(*key) {
            out.entry(key.to_string()).or_insert_with(|| v.clone());
        }
    }

    let out_logs = if mode == FidelityMode::Compact {
        let keep = limits.compact_keep_log_k;
        logs.iter().rev().take(keep).rev().cloned().collect()
    } else {
        logs.to_vec()
    };

    let removed = before.saturating_sub(out.len());
    let preamble = format!("Context from {prev_label} was compacted; {removed} keys removed.");

    Transformed {
        values: out,
        logs: out_logs,
        preamble,
    }
}

fn truncate(values: &HashMap<String, Value>, keep_n: usize) -> HashMap<String, Value> {
    let mut keys: Vec<&String> = values.keys().collect();
    keys.sort();
    keys.into_iter()
        .take(keep_n)
        .map(|k| (k.clone(), values[k].clone()))
        .collect()
}

fn compact(values: &HashMap<String, Value>, string_threshold: usize) -> HashMap<String, Value> {
    values
        .iter()
        .filter(|(k, _)| !k.starts_with('_'))
        .map(|(k, v)| (k.clone(), truncate_long_strings(v, string_threshold)))
        .collect()
}

fn summary_low(values: &HashMap<String, Value>) -> HashMap<String, Value> {
    values
        .iter()
        .filter(|(k, _)| SUMMARY_LOW_WHITELIST.contains(&k.as_str()))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn summary_medium(values: &HashMap<String, Value>) -> HashMap<String, Value> {
    values
        .iter()
        .filter(|(k, _)| {
            if k.starts_with('_') {
                return false;
            }
            SUMMARY_LOW_WHITELIST.contains(&k.as_str()) || {
                let lower = k.to_ascii_lowercase();
                lower.contains("result") || lower.contains("output") || lower.contains("status")
            }
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

fn summary_high(values: &HashMap<String, Value>, string_threshold: usize) -> HashMap<String, Value> {
    values
        .iter()
        .map(|(k, v)| (k.clone(), truncate_long_strings(v, string_threshold)))
        .collect()
}

fn truncate_long_strings(value: &Value, threshold: usize) -> Value {
    match value {
        Value::String(s) if s.len() > threshold => Value::String("[truncated]".to_string()),
        other => other.clone(),
    }
}
