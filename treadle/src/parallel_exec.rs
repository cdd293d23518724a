//! Parallel executor: branch fan-out with bounded
//! concurrency, four join policies, error-policy-driven cancellation, and
//! context merge with conflict logging and an artifact manifest.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::cancel::CancelToken;
use crate::context::Context;
use crate::dispatch::dispatch_node;
use crate::edge_select::select_edge;
use crate::graph::{resolve_node_type, Graph, NodeType};
use crate::handler::HandlerRegistry;
use crate::interfaces::ArtifactStore;
use crate::outcome::Outcome;
use crate::retry::FailureTracker;

#[derive(Debug, Error)]
pub enum ParallelError {
    #[error("parallel join policy {policy} failed: {succeeded}/{total} branches succeeded (required {required})")]
    PolicyFailed {
        policy: String,
        succeeded: usize,
        total: usize,
        required: usize,
    },
    #[error("parallel node has no branch roots")]
    NoBranches,
}

/// The rule for deciding whether a parallel region as a whole succeeded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JoinPolicy {
    WaitAll,
    WaitAny,
    KOfN,
    Quorum,
}

impl JoinPolicy {
    pub fn parse(s: &str) -> Self {
        match s {
            "wait_any" => JoinPolicy::WaitAny,
            "k_of_n" => JoinPolicy::KOfN,
            "quorum" => JoinPolicy::Quorum,
            _ => JoinPolicy::WaitAll,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JoinPolicy::WaitAll => "wait_all",
            JoinPolicy::WaitAny => "wait_any",
            JoinPolicy::KOfN => "k_of_n",
            JoinPolicy::Quorum => "quorum",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorPolicy {
    FailFast,
    Continue,
}

impl ErrorPolicy {
    pub fn parse(s: &str) -> Self {
        match s {
            "fail_fast" => ErrorPolicy::FailFast,
            _ => ErrorPolicy::Continue,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ParallelConfig {
    pub max_parallel: usize,
    pub join_policy: JoinPolicy,
    pub k_required: Option<usize>,
    pub error_policy: ErrorPolicy,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            join_policy: JoinPolicy::WaitAll,
            k_required: None,
            error_policy: ErrorPolicy::Continue,
        }
    }
}

/// Either a handler-produced outcome or a task-level error (including
/// cancellation) observed while running a branch.
#[derive(Clone, Debug)]
pub enum BranchOutcome {
    Outcome(Outcome),
    Error(String),
}

impl BranchOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, BranchOutcome::Outcome(o) if !o.is_fail())
    }
}

/// One branch's result: the branch root id, its outcome, its (cloned) final
/// context, and the artifact ids it produced.
#[derive(Clone)]
pub struct BranchResult {
    pub node_id: String,
    pub outcome: BranchOutcome,
    pub context: Context,
    pub artifact_ids: Vec<String>,
}

/// Runs a bounded sub-traversal from `root` using the same dispatch and edge
/// selection logic as the main traversal, stopping when a `parallel.fan_in`
/// node is reached (without executing it) or no outgoing edge remains.
async fn run_branch(
    cancel: CancelToken,
    graph: Arc<Graph>,
    registry: Arc<HandlerRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    failure_tracker: Arc<FailureTracker>,
    root: String,
    branch_context: Context,
) -> BranchResult {
    const SAFETY_CEILING: u32 = 10_000;
    let mut current = root.clone();
    let mut last_outcome = Outcome::success();
    let mut artifact_ids = Vec::new();

    for _ in 0..SAFETY_CEILING {
        if cancel.is_cancelled() {
            return BranchResult {
                node_id: root,
                outcome: BranchOutcome::Error("cancelled".to_string()),
                context: branch_context,
                artifact_ids,
            };
        }

        let Some(node) = graph.find_node(&current) else {
            return BranchResult {
                node_id: root,
                outcome: BranchOutcome::Error(format!("branch node {current} not found")),
                context: branch_context,
                artifact_ids,
            };
        };

        if resolve_node_type(node) == NodeType::ParallelFanIn {
            break;
        }

        let outcome = match dispatch_node(
            cancel.clone(),
            &graph,
            node,
            &branch_context,
            artifacts.as_ref(),
            &registry,
            &failure_tracker,
        )
        .await
        {
            Ok((o, _attempts)) => o,
            Err(e) => {
                return BranchResult {
                    node_id: root,
                    outcome: BranchOutcome::Error(e.0),
                    context: branch_context,
                    artifact_ids,
                }
            }
        };

        branch_context.apply_updates(outcome.context_updates.clone());
        branch_context.set("outcome", outcome.status().as_str());
        if let Some(label) = &outcome.preferred_label {
            branch_context.set("preferred_label", label.clone());
        }
        artifact_ids.push(format!("{current}.output"));
        last_outcome = outcome.clone();

        if outcome.is_fail() {
            return BranchResult {
                node_id: root,
                outcome: BranchOutcome::Outcome(outcome),
                context: branch_context,
                artifact_ids,
            };
        }

        match select_edge(&graph, &current, &outcome, &branch_context) {
            Some(edge) => current = edge.to.clone(),
            None => break,
        }
    }

    BranchResult {
        node_id: root,
        outcome: BranchOutcome::Outcome(last_outcome),
        context: branch_context,
        artifact_ids,
    }
}

/// Fans out to every root in `branch_roots`, bounded by
/// `config.max_parallel` concurrent branches, then evaluates and applies the
/// configured join policy, merging in-scope branch contexts back into
/// `parent_context`.
pub async fn run_parallel(
    cancel: CancelToken,
    graph: Arc<Graph>,
    registry: Arc<HandlerRegistry>,
    artifacts: Arc<dyn ArtifactStore>,
    failure_tracker: Arc<FailureTracker>,
    parent_context: &Context,
    branch_roots: Vec<String>,
    config: ParallelConfig,
) -> Result<Vec<BranchResult>, ParallelError> {
    if branch_roots.is_empty() {
        return Err(ParallelError::NoBranches);
    }

    let semaphore = Arc::new(Semaphore::new(config.max_parallel.max(1)));
    let branch_cancel = cancel.child_token();
    let mut handles = Vec::with_capacity(branch_roots.len());

    for root in &branch_roots {
        let semaphore = semaphore.clone();
        let graph = graph.clone();
        let registry = registry.clone();
        let artifacts = artifacts.clone();
        let failure_tracker = failure_tracker.clone();
        let branch_cancel_token = branch_cancel.clone();
        let branch_context = parent_context.clone();
        let root = root.clone();
        let error_policy = config.error_policy;
        let fail_fast_trigger = branch_cancel.clone();

        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
            let result = run_branch(
                branch_cancel_token,
                graph,
                registry,
                artifacts,
                failure_tracker,
                root,
                branch_context,
            )
            .await;
            if error_policy == ErrorPolicy::FailFast && !result.outcome.succeeded() {
                fail_fast_trigger.cancel();
            }
            result
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (i, handle) in handles.into_iter().enumerate() {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => results.push(BranchResult {
                node_id: branch_roots[i].clone(),
                outcome: BranchOutcome::Error(format!("branch task panicked: {e}")),
                context: Context::new(),
                artifact_ids: Vec::new(),
            }),
        }
    }

    Ok(results)
}

/// Indices (in `results`'s branch-declaration order) that are in scope for
/// merging once the join policy is satisfied.
fn evaluate_policy(results: &[BranchResult], config: &ParallelConfig) -> Result<Vec<usize>, ParallelError> {
    let total = results.len();
    let succeeded: Vec<usize> = results
        .iter()
        .enumerate()
        .filter(|(_, r)| r.outcome.succeeded())
        .map(|(i, _)| i)
        .collect();

    match config.join_policy {
        JoinPolicy::WaitAll => {
            if succeeded.len() == total {
                Ok((0..total).collect())
            } else {
                Err(ParallelError::PolicyFailed {
                    policy: "wait_all".to_string(),
                    succeeded: succeeded.len(),
                    total,
                    required: total,
                })
            }
        }
        JoinPolicy::WaitAny => {
            if succeeded.is_empty() {
                Err(ParallelError::PolicyFailed {
                    policy: "wait_any".to_string(),
                    succeeded: 0,
                    total,
                    required: 1,
                })
            } else {
                Ok(succeeded)
            }
        }
        JoinPolicy::KOfN => {
            let k = config.k_required.unwrap_or(total);
            if succeeded.len() >= k {
                Ok(succeeded)
            } else {
                Err(ParallelError::PolicyFailed {
                    policy: "k_of_n".to_string(),
                    succeeded: succeeded.len(),
                    total,
                    required: k,
                })
            }
        }
        JoinPolicy::Quorum => {
            let required = total / 2 + 1;
            if succeeded.len() * 2 > total {
                Ok(succeeded)
            } else {
                Err(ParallelError::PolicyFailed {
                    policy: "quorum".to_string(),
                    succeeded: succeeded.len(),
                    total,
                    required,
                })
            }
        }
    }
}

/// Merges the in-scope branches of `results` into `parent_context` per
/// `config`'s join policy, recording conflicts and a merge summary in the
/// parent's log. Returns an error without
/// mutating `parent_context` if the policy is not satisfied.
pub fn merge_results(
    parent_context: &Context,
    results: &[BranchResult],
    config: &ParallelConfig,
) -> Result<(), ParallelError> {
    let scope = evaluate_policy(results, config)?;

    let mut writers: HashMap<String, Vec<&str>> = HashMap::new();
    let mut merged: HashMap<String, Value> = HashMap::new();
    for &idx in &scope {
        let branch = &results[idx];
        for (key, value) in branch.context.snapshot() {
            writers.entry(key.clone()).or_default().push(branch.node_id.as_str());
            merged.insert(key, value);
        }
    }

    for (key, branches) in &writers {
        if branches.len() > 1 {
            let chosen = branches.last().expect("non-empty");
            parent_context.append_log(format!(
                "merge: conflict on {key} resolved last-write-wins: chose branch {chosen}"
            ));
        }
    }
    parent_context.apply_updates(merged);

    let results_json: Vec<Value> = results
        .iter()
        .map(|r| match &r.outcome {
            BranchOutcome::Outcome(o) => json!({
                "node_id": r.node_id,
                "status": o.status().as_str(),
                "notes": o.notes,
                "failure_reason": o.failure_reason,
            }),
            BranchOutcome::Error(e) => json!({
                "node_id": r.node_id,
                "status": "fail",
                "failure_reason": e,
            }),
        })
        .collect();
    parent_context.set("parallel.results", json!(results_json));

    let mut artifacts_map = serde_json::Map::new();
    for &idx in &scope {
        let branch = &results[idx];
        artifacts_map.insert(branch.node_id.clone(), json!(branch.artifact_ids));
    }
    parent_context.set("parallel.artifacts", Value::Object(artifacts_map));

    let branch_ids: Vec<&str> = scope.iter().map(|&i| results[i].node_id.as_str()).collect();
    parent_context.append_log(format!(
        "merge: policy={} merged branches={:?}",
        config.join_policy.as_str(),
        branch_ids
    ));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge, Node};
    use crate::handler::HandlerRegistry;
    use crate::interfaces::FsArtifactStore;
    use crate::retry::FailureTracker;

    fn branch_graph() -> Arc<Graph> {
        let mut g = Graph::new();
        let mut b0 = Node::new("b0");
        b0.attrs.insert("type".into(), "tool".into());
        b0.attrs.insert("command".into(), "true".into());
        let mut b1 = Node::new("b1");
        b1.attrs.insert("type".into(), "tool".into());
        b1.attrs.insert("command".into(), "true".into());
        g.add_node(b0);
        g.add_node(b1);
        g.add_edge(Edge::new("b0", "fan_in"));
        g.add_edge(Edge::new("b1", "fan_in"));
        let mut fan_in = Node::new("fan_in");
        fan_in.attrs.insert("type".into(), "parallel.fan_in".into());
        g.add_node(fan_in);
        Arc::new(g)
    }

    async fn run(parent: &Context, roots: Vec<&str>, config: ParallelConfig) -> Vec<BranchResult> {
        run_parallel(
            CancelToken::new(),
            branch_graph(),
            Arc::new(HandlerRegistry::with_defaults()),
            Arc::new(FsArtifactStore::new(std::env::temp_dir())),
            Arc::new(FailureTracker::new()),
            parent,
            roots.into_iter().map(str::to_string).collect(),
            config,
        )
        .await
        .unwrap()
    }

    /// **Scenario**: wait_all last-write-wins merges both branches' writes and logs the
    /// conflict, with parallel.results carrying exactly 2 entries.
    #[tokio::test]
    async fn wait_all_last_write_wins_and_logs_conflict() {
        let parent = Context::new();
        let mut config = ParallelConfig::default();
        config.join_policy = JoinPolicy::WaitAll;

        let mut results = run(&parent, vec!["b0", "b1"], config.clone()).await;
        results[0].context.set("shared_key", "A");
        results[1].context.set("shared_key", "B");

        merge_results(&parent, &results, &config).unwrap();
        assert_eq!(parent.get("shared_key"), Some(json!("B")));
        assert!(parent.logs().iter().any(|l| l.contains("conflict on shared_key resolved last-write-wins")));
        let parallel_results = parent.get("parallel.results").unwrap();
        assert_eq!(parallel_results.as_array().unwrap().len(), 2);
    }

    /// **Scenario**: quorum with a 2-2 split over 4 branches fails (2*2 is not > 4).
    #[test]
    fn quorum_tie_fails() {
        fn fake(id: &str, ok: bool) -> BranchResult {
            BranchResult {
                node_id: id.to_string(),
                outcome: if ok { BranchOutcome::Outcome(Outcome::success()) } else { BranchOutcome::Outcome(Outcome::fail("x")) },
                context: Context::new(),
                artifact_ids: vec![],
            }
        }
        let results = vec![fake("b0", true), fake("b1", true), fake("b2", false), fake("b3", false)];
        let mut config = ParallelConfig::default();
        config.join_policy = JoinPolicy::Quorum;
        let err = evaluate_policy(&results, &config).unwrap_err();
        match err {
            ParallelError::PolicyFailed { policy, succeeded, total, .. } => {
                assert_eq!(policy, "quorum");
                assert_eq!(succeeded, 2);
                assert_eq!(total, 4);
            }
            _ => panic!("expected PolicyFailed"),
        }
    }

    /// **Scenario**: quorum with 3/4 succeeding passes (3*2 > 4).
    #[test]
    fn quorum_three_of_four_succeeds() {
        fn fake(id: &str, ok: bool) -> BranchResult {
            BranchResult {
                node_id: id.to_string(),
                outcome: if ok { BranchOutcome::Outcome(Outcome::success()) } else { BranchOutcome::Outcome(Outcome::fail("x")) },
                context: Context::new(),
                artifact_ids: vec![],
            }
        }
        let results = vec![fake("b0", true), fake("b1", true), fake("b2", true), fake("b3", false)];
        let mut config = ParallelConfig::default();
        config.join_policy = JoinPolicy::Quorum;
        assert_eq!(evaluate_policy(&results, &config).unwrap().len(), 3);
    }

    /// **Scenario**: k_of_n with k == total behaves like wait_all.
    #[test]
    fn k_of_n_with_k_equal_total_behaves_like_wait_all() {
        fn fake(id: &str, ok: bool) -> BranchResult {
            BranchResult {
                node_id: id.to_string(),
                outcome: if ok { BranchOutcome::Outcome(Outcome::success()) } else { BranchOutcome::Outcome(Outcome::fail("x")) },
                context: Context::new(),
                artifact_ids: vec![],
            }
        }
        let results = vec![fake("b0", true), fake("b1", false)];
        let mut config = ParallelConfig::default();
        config.join_policy = JoinPolicy::KOfN;
        config.k_required = Some(2);
        assert!(evaluate_policy(&results, &config).is_err());
    }

    /// **Scenario**: max_parallel=1 still runs every branch to completion (serialized).
    #[tokio::test]
    async fn max_parallel_one_still_completes_every_branch() {
        let parent = Context::new();
        let mut config = ParallelConfig::default();
        config.max_parallel = 1;
        let results = run(&parent, vec!["b0", "b1"], config).await;
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.outcome.succeeded()));
    }
}
