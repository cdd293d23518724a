//! Orchestrator: drives the PARSE → VALIDATE → PREFLIGHT →
//! INITIALIZE → EXECUTE → FINALIZE lifecycle over a parsed, transformed
//! [`Graph`], dispatching to handlers, applying fidelity transforms between
//! hops, persisting checkpoints, and recording events to a run store.
//!
//! Modeled on the graph runtime's own `ReactRunner`: a `new` that wires
//! dependencies once, a `run`/`resume` pair that each drive one lifecycle,
//! with the attempt/retry loop lifted into [`crate::dispatch::dispatch_node`]
//! rather than duplicated here.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};
use treadle_event::{EngineEvent, EventType};

use crate::cancel::CancelToken;
use crate::checkpoint::{degrade_first_hop_fidelity, Checkpoint, FsCheckpointStore};
use crate::context::Context;
use crate::dispatch::dispatch_node;
use crate::edge_select::select_edge;
use crate::error::EngineError;
use crate::fidelity::{self, FidelityLimits};
use crate::graph::{resolve_node_type, Edge, Graph, Node, NodeType};
use crate::handler::{
    downcast_through_decorators, CodergenHandler, ConditionalHandler, HandlerRegistry, StackManagerLoopHandler,
};
use crate::interfaces::{ArtifactStore, CodergenBackend};
use crate::outcome::{Outcome, Status};
use crate::parallel_exec::{merge_results, run_parallel, ErrorPolicy, JoinPolicy, ParallelConfig};
use crate::retry::FailureTracker;
use crate::run_store::{RunEventStore, RunManifest, RunStatus};
use crate::watchdog::Watchdog;

/// Default cap on `loop_restart` re-entries into EXECUTE before the engine
/// gives up.
pub const DEFAULT_MAX_RESTARTS: u32 = 5;

/// Hard ceiling on traversal steps within a single EXECUTE pass, independent
/// of restarts, guarding against a cycle with no `loop_restart` edge.
pub const TRAVERSAL_SAFETY_CEILING: u32 = 10_000;

/// Outcome of a completed engine run.
#[derive(Debug, Clone)]
pub struct EngineResult {
    pub final_node: String,
    pub final_outcome: Status,
    pub completed_nodes: Vec<String>,
    pub restarts: u32,
    pub steps: u32,
}

/// Internal signal returned from one `execute_pass` to the caller loop
/// driving restarts; never surfaced to callers of [`Engine::run`].
enum ExecuteSignal {
    Restart(String),
    Fatal(EngineError),
}

/// Wires together every subsystem an [`Engine`] needs to drive one run: the
/// transformed graph, the handler registry, checkpoint/run/artifact stores,
/// the watchdog, and an optional event sink.
pub struct Engine {
    graph: Arc<Graph>,
    registry: Arc<HandlerRegistry>,
    checkpoints: FsCheckpointStore,
    run_store: Arc<dyn RunEventStore>,
    artifacts: Arc<dyn ArtifactStore>,
    watchdog: Arc<Watchdog>,
    event_handler: Option<crate::interfaces::EventHandlerFn>,
    fidelity_limits: FidelityLimits,
    max_restarts: u32,
    codergen_backend: Option<Arc<dyn CodergenBackend>>,
}

impl Engine {
    pub fn new(
        graph: Graph,
        registry: HandlerRegistry,
        checkpoints: FsCheckpointStore,
        run_store: Arc<dyn RunEventStore>,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            graph: Arc::new(graph),
            registry: Arc::new(registry),
            checkpoints,
            run_store,
            artifacts,
            watchdog: Watchdog::with_defaults(),
            event_handler: None,
            fidelity_limits: FidelityLimits::default(),
            max_restarts: DEFAULT_MAX_RESTARTS,
            codergen_backend: None,
        }
    }

    pub fn with_event_handler(mut self, handler: crate::interfaces::EventHandlerFn) -> Self {
        self.event_handler = Some(handler);
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: u32) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    /// Supplies the backend that INITIALIZE wires into every codergen-family
    /// handler (`codergen`, `conditional`, `stack.manager_loop`) before EXECUTE
    /// begins. Required whenever the graph has any node resolving to one of
    /// those types; checked at PREFLIGHT.
    pub fn with_codergen_backend(mut self, backend: Arc<dyn CodergenBackend>) -> Self {
        self.codergen_backend = Some(backend);
        self
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    fn emit(&self, run_id: &str, event: EngineEvent) {
        // Event emission is best-effort: a run-store append failure or a
        // handler panic must never abort the run.
        if let Err(e) = self.run_store.append(run_id, event.clone()) {
            warn!(error = %e, "failed to append event to run store");
        }
        if let Some(handler) = &self.event_handler {
            handler(event);
        }
    }

    /// PREFLIGHT: one check per distinct `env_required` value
    /// across all nodes, plus a backend-configured check for every node that
    /// resolves to a codergen-family type — it needs a
    /// [`CodergenBackend`] supplied via [`Engine::with_codergen_backend`] to do
    /// anything beyond a pass-through. The backend itself is not wired into the
    /// handlers until INITIALIZE runs (after this check passes); this only
    /// verifies the engine was configured with one to wire.
    fn preflight(&self) -> Result<(), EngineError> {
        let mut required_envs: Vec<String> = Vec::new();
        let mut needs_backend = false;

        for id in self.graph.node_ids_sorted() {
            let node = self.graph.find_node(id).expect("id came from nodes map");
            if let Some(env_key) = node.attr("env_required") {
                if !required_envs.iter().any(|e| e == env_key) {
                    required_envs.push(env_key.to_string());
                }
            }
            match resolve_node_type(node) {
                NodeType::Codergen | NodeType::Conditional | NodeType::StackManagerLoop => {
                    needs_backend = true;
                }
                _ => {}
            }
        }

        for env_key in &required_envs {
            if std::env::var(env_key).is_err() {
                return Err(EngineError::Preflight(format!(
                    "required environment variable {env_key} is not set"
                )));
            }
        }

        if needs_backend && self.codergen_backend.is_none() {
            return Err(EngineError::Preflight(
                "graph has codergen-family nodes but no codergen backend was supplied (see Engine::with_codergen_backend)".into(),
            ));
        }

        Ok(())
    }

    /// INITIALIZE: wires the configured codergen backend, if any, into every
    /// registered handler that needs one — reaching through each handler's
    /// decorator chain via [`downcast_through_decorators`] so a wrapped
    /// handler is still found. A no-op when no backend was supplied (the
    /// graph has no codergen-family nodes, since PREFLIGHT would otherwise
    /// have rejected the run).
    fn initialize(&self) {
        let Some(backend) = self.codergen_backend.clone() else { return };

        if let Some(handler) = self.registry.get("codergen") {
            if let Some(h) = downcast_through_decorators::<CodergenHandler>(handler.as_ref()) {
                h.set_backend(backend.clone());
            }
        }
        if let Some(handler) = self.registry.get("conditional") {
            if let Some(h) = downcast_through_decorators::<ConditionalHandler>(handler.as_ref()) {
                h.set_backend(backend.clone());
            }
        }
        if let Some(handler) = self.registry.get("stack.manager_loop") {
            if let Some(h) = downcast_through_decorators::<StackManagerLoopHandler>(handler.as_ref()) {
                h.set_backend(backend.clone());
            }
        }
    }

    /// VALIDATE: structural checks beyond what the parser
    /// already enforces — a start node exists and every edge endpoint
    /// resolves to a real node.
    fn validate(&self) -> Result<(), EngineError> {
        if self.graph.find_start().is_none() {
            return Err(EngineError::Validation(
                "graph has no start node (shape=Mdiamond or explicit type=start)".into(),
            ));
        }
        for edge in &self.graph.edges {
            if self.graph.find_node(&edge.from).is_none() {
                return Err(EngineError::Validation(format!(
                    "edge references unknown source node {}",
                    edge.from
                )));
            }
            if self.graph.find_node(&edge.to).is_none() {
                return Err(EngineError::Validation(format!(
                    "edge references unknown target node {}",
                    edge.to
                )));
            }
        }
        Ok(())
    }

    /// Drives a fresh run from the graph's start node.
    pub async fn run(
        &self,
        cancel: CancelToken,
        run_id: String,
        context: Context,
    ) -> Result<EngineResult, EngineError> {
        self.validate()?;
        self.preflight()?;
        self.initialize();

        let mut manifest = RunManifest::new(run_id.clone(), "graph", None);
        self.run_store.create_run(&manifest)?;
        self.emit(&run_id, EngineEvent::new(EventType::PipelineStarted, None));

        let start = self
            .graph
            .find_start()
            .ok_or_else(|| EngineError::Validation("graph has no start node".into()))?;
        context.set("_workdir", serde_json::json!("."));
        context.set(
            "_graph",
            serde_json::json!(crate::graph::generate_text(&self.graph)),
        );

        let watchdog = self.watchdog.clone();
        let watchdog_handle = watchdog.clone().spawn(self.event_handler.clone());

        let mut state = RunState {
            failure_tracker: Arc::new(FailureTracker::new()),
            completed_nodes: Vec::new(),
            retry_counts: HashMap::new(),
            node_outcomes: HashMap::new(),
            segment_nodes: Vec::new(),
            restarts: 0,
            steps: 0,
            current: start.id.clone(),
            force_first_hop_degrade: false,
        };

        let result = self.drive(&cancel, &context, &run_id, &mut state).await;

        watchdog_handle.abort();

        manifest.current_node = Some(state.current.clone());
        manifest.completed_nodes = state.completed_nodes.clone();
        manifest.status = if result.is_ok() { RunStatus::Completed } else { RunStatus::Failed };
        manifest.error = result.as_ref().err().map(|e| e.to_string());
        let _ = self.run_store.save_manifest(&manifest);

        match &result {
            Ok(r) => {
                self.emit(
                    &run_id,
                    EngineEvent::new(EventType::PipelineCompleted, Some(r.final_node.clone())),
                );
            }
            Err(e) => {
                self.emit(
                    &run_id,
                    EngineEvent::new(EventType::PipelineFailed, Some(state.current.clone()))
                        .with_data("error", e.to_string()),
                );
            }
        }

        result
    }

    /// Resumes a run from its most recent checkpoint: verify the checkpointed
    /// node still exists, rehydrate context
    /// and completed/retry bookkeeping, reconstruct the last outcome from
    /// `outcome`/`preferred_label`, select the next edge (falling back to
    /// the first outgoing edge if nothing matches), degrade a `full`
    /// fidelity resolution to `summary:high` for exactly the first hop, then
    /// continue the normal traversal loop.
    pub async fn resume(&self, cancel: CancelToken, run_id: String) -> Result<EngineResult, EngineError> {
        self.initialize();

        let checkpoint = self.checkpoints.load()?;
        if self.graph.find_node(&checkpoint.current_node).is_none() {
            return Err(EngineError::from(crate::checkpoint::CheckpointError::CurrentNodeMissing(
                checkpoint.current_node.clone(),
            )));
        }

        let context = checkpoint.rehydrate_context();
        let Checkpoint {
            completed_nodes,
            current_node,
            retry_counts,
            ..
        } = checkpoint;

        info!(node = %current_node, "resuming run from checkpoint");
        self.emit(
            &run_id,
            EngineEvent::new(EventType::PipelineStarted, Some(current_node.clone())),
        );

        let node = self.graph.find_node(&current_node).expect("checked above").clone();
        let outcome = reconstruct_outcome(&context);
        let edge = select_edge(&self.graph, &current_node, &outcome, &context)
            .cloned()
            .or_else(|| self.graph.outgoing_edges(&current_node).first().map(|e| (*e).clone()));

        // The A -> B hop out of the checkpointed node must go through the
        // same fidelity transform as any other hop, degraded (full ->
        // summary:high) since this is the first transition after a resume.
        // If there is no outgoing edge at all, the checkpointed node itself
        // re-executes and the degrade is deferred to its first real hop.
        let (current, force_first_hop_degrade) = match &edge {
            Some(edge) => {
                let next_node = self.graph.find_node(&edge.to).ok_or_else(|| {
                    EngineError::Validation(format!("resume edge target {} not found in graph", edge.to))
                })?;
                self.apply_fidelity_hop(edge, &node, next_node, &context, true);
                (edge.to.clone(), false)
            }
            None => (current_node.clone(), true),
        };

        let watchdog = self.watchdog.clone();
        let watchdog_handle = watchdog.clone().spawn(self.event_handler.clone());

        let mut node_outcomes = HashMap::new();
        node_outcomes.insert(current_node.clone(), outcome.status());
        let mut state = RunState {
            failure_tracker: Arc::new(FailureTracker::new()),
            completed_nodes,
            retry_counts,
            node_outcomes,
            segment_nodes: Vec::new(),
            restarts: 0,
            steps: 0,
            current,
            force_first_hop_degrade,
        };

        let result = self.drive(&cancel, &context, &run_id, &mut state).await;

        watchdog_handle.abort();

        let status = if result.is_ok() { RunStatus::Completed } else { RunStatus::Failed };
        if let Ok(mut manifest) = self.run_store.load_manifest(&run_id) {
            manifest.status = status;
            manifest.current_node = Some(state.current.clone());
            manifest.completed_nodes = state.completed_nodes.clone();
            let _ = self.run_store.save_manifest(&manifest);
        }

        result
    }

    /// Drives the restart loop shared by `run` and `resume`: each `execute_pass`
    /// either returns a terminal outcome, or a `loop_restart` signal that is
    /// re-entered as long as the restart budget allows.
    async fn drive(
        &self,
        cancel: &CancelToken,
        context: &Context,
        run_id: &str,
        state: &mut RunState,
    ) -> Result<EngineResult, EngineError> {
        loop {
            match self.execute_pass(cancel, context, run_id, state).await {
                Ok(final_outcome) => {
                    return Ok(EngineResult {
                        final_node: state.current.clone(),
                        final_outcome,
                        completed_nodes: state.completed_nodes.clone(),
                        restarts: state.restarts,
                        steps: state.steps,
                    });
                }
                Err(ExecuteSignal::Restart(target)) => {
                    state.restarts += 1;
                    if state.restarts > self.max_restarts {
                        return Err(EngineError::TooManyRestarts { max_restarts: self.max_restarts });
                    }
                    info!(target = %target, restarts = state.restarts, "loop_restart: re-entering EXECUTE");
                    state.segment_nodes.clear();
                    state.current = target;
                }
                Err(ExecuteSignal::Fatal(e)) => return Err(e),
            }
        }
    }

    /// One EXECUTE pass: traverses from `state.current` until a terminal
    /// node's goal gates are satisfied (success), a dead end is hit (fatal),
    /// or a `loop_restart` edge is taken (returned as a restart signal).
    async fn execute_pass(
        &self,
        cancel: &CancelToken,
        context: &Context,
        run_id: &str,
        state: &mut RunState,
    ) -> Result<Status, ExecuteSignal> {
        loop {
            if cancel.is_cancelled() {
                return Err(ExecuteSignal::Fatal(EngineError::Cancelled));
            }

            state.steps += 1;
            if state.steps > TRAVERSAL_SAFETY_CEILING {
                return Err(ExecuteSignal::Fatal(EngineError::TraversalCeilingExceeded {
                    limit: TRAVERSAL_SAFETY_CEILING,
                }));
            }

            let node = self
                .graph
                .find_node(&state.current)
                .ok_or_else(|| {
                    ExecuteSignal::Fatal(EngineError::Validation(format!(
                        "traversal reached unknown node {}",
                        state.current
                    )))
                })?
                .clone();

            self.watchdog.node_started(&node.id);
            self.emit(run_id, EngineEvent::new(EventType::StageStarted, Some(node.id.clone())));

            let (outcome, attempts) = dispatch_node(
                cancel.child_token(),
                &self.graph,
                &node,
                context,
                self.artifacts.as_ref(),
                &self.registry,
                &state.failure_tracker,
            )
            .await
            .map_err(|e| {
                ExecuteSignal::Fatal(EngineError::NodeFailed { node_id: node.id.clone(), reason: e.0 })
            })?;

            context.apply_updates(outcome.context_updates.clone());
            context.set("outcome", serde_json::json!(outcome.status().as_str()));
            match &outcome.preferred_label {
                Some(label) => context.set("preferred_label", serde_json::json!(label)),
                None => {
                    context.remove("preferred_label");
                }
            }

            self.watchdog.node_finished(&node.id);
            if outcome.status() == Status::Fail {
                self.emit(
                    run_id,
                    EngineEvent::new(EventType::StageFailed, Some(node.id.clone()))
                        .with_data("reason", outcome.failure_reason.clone().unwrap_or_default()),
                );
            } else {
                self.emit(run_id, EngineEvent::new(EventType::StageCompleted, Some(node.id.clone())));
            }

            if !state.completed_nodes.contains(&node.id) {
                state.completed_nodes.push(node.id.clone());
            }
            state.retry_counts.insert(node.id.clone(), attempts.saturating_sub(1));
            state.node_outcomes.insert(node.id.clone(), outcome.status());
            if !state.segment_nodes.contains(&node.id) {
                state.segment_nodes.push(node.id.clone());
            }

            // Parallel fan-out wiring: the handler only declares config into
            // context; the engine runs
            // the branches, merges their results, and advances to the
            // unique downstream fan_in node.
            if context.contains_key("parallel.branches") {
                let fan_in_id = self.run_parallel_branches(cancel, &node, context, state, run_id).await?;
                self.checkpoint_at(&fan_in_id, context, state, run_id);
                state.current = fan_in_id;
                continue;
            }

            if matches!(outcome.status(), Status::Success | Status::PartialSuccess) {
                self.checkpoint_at(&node.id, context, state, run_id);
            }

            // Terminal node + goal gate handling: every visited node marked
            // `goal_gate=true` must have satisfied its gate, not just the
            // terminal node itself. Checked in visit order; the first
            // failing gate wins.
            let is_terminal = self.graph.outgoing_edges(&node.id).is_empty();
            if is_terminal {
                if outcome.status() == Status::Fail {
                    return Err(ExecuteSignal::Fatal(EngineError::DeadEnd { node_id: node.id.clone() }));
                }

                for visited_id in &state.segment_nodes {
                    let Some(visited) = self.graph.find_node(visited_id) else { continue };
                    if !visited.attr_bool("goal_gate", false) {
                        continue;
                    }
                    let satisfied = state
                        .node_outcomes
                        .get(visited_id)
                        .map(|s| s.satisfies_goal_gate())
                        .unwrap_or(false);
                    if !satisfied {
                        return self.handle_goal_gate_failure(visited);
                    }
                }
                return Ok(outcome.status());
            }

            let edge = match select_edge(&self.graph, &node.id, &outcome, context) {
                Some(e) => e,
                None => {
                    if matches!(outcome.status(), Status::Fail) {
                        return Err(ExecuteSignal::Fatal(EngineError::DeadEnd { node_id: node.id.clone() }));
                    }
                    return Ok(outcome.status());
                }
            };

            if edge.attr_bool("loop_restart", false) {
                return Err(ExecuteSignal::Restart(edge.to.clone()));
            }

            let next_id = edge.to.clone();
            let next_node = self.graph.find_node(&next_id).ok_or_else(|| {
                ExecuteSignal::Fatal(EngineError::Validation(format!("edge target {next_id} not found in graph")))
            })?;

            self.apply_fidelity(edge, &node, next_node, context, state);
            state.current = next_id;
        }
    }

    /// Runs the graph's `parallel.branches` declared by the just-dispatched
    /// node's handler, merges branch results into `context`, marks every
    /// branch root completed, clears the declaration keys, and returns the
    /// id of the unique downstream `parallel.fan_in` node to continue from.
    async fn run_parallel_branches(
        &self,
        cancel: &CancelToken,
        node: &Node,
        context: &Context,
        state: &mut RunState,
        run_id: &str,
    ) -> Result<String, ExecuteSignal> {
        let branches: Vec<String> = context
            .get("parallel.branches")
            .and_then(|v| v.as_array().cloned())
            .map(|arr| arr.into_iter().filter_map(|v| v.as_str().map(str::to_string)).collect())
            .unwrap_or_default();

        let config = ParallelConfig {
            max_parallel: context
                .get("parallel.max_parallel")
                .and_then(|v| v.as_u64())
                .map(|n| n as usize)
                .unwrap_or(4),
            join_policy: context
                .get("parallel.join_policy")
                .and_then(|v| v.as_str().map(JoinPolicy::parse))
                .unwrap_or(JoinPolicy::WaitAll),
            k_required: context.get("parallel.k_required").and_then(|v| v.as_u64()).map(|n| n as usize),
            error_policy: context
                .get("parallel.error_policy")
                .and_then(|v| v.as_str().map(ErrorPolicy::parse))
                .unwrap_or(ErrorPolicy::Continue),
        };

        let results = run_parallel(
            cancel.child_token(),
            self.graph.clone(),
            self.registry.clone(),
            self.artifacts.clone(),
            state.failure_tracker.clone(),
            context,
            branches.clone(),
            config.clone(),
        )
        .await
        .map_err(|e| ExecuteSignal::Fatal(EngineError::from(e)))?;

        for result in &results {
            if !state.completed_nodes.contains(&result.node_id) {
                state.completed_nodes.push(result.node_id.clone());
            }
        }

        merge_results(context, &results, &config).map_err(|e| ExecuteSignal::Fatal(EngineError::from(e)))?;
        self.emit(run_id, EngineEvent::new(EventType::StageCompleted, Some(node.id.clone())));

        context.remove("parallel.branches");
        context.remove("parallel.max_parallel");
        context.remove("parallel.join_policy");
        context.remove("parallel.error_policy");
        context.remove("parallel.k_required");

        let mut fan_in_candidates: Vec<String> = Vec::new();
        for branch_start in &branches {
            for id in self.graph.node_ids_sorted() {
                let candidate = self.graph.find_node(id).expect("id came from nodes map");
                if resolve_node_type(candidate) == NodeType::ParallelFanIn
                    && self.reachable_from(branch_start, &candidate.id)
                    && !fan_in_candidates.contains(&candidate.id)
                {
                    fan_in_candidates.push(candidate.id.clone());
                }
            }
        }

        fan_in_candidates.into_iter().next().ok_or_else(|| {
            ExecuteSignal::Fatal(EngineError::Validation(format!(
                "no parallel.fan_in node reachable from branches of {}",
                node.id
            )))
        })
    }

    /// Cheap reachability probe used only to locate the fan-in node for a
    /// just-completed fan-out; bounded by the graph's own node count so a
    /// cyclic graph cannot loop forever here.
    fn reachable_from(&self, from: &str, to: &str) -> bool {
        let mut seen = std::collections::HashSet::new();
        let mut stack = vec![from.to_string()];
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if !seen.insert(id.clone()) {
                continue;
            }
            for edge in self.graph.outgoing_edges(&id) {
                stack.push(edge.to.clone());
            }
        }
        false
    }

    fn handle_goal_gate_failure(&self, node: &Node) -> Result<Status, ExecuteSignal> {
        // Node-level retry target takes precedence over any graph default.
        let target = node.attr("retry_target").or_else(|| node.attr("fallback_retry_target"));
        match target {
            Some(target) => {
                warn!(node = %node.id, target, "goal gate failed; retrying from target");
                Err(ExecuteSignal::Restart(target.to_string()))
            }
            None => Err(ExecuteSignal::Fatal(EngineError::GoalGateUnrecoverable { node_id: node.id.clone() })),
        }
    }

    fn checkpoint_at(&self, node_id: &str, context: &Context, state: &RunState, run_id: &str) {
        let checkpoint = Checkpoint::capture(
            node_id.to_string(),
            state.completed_nodes.clone(),
            state.retry_counts.clone(),
            context,
        );
        // Checkpoint writes are recovered-locally: a failed write must not
        // abort an otherwise healthy run.
        if let Err(e) = self.checkpoints.save(&checkpoint, state.completed_nodes.len() as u64) {
            warn!(error = %e, node = %node_id, "failed to persist checkpoint");
        }
        self.emit(run_id, EngineEvent::new(EventType::CheckpointSaved, Some(node_id.to_string())));
    }

    /// Resolves and applies the fidelity transform for the hop from `from` to
    /// `to` along `edge`, re-injecting engine-managed keys and setting (or
    /// clearing) `_fidelity_preamble`. When `force_degrade` is set, a
    /// resolution of `full` is degraded to `summary:high` regardless of what
    /// the normal precedence chain resolves to — used for exactly the first
    /// hop after a resume.
    fn apply_fidelity_hop(&self, edge: &Edge, from: &Node, to: &Node, context: &Context, force_degrade: bool) {
        let graph_default = self.graph.graph_attr("fidelity");
        let mut mode = fidelity::resolve_mode(
            edge.attr("fidelity"),
            to.attr("fidelity").or_else(|| from.attr("fidelity")),
            graph_default,
        );
        if force_degrade {
            mode = degrade_first_hop_fidelity(mode);
        }

        debug!(from = %from.id, to = %to.id, mode = mode.as_str(), "resolved fidelity mode for hop");

        let prev_label = context.get_as_string_with_default("preferred_label", &from.id);

        let values = context.snapshot();
        let logs = context.logs();
        let transformed = fidelity::apply(mode, &values, &logs, self.fidelity_limits, &prev_label);

        context.replace_values(transformed.values);
        context.replace_logs(transformed.logs);
        if mode.is_full() {
            context.set("_fidelity_preamble", serde_json::json!(""));
        } else {
            context.set("_fidelity_preamble", serde_json::json!(transformed.preamble));
        }
    }

    /// Hop variant used by the main traversal loop: consumes
    /// `state.force_first_hop_degrade` on the one hop it applies to, so later
    /// hops in the same run use their own declared modes undegraded.
    fn apply_fidelity(&self, edge: &Edge, from: &Node, to: &Node, context: &Context, state: &mut RunState) {
        let force_degrade = state.force_first_hop_degrade;
        self.apply_fidelity_hop(edge, from, to, context, force_degrade);
        if force_degrade {
            state.force_first_hop_degrade = false;
        }
    }
}

/// Bookkeeping threaded through one `drive` call (fresh for `run`,
/// pre-populated from a checkpoint for `resume`).
struct RunState {
    failure_tracker: Arc<FailureTracker>,
    completed_nodes: Vec<String>,
    retry_counts: HashMap<String, u32>,
    node_outcomes: HashMap<String, Status>,
    /// Nodes visited since the last restart (loop_restart edge or goal-gate
    /// jump). Goal gates are only evaluated over this segment: a restart is
    /// a fresh re-entry, not a replay of the same traversal, so a gate that
    /// failed on the segment the jump left behind must not re-fail forever.
    segment_nodes: Vec<String>,
    restarts: u32,
    steps: u32,
    current: String,
    force_first_hop_degrade: bool,
}

/// Reconstructs the outcome that would have been produced by the
/// checkpointed node, from the `outcome`/`preferred_label` context keys
/// written at the time of checkpointing.
fn reconstruct_outcome(context: &Context) -> Outcome {
    let status_str = context.get_as_string_with_default("outcome", "success");
    let mut outcome = match status_str.as_str() {
        "fail" => Outcome::fail("reconstructed from checkpoint"),
        "partial_success" => Outcome::partial_success("reconstructed from checkpoint"),
        "retry" => Outcome { status: Some(Status::Retry), ..Outcome::default() },
        "skipped" => Outcome { status: Some(Status::Skipped), ..Outcome::default() },
        _ => Outcome::success(),
    };
    if let Some(label) = context.get("preferred_label").and_then(|v| v.as_str().map(str::to_string)) {
        outcome = outcome.with_preferred_label(label);
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Edge as GraphEdge, Graph, Node as GraphNode};
    use crate::handler::HandlerRegistry;
    use crate::interfaces::FsArtifactStore;
    use crate::run_store::FsRunStore;

    fn linear_graph() -> Graph {
        let mut g = Graph::new();
        let mut start = GraphNode::new("start");
        start.attrs.insert("shape".into(), "Mdiamond".into());
        let mut work = GraphNode::new("work");
        work.attrs.insert("type".into(), "tool".into());
        work.attrs.insert("command".into(), "true".into());
        let mut exit = GraphNode::new("exit");
        exit.attrs.insert("shape".into(), "Msquare".into());
        g.add_node(start);
        g.add_node(work);
        g.add_node(exit);
        g.add_edge(GraphEdge::new("start", "work"));
        g.add_edge(GraphEdge::new("work", "exit"));
        g
    }

    fn test_engine(graph: Graph, dir: &std::path::Path) -> Engine {
        let registry = HandlerRegistry::with_defaults();
        let checkpoints = FsCheckpointStore::new(dir.join("checkpoints"), false);
        let run_store: Arc<dyn RunEventStore> = Arc::new(FsRunStore::new(dir.join("runs")));
        let artifacts: Arc<dyn ArtifactStore> = Arc::new(FsArtifactStore::new(dir.join("artifacts")));
        Engine::new(graph, registry, checkpoints, run_store, artifacts)
    }

    /// **Scenario**: a simple linear graph runs start → work → exit and
    /// reports the terminal node's outcome.
    #[tokio::test]
    async fn linear_run_reaches_exit() {
        let dir = tempfile::tempdir().unwrap();
        let engine = test_engine(linear_graph(), dir.path());
        let cancel = CancelToken::new();
        let result = engine.run(cancel, "run-1".to_string(), Context::new()).await.unwrap();
        assert_eq!(result.final_node, "exit");
        assert!(result.completed_nodes.contains(&"work".to_string()));
    }

    /// **Scenario**: a graph missing a start node fails validation before
    /// any node is dispatched.
    #[tokio::test]
    async fn missing_start_node_fails_validation() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = Graph::new();
        g.add_node(GraphNode::new("only"));
        let engine = test_engine(g, dir.path());
        let cancel = CancelToken::new();
        let err = engine.run(cancel, "run-2".to_string(), Context::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    /// **Scenario**: a goal gate at the terminal node with no retry target
    /// and a failing outcome halts with a fatal, unrecoverable error.
    #[tokio::test]
    async fn unsatisfied_goal_gate_without_target_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = Graph::new();
        let mut start = GraphNode::new("start");
        start.attrs.insert("shape".into(), "Mdiamond".into());
        let mut work = GraphNode::new("work");
        work.attrs.insert("type".into(), "tool".into());
        work.attrs.insert("command".into(), "false".into());
        work.attrs.insert("goal_gate".into(), "true".into());
        work.attrs.insert("retry_policy".into(), "none".into());
        g.add_node(start);
        g.add_node(work);
        g.add_edge(GraphEdge::new("start", "work"));
        let engine = test_engine(g, dir.path());
        let cancel = CancelToken::new();
        let err = engine.run(cancel, "run-3".to_string(), Context::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::GoalGateUnrecoverable { .. }));
    }

    /// **Scenario**: a goal gate with a configured retry_target re-enters
    /// EXECUTE by jumping straight to that node id (restart targets are not
    /// bound by edges), and the run completes once the target's own outcome
    /// satisfies the gate.
    #[tokio::test]
    async fn goal_gate_with_retry_target_restarts_execution() {
        let dir = tempfile::tempdir().unwrap();
        let mut g = Graph::new();
        let mut start = GraphNode::new("start");
        start.attrs.insert("shape".into(), "Mdiamond".into());
        let mut gate = GraphNode::new("gate");
        gate.attrs.insert("type".into(), "verify".into());
        gate.attrs.insert("verify_command".into(), "false".into());
        gate.attrs.insert("goal_gate".into(), "true".into());
        gate.attrs.insert("retry_target".into(), "safe_exit".into());
        gate.attrs.insert("retry_policy".into(), "none".into());
        let mut safe_exit = GraphNode::new("safe_exit");
        safe_exit.attrs.insert("type".into(), "tool".into());
        safe_exit.attrs.insert("command".into(), "true".into());
        g.add_node(start);
        g.add_node(gate);
        g.add_node(safe_exit);
        g.add_edge(GraphEdge::new("start", "gate"));
        let engine = test_engine(g, dir.path());
        let cancel = CancelToken::new();
        let result = engine.run(cancel, "run-4".to_string(), Context::new()).await.unwrap();
        assert_eq!(result.final_node, "safe_exit");
        assert_eq!(result.final_outcome, Status::Success);
        assert_eq!(result.restarts, 1);
    }
}
