//! Human-in-the-loop gate: delegates to an
//! [`Interviewer`], building the question from the node's label and its
//! outgoing edge labels, and honoring `timeout`/`default_choice` on timeout.

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use super::Handler;
use crate::cancel::{cancellable_sleep, CancelToken};
use crate::context::Context;
use crate::edge_select::normalize_label;
use crate::graph::{Graph, Node};
use crate::interfaces::{ArtifactStore, Interviewer, Question};
use crate::outcome::Outcome;
use crate::retry::HandlerError;

const DEFAULT_TIMEOUT_SECS: u64 = 300;

/// Context key attaching the asking node's id, for Interviewer implementations
/// that need to display which node is waiting.
pub const ASK_CONTEXT_NODE_ID_KEY: &str = "wait_human.node_id";

pub struct WaitHumanHandler {
    interviewer: RwLock<Option<Arc<dyn Interviewer>>>,
}

impl WaitHumanHandler {
    pub fn new() -> Self {
        Self { interviewer: RwLock::new(None) }
    }

    pub fn set_interviewer(&self, interviewer: Arc<dyn Interviewer>) {
        *self.interviewer.write().expect("wait_human interviewer lock poisoned") = Some(interviewer);
    }

    fn interviewer(&self) -> Option<Arc<dyn Interviewer>> {
        self.interviewer.read().expect("wait_human interviewer lock poisoned").clone()
    }
}

impl Default for WaitHumanHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handler for WaitHumanHandler {
    fn type_name(&self) -> &'static str {
        "wait.human"
    }

    async fn execute(
        &self,
        cancel: CancelToken,
        graph: &Graph,
        node: &Node,
        context: &Context,
        _artifacts: &dyn ArtifactStore,
    ) -> Result<Outcome, HandlerError> {
        if let Some(interval) = node.attr("reminder_interval") {
            parse_duration_secs(interval)
                .ok_or_else(|| HandlerError::new(format!("wait.human node {} has an unparsable reminder_interval", node.id)))?;
        }

        let interviewer = self
            .interviewer()
            .ok_or_else(|| HandlerError::new(format!("wait.human node {} has no interviewer wired", node.id)))?;

        let options: Vec<String> = graph
            .outgoing_edges(&node.id)
            .into_iter()
            .filter_map(|e| e.attr("label"))
            .map(str::to_string)
            .collect();
        let edge_labels: Vec<String> = options.iter().map(|label| normalize_label(label)).collect();
        let question = Question {
            text: node.attr_or("label", "Approve?").to_string(),
            options,
            node_id: node.id.clone(),
        };

        let timeout = Duration::from_secs(node.attr_parsed("timeout", DEFAULT_TIMEOUT_SECS));
        let started = Instant::now();

        let asked = tokio::select! {
            result = interviewer.ask(cancel.child_token(), question) => Some(result),
            _ = cancellable_sleep(timeout, &cancel) => None,
        };
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let mut outcome = match asked {
            Some(Ok(response)) => {
                let normalized = normalize_label(&response);
                Outcome::success()
                    .with_preferred_label(normalized)
                    .with_context_update("human.timed_out", false)
            }
            Some(Err(e)) => Outcome::fail(format!("interviewer error: {}", e.0)).with_context_update("human.timed_out", false),
            None => {
                let default_choice = node.attr("default_choice").map(normalize_label);
                match default_choice {
                    Some(choice) if edge_labels.contains(&choice) => Outcome::success()
                        .with_preferred_label(choice)
                        .with_context_update("human.timed_out", true),
                    Some(choice) => Outcome::fail(format!(
                        "wait.human node {} timed out with default_choice {:?} matching no outgoing edge label",
                        node.id, choice
                    ))
                    .with_context_update("human.timed_out", true),
                    None => Outcome::fail(format!("wait.human node {} timed out with no default_choice", node.id))
                        .with_context_update("human.timed_out", true),
                }
            }
        };
        outcome = outcome.with_context_update("human.response_time_ms", elapsed_ms);
        context.apply_updates(outcome.context_updates.clone());
        Ok(outcome)
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

fn parse_duration_secs(value: &str) -> Option<Duration> {
    let trimmed = value.trim();
    let digits: String = trimmed.chars().take_while(|c| c.is_ascii_digit()).collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interfaces::{FsArtifactStore, InterviewError};

    struct StubInterviewer(Result<String, String>);

    #[async_trait]
    impl Interviewer for StubInterviewer {
        async fn ask(&self, _cancel: CancelToken, _question: Question) -> Result<String, InterviewError> {
            self.0.clone().map_err(InterviewError)
        }
    }

    struct HangingInterviewer;

    #[async_trait]
    impl Interviewer for HangingInterviewer {
        async fn ask(&self, cancel: CancelToken, _question: Question) -> Result<String, InterviewError> {
            cancel.cancelled().await;
            Err(InterviewError("cancelled".to_string()))
        }
    }

    fn node_with(attrs: &[(&str, &str)]) -> Node {
        let mut n = Node::new("approve");
        for (k, v) in attrs {
            n.attrs.insert(k.to_string(), v.to_string());
        }
        n
    }

    /// **Scenario**: an interviewer response becomes the preferred_label, normalized.
    #[tokio::test]
    async fn response_becomes_normalized_preferred_label() {
        let handler = WaitHumanHandler::new();
        handler.set_interviewer(Arc::new(StubInterviewer(Ok("[Y] Yes".to_string()))));
        let graph = Graph::new();
        let node = node_with(&[]);
        let context = Context::new();
        let artifacts = FsArtifactStore::new(std::env::temp_dir());

        let outcome = handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await
            .unwrap();
        assert!(!outcome.is_fail());
        assert_eq!(outcome.preferred_label.as_deref(), Some("yes"));
        assert_eq!(context.get("human.timed_out"), Some(serde_json::json!(false)));
    }

    /// **Scenario**: no interviewer wired fails loudly.
    #[tokio::test]
    async fn missing_interviewer_fails_loudly() {
        let handler = WaitHumanHandler::new();
        let graph = Graph::new();
        let node = node_with(&[]);
        let context = Context::new();
        let artifacts = FsArtifactStore::new(std::env::temp_dir());

        let result = handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await;
        assert!(result.is_err());
    }

    /// **Scenario**: on timeout, a default_choice matching an edge label resolves to success.
    #[tokio::test]
    async fn timeout_with_matching_default_choice_succeeds() {
        let handler = WaitHumanHandler::new();
        handler.set_interviewer(Arc::new(HangingInterviewer));
        let mut graph = Graph::new();
        graph.add_node(node_with(&[("timeout", "0"), ("default_choice", "approve")]));
        let mut edge = crate::graph::Edge::new("approve", "next");
        edge.attrs.insert("label".into(), "Approve".into());
        graph.add_edge(edge);
        let node = graph.find_node("approve").unwrap().clone();
        let context = Context::new();
        let artifacts = FsArtifactStore::new(std::env::temp_dir());

        let outcome = handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await
            .unwrap();
        assert!(!outcome.is_fail());
        assert_eq!(outcome.preferred_label.as_deref(), Some("approve"));
        assert_eq!(context.get("human.timed_out"), Some(serde_json::json!(true)));
    }

    /// **Scenario**: on timeout, a default_choice matching no outgoing edge label fails.
    #[tokio::test]
    async fn timeout_with_nonmatching_default_choice_fails() {
        let handler = WaitHumanHandler::new();
        handler.set_interviewer(Arc::new(HangingInterviewer));
        let mut graph = Graph::new();
        graph.add_node(node_with(&[("timeout", "0"), ("default_choice", "reject")]));
        let mut edge = crate::graph::Edge::new("approve", "next");
        edge.attrs.insert("label".into(), "Approve".into());
        graph.add_edge(edge);
        let node = graph.find_node("approve").unwrap().clone();
        let context = Context::new();
        let artifacts = FsArtifactStore::new(std::env::temp_dir());

        let outcome = handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await
            .unwrap();
        assert!(outcome.is_fail());
        assert_eq!(context.get("human.timed_out"), Some(serde_json::json!(true)));
    }

    /// **Scenario**: on timeout with no default_choice, the outcome fails.
    #[tokio::test]
    async fn timeout_with_no_default_choice_fails() {
        let handler = WaitHumanHandler::new();
        handler.set_interviewer(Arc::new(HangingInterviewer));
        let graph = Graph::new();
        let node = node_with(&[("timeout", "0")]);
        let context = Context::new();
        let artifacts = FsArtifactStore::new(std::env::temp_dir());

        let outcome = handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await
            .unwrap();
        assert!(outcome.is_fail());
    }

    /// **Scenario**: an unparsable reminder_interval is rejected before asking.
    #[tokio::test]
    async fn unparsable_reminder_interval_errors() {
        let handler = WaitHumanHandler::new();
        handler.set_interviewer(Arc::new(StubInterviewer(Ok("yes".to_string()))));
        let graph = Graph::new();
        let node = node_with(&[("reminder_interval", "soon")]);
        let context = Context::new();
        let artifacts = FsArtifactStore::new(std::env::temp_dir());

        let result = handler
            .execute(CancelToken::new(), &graph, &node, &context, &artifacts)
            .await;
        assert!(result.is_err());
    }
}
