//! Engine event types (pipeline/stage/checkpoint/agent lifecycle markers).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event type, matching the taxonomy the engine emits at pipeline, stage, checkpoint,
/// and agent-turn boundaries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    #[serde(rename = "pipeline.started")]
    PipelineStarted,
    #[serde(rename = "pipeline.completed")]
    PipelineCompleted,
    #[serde(rename = "pipeline.failed")]
    PipelineFailed,
    #[serde(rename = "stage.started")]
    StageStarted,
    #[serde(rename = "stage.completed")]
    StageCompleted,
    #[serde(rename = "stage.failed")]
    StageFailed,
    #[serde(rename = "stage.retrying")]
    StageRetrying,
    #[serde(rename = "stage.stalled")]
    StageStalled,
    #[serde(rename = "checkpoint.saved")]
    CheckpointSaved,
    #[serde(rename = "agent.tool_call.start")]
    AgentToolCallStart,
    #[serde(rename = "agent.tool_call.end")]
    AgentToolCallEnd,
    #[serde(rename = "agent.llm_turn")]
    AgentLlmTurn,
    #[serde(rename = "agent.steering")]
    AgentSteering,
    #[serde(rename = "agent.loop_detected")]
    AgentLoopDetected,
}

impl EventType {
    /// The dotted wire name of this event type, e.g. `"stage.completed"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PipelineStarted => "pipeline.started",
            EventType::PipelineCompleted => "pipeline.completed",
            EventType::PipelineFailed => "pipeline.failed",
            EventType::StageStarted => "stage.started",
            EventType::StageCompleted => "stage.completed",
            EventType::StageFailed => "stage.failed",
            EventType::StageRetrying => "stage.retrying",
            EventType::StageStalled => "stage.stalled",
            EventType::CheckpointSaved => "checkpoint.saved",
            EventType::AgentToolCallStart => "agent.tool_call.start",
            EventType::AgentToolCallEnd => "agent.tool_call.end",
            EventType::AgentLlmTurn => "agent.llm_turn",
            EventType::AgentSteering => "agent.steering",
            EventType::AgentLoopDetected => "agent.loop_detected",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One engine event: type, optional node id, free-form data, timestamp.
///
/// `timestamp` is `None` until the emitting site stamps it (engines must tolerate
/// emitting before a clock read is available, e.g. inside a panic-unwind path).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineEvent {
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub node_id: Option<String>,
    #[serde(default)]
    pub data: Map<String, Value>,
    pub timestamp: Option<DateTime<Utc>>,
}

impl EngineEvent {
    /// Creates an event with no data and no timestamp (stamped later by the emitter).
    pub fn new(event_type: EventType, node_id: impl Into<Option<String>>) -> Self {
        Self {
            event_type,
            node_id: node_id.into(),
            data: Map::new(),
            timestamp: None,
        }
    }

    /// Builder-style: attach a data field.
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    /// Stamps the timestamp with `now` if absent. Idempotent.
    pub fn ensure_timestamp(&mut self) {
        if self.timestamp.is_none() {
            self.timestamp = Some(Utc::now());
        }
    }
}
