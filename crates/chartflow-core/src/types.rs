use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of one `run()` invocation.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unconstrained free-text generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextRequest {
    pub prompt: String,
    pub system_prompt: String,
    pub temperature: f32,
}

/// Generation constrained to a JSON Schema shaped result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredRequest {
    pub prompt: String,
    pub system_prompt: String,
    pub schema: serde_json::Value,
}

/// Events emitted while a flowchart run progresses.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        start_node: String,
        at: DateTime<Utc>,
    },
    NodeStarted {
        run_id: RunId,
        instance: String,
        speculative: bool,
    },
    NodeCompleted {
        run_id: RunId,
        instance: String,
        speculative: bool,
        elapsed_ms: u64,
    },
    NodeFailed {
        run_id: RunId,
        instance: String,
        speculative: bool,
        error: String,
    },
    /// The collaborator returned a label that matches no connection.
    DecisionFallback {
        run_id: RunId,
        instance: String,
        returned: String,
        chosen: String,
    },
    RunFinished {
        run_id: RunId,
        succeeded: bool,
        elapsed_ms: u64,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeCompleted { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::DecisionFallback { run_id, .. }
            | Self::RunFinished { run_id, .. } => *run_id,
        }
    }
}
