use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GuardError;

/// Category of a recorded sub-operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Llm,
    ToolCall,
    Retrieval,
    Reasoning,
    Custom,
}

/// One recorded step inside a trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub name: String,
    pub kind: StepKind,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: f64,
}

/// Complete record of one instrumented execution.
///
/// Only a [`TraceRecorder`](crate::recorder::TraceRecorder) builds traces, and
/// the copy it hands out on finalize is sealed. Fields are read through
/// accessors so a sealed trace cannot be edited after hand-off.
#[derive(Debug, Clone, Serialize)]
pub struct Trace {
    pub(crate) execution_id: Uuid,
    pub(crate) agent_id: String,
    pub(crate) task: String,
    pub(crate) input: serde_json::Value,
    pub(crate) output: serde_json::Value,
    pub(crate) steps: Vec<TraceEvent>,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) duration_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) session_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) parent_execution_id: Option<Uuid>,
    pub(crate) metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) ground_truth: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) schema: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) token_count: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) cost_estimate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
    #[serde(skip)]
    pub(crate) sealed: bool,
}

impl Trace {
    pub(crate) fn open(agent_id: String, task: String, input: serde_json::Value) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            agent_id,
            task,
            input,
            output: serde_json::Value::Null,
            steps: Vec::new(),
            started_at: Utc::now(),
            duration_ms: 0.0,
            session_id: None,
            sequence: None,
            parent_execution_id: None,
            metadata: serde_json::Map::new(),
            ground_truth: None,
            schema: None,
            token_count: None,
            cost_estimate: None,
            error: None,
            sealed: false,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    pub fn task(&self) -> &str {
        &self.task
    }

    pub fn input(&self) -> &serde_json::Value {
        &self.input
    }

    pub fn output(&self) -> &serde_json::Value {
        &self.output
    }

    pub fn steps(&self) -> &[TraceEvent] {
        &self.steps
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn duration_ms(&self) -> f64 {
        self.duration_ms
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    pub fn parent_execution_id(&self) -> Option<Uuid> {
        self.parent_execution_id
    }

    pub fn metadata(&self) -> &serde_json::Map<String, serde_json::Value> {
        &self.metadata
    }

    pub fn ground_truth(&self) -> Option<&serde_json::Value> {
        self.ground_truth.as_ref()
    }

    pub fn schema(&self) -> Option<&serde_json::Value> {
        self.schema.as_ref()
    }

    pub fn token_count(&self) -> Option<u64> {
        self.token_count
    }

    pub fn cost_estimate(&self) -> Option<f64> {
        self.cost_estimate
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Consumers call this before taking ownership of a trace.
    pub fn ensure_sealed(&self) -> Result<(), GuardError> {
        if self.sealed {
            Ok(())
        } else {
            Err(GuardError::InvalidState(format!(
                "trace {} handed off before finalize",
                self.execution_id
            )))
        }
    }
}
