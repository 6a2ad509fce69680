use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One completed exchange within a session, as sent back to the verifier as history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub task: String,
    pub input: serde_json::Value,
    pub output: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(task: impl Into<String>, input: serde_json::Value, output: serde_json::Value) -> Self {
        Self {
            task: task.into(),
            input,
            output,
            timestamp: Utc::now(),
        }
    }
}
