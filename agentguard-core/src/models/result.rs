use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Decision derived from a confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Pass,
    Flag,
    Block,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Pass => "pass",
            Action::Flag => "flag",
            Action::Block => "block",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one guarded execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardResult {
    pub execution_id: Uuid,
    pub output: serde_json::Value,
    /// `None` when no verification took place (async mode) or the verify call failed.
    pub confidence: Option<f64>,
    pub action: Action,
    pub corrected: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_output: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrections: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub explanation: Option<String>,
}

impl GuardResult {
    /// Result for output that was recorded but not verified inline.
    pub fn unverified(execution_id: Uuid, output: serde_json::Value) -> Self {
        Self {
            execution_id,
            output,
            confidence: None,
            action: Action::Pass,
            corrected: false,
            original_output: None,
            corrections: None,
            explanation: None,
        }
    }

    /// Drop correction details from the externally visible result.
    pub fn into_opaque(mut self) -> Self {
        self.original_output = None;
        self.corrections = None;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_serializes_snake_case() {
        assert_eq!(serde_json::to_value(Action::Flag).unwrap(), json!("flag"));
        assert_eq!(Action::Block.to_string(), "block");
    }

    #[test]
    fn test_into_opaque_strips_correction_details() {
        let mut result = GuardResult::unverified(Uuid::new_v4(), json!("fixed"));
        result.corrected = true;
        result.original_output = Some(json!("wrong"));
        result.corrections = Some(vec![json!({"field": "answer"})]);

        let opaque = result.into_opaque();
        assert!(opaque.corrected);
        assert_eq!(opaque.output, json!("fixed"));
        assert!(opaque.original_output.is_none());
        assert!(opaque.corrections.is_none());

        let body = serde_json::to_value(&opaque).unwrap();
        assert!(body.get("original_output").is_none());
        assert!(body.get("corrections").is_none());
    }
}
