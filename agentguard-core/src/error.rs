use thiserror::Error;

use crate::models::GuardResult;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum GuardError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The verifier judged the output unreliable and no correction replaced it.
    #[error("Output blocked (confidence: {})", confidence_label(.0))]
    Blocked(Box<GuardResult>),
}

impl GuardError {
    /// The attached result when this is a block decision.
    pub fn blocked_result(&self) -> Option<&GuardResult> {
        match self {
            GuardError::Blocked(result) => Some(result),
            _ => None,
        }
    }
}

fn confidence_label(result: &GuardResult) -> String {
    match result.confidence {
        Some(c) => format!("{c:.3}"),
        None => "unknown".to_string(),
    }
}
