//! Inline verification of a finalized trace.
//!
//! One call runs verify → decide → (optional) correct → finalize. It issues
//! exactly one verify request and at most one correction request, with no
//! retries. When the trace belongs to a session, the session window is held
//! for the whole verify call: the request carries a snapshot of prior turns
//! and the turn is appended afterwards whatever the outcome. Sessions are
//! looked up, never created, here.

use agentguard_core::{
    decide, Action, ConversationTurn, CorrectionMode, CorrectionRequest, GuardBackend,
    GuardConfig, GuardError, GuardResult, ThresholdConfig, Trace, Transparency, TransportError,
    VerifyFailurePolicy, VerifyRequest, VerifyResponse,
};
use std::sync::Arc;
use std::time::Duration;

use crate::session::{SessionManager, SessionState};

#[derive(Debug, Clone)]
pub struct VerifierSettings {
    pub thresholds: ThresholdConfig,
    pub correction: CorrectionMode,
    pub transparency: Transparency,
    pub verify_failure: VerifyFailurePolicy,
    pub timeout: Duration,
    pub correction_timeout: Duration,
}

impl From<&GuardConfig> for VerifierSettings {
    fn from(config: &GuardConfig) -> Self {
        Self {
            thresholds: config.confidence_threshold,
            correction: config.correction,
            transparency: config.transparency,
            verify_failure: config.verify_failure,
            timeout: config.timeout(),
            correction_timeout: config.correction_timeout(),
        }
    }
}

pub struct VerificationClient {
    backend: Arc<dyn GuardBackend>,
    sessions: Arc<SessionManager>,
    settings: VerifierSettings,
}

impl VerificationClient {
    pub fn new(
        backend: Arc<dyn GuardBackend>,
        sessions: Arc<SessionManager>,
        settings: VerifierSettings,
    ) -> Self {
        Self {
            backend,
            sessions,
            settings,
        }
    }

    pub fn settings(&self) -> &VerifierSettings {
        &self.settings
    }

    /// Verify `trace` and return the guarded result.
    ///
    /// Returns `GuardError::Blocked` when the final action is `block` and no
    /// correction replaced the output.
    ///
    /// A trace carrying a session id is verified against that session's
    /// history only while the session is registered; a discarded session is
    /// never recreated.
    pub async fn verify(&self, trace: Trace) -> Result<GuardResult, GuardError> {
        let session = trace.session_id().and_then(|id| self.sessions.get(id));
        self.verify_in_session(trace, session).await
    }

    /// Verify `trace` as a turn of `session`, if any.
    pub async fn verify_in_session(
        &self,
        trace: Trace,
        session: Option<Arc<SessionState>>,
    ) -> Result<GuardResult, GuardError> {
        trace.ensure_sealed()?;

        let outcome = self.verify_with_history(&trace, session.as_deref()).await;

        let mut result = match outcome {
            Ok(response) => {
                let action = decide(response.confidence, &self.settings.thresholds);
                tracing::debug!(
                    execution_id = %trace.execution_id(),
                    confidence = response.confidence,
                    action = %action,
                    "Verification decided"
                );
                GuardResult {
                    execution_id: trace.execution_id(),
                    output: trace.output().clone(),
                    confidence: Some(response.confidence),
                    action,
                    corrected: false,
                    original_output: None,
                    corrections: None,
                    explanation: response.explanation,
                }
            }
            Err(e) => {
                let action = match self.settings.verify_failure {
                    VerifyFailurePolicy::FailOpen => Action::Flag,
                    VerifyFailurePolicy::FailClosed => Action::Block,
                };
                tracing::warn!(
                    execution_id = %trace.execution_id(),
                    agent_id = %trace.agent_id(),
                    timeout = e.is_timeout(),
                    error = %e,
                    action = %action,
                    "Verify call failed, degrading per verify_failure policy"
                );
                let mut result = GuardResult::unverified(trace.execution_id(), trace.output().clone());
                result.action = action;
                return self.finish(result);
            }
        };

        if result.action != Action::Pass && self.settings.correction == CorrectionMode::Cascade {
            self.apply_correction(&trace, &mut result).await;
        }

        self.finish(result)
    }

    async fn verify_with_history(
        &self,
        trace: &Trace,
        session: Option<&SessionState>,
    ) -> Result<VerifyResponse, TransportError> {
        let Some(session) = session else {
            if let Some(session_id) = trace.session_id() {
                tracing::debug!(
                    execution_id = %trace.execution_id(),
                    session_id,
                    "Session not registered, verifying without history"
                );
            }
            return self.call_verify(trace, None).await;
        };

        let mut window = session.lock_window().await;
        let history = window.snapshot();
        let outcome = self.call_verify(trace, Some(history)).await;
        window.append(ConversationTurn::new(
            trace.task(),
            trace.input().clone(),
            trace.output().clone(),
        ));
        outcome
    }

    async fn call_verify(
        &self,
        trace: &Trace,
        conversation_history: Option<Vec<ConversationTurn>>,
    ) -> Result<VerifyResponse, TransportError> {
        let request = VerifyRequest {
            trace,
            conversation_history,
        };
        self.backend.verify(&request, self.settings.timeout).await
    }

    async fn apply_correction(&self, trace: &Trace, result: &mut GuardResult) {
        let reason = match &result.explanation {
            Some(explanation) => explanation.clone(),
            None => format!(
                "confidence {:.3} resulted in {}",
                result.confidence.unwrap_or_default(),
                result.action
            ),
        };
        let request = CorrectionRequest { trace, reason };

        match self
            .backend
            .correct(&request, self.settings.correction_timeout)
            .await
        {
            Ok(correction) => {
                let original = std::mem::replace(&mut result.output, correction.corrected_output);
                result.original_output = Some(original);
                result.corrections = Some(correction.corrections);
                result.corrected = true;
                tracing::info!(
                    execution_id = %trace.execution_id(),
                    action = %result.action,
                    "Output corrected"
                );
            }
            Err(e) => {
                tracing::warn!(
                    execution_id = %trace.execution_id(),
                    timeout = e.is_timeout(),
                    error = %e,
                    action = %result.action,
                    "Correction failed, keeping pre-correction action"
                );
            }
        }
    }

    fn finish(&self, result: GuardResult) -> Result<GuardResult, GuardError> {
        let result = match self.settings.transparency {
            Transparency::Opaque => result.into_opaque(),
            Transparency::Transparent => result,
        };

        if result.action == Action::Block && !result.corrected {
            tracing::info!(
                execution_id = %result.execution_id,
                confidence = ?result.confidence,
                "Output blocked"
            );
            return Err(GuardError::Blocked(Box::new(result)));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{
        finalized_trace, session_trace, CorrectionScript, ScriptedBackend, VerifyScript,
    };
    use serde_json::json;

    fn settings() -> VerifierSettings {
        VerifierSettings::from(&GuardConfig {
            mode: agentguard_core::Mode::Sync,
            ..GuardConfig::default()
        })
    }

    fn client(backend: Arc<ScriptedBackend>, settings: VerifierSettings) -> VerificationClient {
        VerificationClient::new(backend, Arc::new(SessionManager::new(3)), settings)
    }

    #[tokio::test]
    async fn test_high_confidence_passes_without_correction() {
        let backend = Arc::new(ScriptedBackend::confidence(0.9));
        let settings = VerifierSettings {
            correction: CorrectionMode::Cascade,
            ..settings()
        };
        let result = client(backend.clone(), settings)
            .verify(finalized_trace("t"))
            .await
            .unwrap();

        assert_eq!(result.action, Action::Pass);
        assert_eq!(result.confidence, Some(0.9));
        assert!(!result.corrected);
        assert_eq!(result.output, json!("raw answer"));
        assert_eq!(backend.verify_calls(), 1);
        assert_eq!(backend.correct_calls(), 0);
    }

    #[tokio::test]
    async fn test_low_confidence_without_correction_blocks() {
        let backend = Arc::new(ScriptedBackend::confidence(0.2));
        let err = client(backend.clone(), settings())
            .verify(finalized_trace("t"))
            .await
            .unwrap_err();

        let result = err.blocked_result().expect("expected block");
        assert_eq!(result.action, Action::Block);
        assert_eq!(result.confidence, Some(0.2));
        assert_eq!(backend.correct_calls(), 0);
    }

    #[tokio::test]
    async fn test_flag_is_returned_not_raised() {
        let backend = Arc::new(ScriptedBackend::confidence(0.6));
        let result = client(backend, settings())
            .verify(finalized_trace("t"))
            .await
            .unwrap();
        assert_eq!(result.action, Action::Flag);
    }

    #[tokio::test]
    async fn test_cascade_correction_replaces_blocked_output() {
        let backend = Arc::new(ScriptedBackend::confidence(0.1));
        let settings = VerifierSettings {
            correction: CorrectionMode::Cascade,
            transparency: Transparency::Transparent,
            ..settings()
        };
        let result = client(backend.clone(), settings.clone())
            .verify(finalized_trace("t"))
            .await
            .expect("corrected output must not block");

        assert!(result.corrected);
        assert_eq!(result.action, Action::Block);
        assert_eq!(result.output, json!("corrected"));
        assert_eq!(result.original_output, Some(json!("raw answer")));
        assert_eq!(result.corrections.as_ref().map(Vec::len), Some(1));
        assert_eq!(backend.correct_calls(), 1);
        assert_eq!(
            backend.correction_timeouts.lock().unwrap()[0],
            settings.correction_timeout
        );
        assert_eq!(backend.verify_timeouts.lock().unwrap()[0], settings.timeout);
    }

    #[tokio::test]
    async fn test_opaque_strips_correction_details() {
        let backend = Arc::new(ScriptedBackend::confidence(0.4));
        let settings = VerifierSettings {
            correction: CorrectionMode::Cascade,
            transparency: Transparency::Opaque,
            ..settings()
        };
        let result = client(backend, settings)
            .verify(finalized_trace("t"))
            .await
            .unwrap();

        assert!(result.corrected);
        assert_eq!(result.output, json!("corrected"));
        assert!(result.original_output.is_none());
        assert!(result.corrections.is_none());
    }

    #[tokio::test]
    async fn test_correction_failure_falls_back_to_block() {
        let backend = Arc::new(ScriptedBackend::new(
            VerifyScript::Confidence(0.1),
            CorrectionScript::Timeout,
        ));
        let settings = VerifierSettings {
            correction: CorrectionMode::Cascade,
            ..settings()
        };
        let err = client(backend.clone(), settings)
            .verify(finalized_trace("t"))
            .await
            .unwrap_err();

        let result = err.blocked_result().expect("expected block");
        assert!(!result.corrected);
        assert_eq!(result.output, json!("raw answer"));
        assert_eq!(backend.correct_calls(), 1);
    }

    #[tokio::test]
    async fn test_correction_failure_keeps_flag() {
        let backend = Arc::new(ScriptedBackend::new(
            VerifyScript::Confidence(0.6),
            CorrectionScript::ApiError(500),
        ));
        let settings = VerifierSettings {
            correction: CorrectionMode::Cascade,
            ..settings()
        };
        let result = client(backend, settings)
            .verify(finalized_trace("t"))
            .await
            .unwrap();

        assert_eq!(result.action, Action::Flag);
        assert!(!result.corrected);
    }

    #[tokio::test]
    async fn test_verify_timeout_fails_open_as_flag() {
        let backend = Arc::new(ScriptedBackend::new(
            VerifyScript::Timeout,
            CorrectionScript::Output(json!("unused")),
        ));
        let settings = VerifierSettings {
            correction: CorrectionMode::Cascade,
            ..settings()
        };
        let result = client(backend.clone(), settings)
            .verify(finalized_trace("t"))
            .await
            .unwrap();

        assert_eq!(result.action, Action::Flag);
        assert_eq!(result.confidence, None);
        assert_eq!(result.output, json!("raw answer"));
        assert_eq!(backend.correct_calls(), 0);
    }

    #[tokio::test]
    async fn test_verify_failure_fails_closed_when_configured() {
        let backend = Arc::new(ScriptedBackend::new(
            VerifyScript::ApiError(500),
            CorrectionScript::Output(json!("unused")),
        ));
        let settings = VerifierSettings {
            verify_failure: VerifyFailurePolicy::FailClosed,
            ..settings()
        };
        let err = client(backend, settings)
            .verify(finalized_trace("t"))
            .await
            .unwrap_err();

        let result = err.blocked_result().expect("expected block");
        assert_eq!(result.action, Action::Block);
        assert_eq!(result.confidence, None);
    }

    #[tokio::test]
    async fn test_session_history_is_sent_and_appended_regardless_of_outcome() {
        let backend = Arc::new(ScriptedBackend::confidence(0.2));
        let sessions = Arc::new(SessionManager::new(3));
        let client = VerificationClient::new(backend.clone(), sessions.clone(), settings());
        sessions.open("test-bot", Some("s-1".to_string()), serde_json::Map::new());

        for i in 1..=4u64 {
            let result = client.verify(session_trace(&format!("turn {i}"), "s-1", i)).await;
            assert!(result.is_err(), "every turn blocks at confidence 0.2");
        }

        let bodies = backend.verify_bodies.lock().unwrap().clone();
        assert_eq!(bodies.len(), 4);
        assert_eq!(bodies[0]["conversation_history"], json!([]));
        assert_eq!(bodies[1]["conversation_history"][0]["task"], "turn 1");
        let last_history = bodies[3]["conversation_history"].as_array().unwrap();
        assert_eq!(last_history.len(), 3);
        assert_eq!(last_history[0]["task"], "turn 1");
        assert_eq!(last_history[2]["output"], "turn 3 output");

        let window: Vec<String> = sessions
            .get("s-1")
            .unwrap()
            .snapshot()
            .await
            .into_iter()
            .map(|t| t.task)
            .collect();
        assert_eq!(window, vec!["turn 2", "turn 3", "turn 4"]);
    }

    #[tokio::test]
    async fn test_trace_without_session_sends_no_history() {
        let backend = Arc::new(ScriptedBackend::confidence(0.95));
        client(backend.clone(), settings())
            .verify(finalized_trace("t"))
            .await
            .unwrap();

        let bodies = backend.verify_bodies.lock().unwrap().clone();
        assert!(bodies[0].get("conversation_history").is_none());
        assert!(bodies[0].get("session_id").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_turns_on_one_session_serialize() {
        let backend = Arc::new(ScriptedBackend::confidence(0.9));
        let sessions = Arc::new(SessionManager::new(10));
        let client = Arc::new(VerificationClient::new(
            backend.clone(),
            sessions.clone(),
            settings(),
        ));
        sessions.open("test-bot", Some("shared".to_string()), serde_json::Map::new());

        let turns = (1..=5u64).map(|i| {
            let client = client.clone();
            async move { client.verify(session_trace(&format!("turn {i}"), "shared", i)).await }
        });
        for result in futures::future::join_all(turns).await {
            assert!(result.is_ok());
        }

        let mut history_lengths: Vec<usize> = backend
            .verify_bodies
            .lock()
            .unwrap()
            .iter()
            .map(|b| b["conversation_history"].as_array().unwrap().len())
            .collect();
        history_lengths.sort_unstable();
        assert_eq!(history_lengths, vec![0, 1, 2, 3, 4]);
        assert_eq!(sessions.get("shared").unwrap().snapshot().await.len(), 5);
    }

    #[tokio::test]
    async fn test_discarded_session_is_not_recreated() {
        let backend = Arc::new(ScriptedBackend::confidence(0.9));
        let sessions = Arc::new(SessionManager::new(5));
        let client = VerificationClient::new(backend.clone(), sessions.clone(), settings());
        let state = sessions.open("test-bot", Some("s".to_string()), serde_json::Map::new());

        client.verify(session_trace("turn 1", "s", 1)).await.unwrap();
        assert!(sessions.discard("s"));
        client.verify(session_trace("turn 2", "s", 2)).await.unwrap();

        assert!(sessions.get("s").is_none());
        assert!(sessions.is_empty());
        assert_eq!(state.snapshot().await.len(), 1);
        let bodies = backend.verify_bodies.lock().unwrap().clone();
        assert!(bodies[1].get("conversation_history").is_none());
        assert_eq!(bodies[1]["session_id"], "s");
    }

    #[tokio::test]
    async fn test_verify_in_session_uses_the_given_state() {
        let backend = Arc::new(ScriptedBackend::confidence(0.9));
        let sessions = Arc::new(SessionManager::new(5));
        let client = VerificationClient::new(backend.clone(), sessions.clone(), settings());
        let state = sessions.open("test-bot", Some("s".to_string()), serde_json::Map::new());
        sessions.discard("s");

        for i in 1..=2u64 {
            client
                .verify_in_session(session_trace(&format!("turn {i}"), "s", i), Some(state.clone()))
                .await
                .unwrap();
        }

        assert!(sessions.get("s").is_none());
        let tasks: Vec<String> = state.snapshot().await.into_iter().map(|t| t.task).collect();
        assert_eq!(tasks, vec!["turn 1", "turn 2"]);
        let bodies = backend.verify_bodies.lock().unwrap().clone();
        assert_eq!(bodies[1]["conversation_history"][0]["task"], "turn 1");
    }
}
