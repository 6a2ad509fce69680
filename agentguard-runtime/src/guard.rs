//! Long-lived client object that owns delivery, sessions and verification.
//!
//! `AgentGuard::new` validates configuration and starts the background
//! delivery worker; `close` stops it after a bounded drain. Instrumentation
//! is scoped: a `TraceScope` is finalized and dispatched on every exit path,
//! including early returns and `?`, where `Drop` ships the trace with an
//! error marker.

use agentguard_core::{
    ConversationTurn, GuardBackend, GuardConfig, GuardError, GuardResult, HttpTransport, Mode,
    StepKind, Trace, TraceRecorder,
};
use serde::Serialize;
use std::future::Future;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::delivery::{self, DeliveryQueue, DeliverySettings, DeliveryStats};
use crate::session::{SessionManager, SessionState};
use crate::verifier::{VerificationClient, VerifierSettings};

/// Failure of a `run` call: either the wrapped agent or the guard itself.
#[derive(Error, Debug)]
pub enum RunError<E> {
    #[error("Agent failed: {0}")]
    Agent(E),

    #[error(transparent)]
    Guard(#[from] GuardError),
}

/// Client handle for one agent process.
///
/// Only `close().await` guarantees that pending traces are drained. Dropping
/// the guard signals the worker to drain, but a runtime that is shutting down
/// may cancel it first.
pub struct AgentGuard {
    config: Arc<GuardConfig>,
    backend: Arc<dyn GuardBackend>,
    queue: DeliveryQueue,
    sessions: Arc<SessionManager>,
    verifier: VerificationClient,
    shutdown_tx: broadcast::Sender<()>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AgentGuard {
    /// Connect to the service at `config.api_url` over HTTP.
    pub fn new(api_key: impl Into<String>, config: GuardConfig) -> Result<Self, GuardError> {
        config.validate()?;
        let transport = HttpTransport::new(api_key, config.base_url())?;
        Self::with_backend(config, Arc::new(transport))
    }

    /// Build on an arbitrary backend. Must be called inside a tokio runtime.
    pub fn with_backend(
        config: GuardConfig,
        backend: Arc<dyn GuardBackend>,
    ) -> Result<Self, GuardError> {
        config.validate()?;
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            GuardError::InvalidState(
                "AgentGuard must be constructed inside a tokio runtime".to_string(),
            )
        })?;

        let queue = DeliveryQueue::new(DeliverySettings::from(&config));
        let sessions = Arc::new(SessionManager::new(config.conversation_window_size));
        let verifier = VerificationClient::new(
            backend.clone(),
            sessions.clone(),
            VerifierSettings::from(&config),
        );

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker = runtime.spawn(delivery::run_flush_worker(
            queue.clone(),
            backend.clone(),
            shutdown_rx,
        ));

        tracing::info!(
            mode = ?config.mode,
            correction = ?config.correction,
            backend = backend.name(),
            "AgentGuard started"
        );

        Ok(Self {
            config: Arc::new(config),
            backend,
            queue,
            sessions,
            verifier,
            shutdown_tx,
            worker: Mutex::new(Some(worker)),
        })
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    /// Start a scoped trace.
    pub fn trace(
        &self,
        agent_id: impl Into<String>,
        task: impl Into<String>,
        input: impl Serialize,
    ) -> Result<TraceScope<'_>, GuardError> {
        let input = serde_json::to_value(input)?;
        Ok(TraceScope::new(
            self,
            TraceRecorder::start(agent_id, task, input),
            None,
        ))
    }

    /// Run `f` under a trace and dispatch its outcome.
    ///
    /// An agent error is recorded on the trace, queued for delivery and
    /// returned as `RunError::Agent`.
    pub async fn run<F, Fut, T, E>(
        &self,
        agent_id: &str,
        task: &str,
        input: impl Serialize,
        f: F,
    ) -> Result<GuardResult, RunError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        T: Serialize,
        E: std::fmt::Display,
    {
        let scope = self.trace(agent_id, task, input)?;
        match f().await {
            Ok(output) => Ok(scope.record(output).await?),
            Err(e) => {
                scope.fail(&e)?;
                Err(RunError::Agent(e))
            }
        }
    }

    /// Open or re-attach to a session.
    pub fn session(&self, agent_id: &str, session_id: Option<String>) -> Session<'_> {
        self.session_with_metadata(agent_id, session_id, serde_json::Map::new())
    }

    /// Open a session whose metadata is merged into every trace it starts.
    pub fn session_with_metadata(
        &self,
        agent_id: &str,
        session_id: Option<String>,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Session<'_> {
        Session {
            guard: self,
            state: self.sessions.open(agent_id, session_id, metadata),
        }
    }

    pub fn discard_session(&self, session_id: &str) -> bool {
        self.sessions.discard(session_id)
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Dispatch a finalized trace according to `mode`.
    ///
    /// A session id on the trace is resolved against the registry; a
    /// discarded session contributes no history and records no turn.
    pub async fn submit(&self, trace: Trace) -> Result<GuardResult, GuardError> {
        let session = trace.session_id().and_then(|id| self.sessions.get(id));
        self.dispatch(trace, session).await
    }

    async fn dispatch(
        &self,
        trace: Trace,
        session: Option<Arc<SessionState>>,
    ) -> Result<GuardResult, GuardError> {
        trace.ensure_sealed()?;
        match self.config.mode {
            Mode::Sync => self.verifier.verify_in_session(trace, session).await,
            Mode::Async => {
                if let Some(session) = &session {
                    remember_turn(session, &trace).await;
                }
                let result = GuardResult::unverified(trace.execution_id(), trace.output().clone());
                self.queue.enqueue(trace);
                Ok(result)
            }
        }
    }

    /// Queue a trace for best-effort delivery without verifying it.
    pub fn enqueue(&self, trace: Trace) -> bool {
        self.queue.enqueue(trace)
    }

    /// Deliver everything pending now.
    pub async fn flush(&self) -> usize {
        self.queue.flush(self.backend.as_ref()).await
    }

    pub fn delivery_stats(&self) -> DeliveryStats {
        self.queue.stats()
    }

    /// Stop the delivery worker after a final bounded drain. Idempotent.
    pub async fn close(&self) {
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(worker) = worker else {
            return;
        };

        let _ = self.shutdown_tx.send(());
        if let Err(e) = worker.await {
            tracing::warn!(error = %e, "Trace delivery worker ended abnormally");
        }
        tracing::info!(stats = ?self.queue.stats(), "AgentGuard closed");
    }
}

async fn remember_turn(session: &SessionState, trace: &Trace) {
    session
        .append(ConversationTurn::new(
            trace.task(),
            trace.input().clone(),
            trace.output().clone(),
        ))
        .await;
}

impl Drop for AgentGuard {
    fn drop(&mut self) {
        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if worker.is_some() {
            // Without an await point the worker drains on its own after the signal.
            let _ = self.shutdown_tx.send(());
            tracing::debug!("AgentGuard dropped without close()");
        }
    }
}

// ============================================================================
// TraceScope
// ============================================================================

/// A trace in progress, bound to the guard that will dispatch it.
pub struct TraceScope<'g> {
    guard: &'g AgentGuard,
    recorder: TraceRecorder,
    session: Option<Arc<SessionState>>,
}

impl<'g> TraceScope<'g> {
    fn new(
        guard: &'g AgentGuard,
        recorder: TraceRecorder,
        session: Option<Arc<SessionState>>,
    ) -> Self {
        Self {
            guard,
            recorder,
            session,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.recorder.execution_id()
    }

    pub fn step(
        &mut self,
        name: impl Into<String>,
        kind: StepKind,
        input: impl Serialize,
        output: impl Serialize,
    ) -> Result<(), GuardError> {
        let input = serde_json::to_value(input)?;
        let output = serde_json::to_value(output)?;
        self.recorder.step(name, kind, input, output)
    }

    pub fn step_with_metadata(
        &mut self,
        name: impl Into<String>,
        kind: StepKind,
        input: impl Serialize,
        output: impl Serialize,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), GuardError> {
        let input = serde_json::to_value(input)?;
        let output = serde_json::to_value(output)?;
        self.recorder
            .step_with_metadata(name, kind, input, output, metadata)
    }

    pub fn set_metadata(
        &mut self,
        key: impl Into<String>,
        value: impl Serialize,
    ) -> Result<(), GuardError> {
        self.recorder.set_metadata(key, serde_json::to_value(value)?)
    }

    pub fn set_ground_truth(&mut self, ground_truth: impl Serialize) -> Result<(), GuardError> {
        self.recorder
            .set_ground_truth(serde_json::to_value(ground_truth)?)
    }

    pub fn set_schema(&mut self, schema: impl Serialize) -> Result<(), GuardError> {
        self.recorder.set_schema(serde_json::to_value(schema)?)
    }

    pub fn set_token_count(&mut self, tokens: u64) -> Result<(), GuardError> {
        self.recorder.set_token_count(tokens)
    }

    pub fn set_cost_estimate(&mut self, cost: f64) -> Result<(), GuardError> {
        self.recorder.set_cost_estimate(cost)
    }

    pub fn set_parent_execution_id(&mut self, parent: Uuid) -> Result<(), GuardError> {
        self.recorder.set_parent_execution_id(parent)
    }

    /// Finalize with `output` and dispatch per mode.
    pub async fn record(mut self, output: impl Serialize) -> Result<GuardResult, GuardError> {
        let output = serde_json::to_value(output)?;
        let trace = self.recorder.finalize(output)?;
        let session = self.session.take();
        self.guard.dispatch(trace, session).await
    }

    /// Finalize as failed and queue for delivery.
    pub fn fail(mut self, error: impl std::fmt::Display) -> Result<(), GuardError> {
        let trace = self.recorder.fail(error)?;
        self.guard.enqueue(trace);
        Ok(())
    }
}

impl Drop for TraceScope<'_> {
    fn drop(&mut self) {
        if self.recorder.is_finalized() {
            return;
        }
        if let Ok(trace) = self.recorder.fail("trace scope exited without recording output") {
            tracing::debug!(
                execution_id = %trace.execution_id(),
                "Trace scope dropped before record, shipping as failed"
            );
            self.guard.enqueue(trace);
        }
    }
}

// ============================================================================
// Session
// ============================================================================

/// Handle for submitting turns that share conversation history.
pub struct Session<'g> {
    guard: &'g AgentGuard,
    state: Arc<SessionState>,
}

impl<'g> Session<'g> {
    pub fn session_id(&self) -> &str {
        self.state.session_id()
    }

    pub fn agent_id(&self) -> &str {
        self.state.agent_id()
    }

    /// Turns started on this session so far.
    pub fn sequence(&self) -> u64 {
        self.state.sequence()
    }

    pub async fn history(&self) -> Vec<ConversationTurn> {
        self.state.snapshot().await
    }

    /// Start the next turn. The turn is recorded against this handle's
    /// session even if it has since been discarded. Session metadata is applied first so per-turn
    /// `set_metadata` calls override it.
    pub fn trace(
        &self,
        task: impl Into<String>,
        input: impl Serialize,
    ) -> Result<TraceScope<'g>, GuardError> {
        let input = serde_json::to_value(input)?;
        let mut recorder = TraceRecorder::start(self.state.agent_id(), task, input);
        recorder.set_session(self.state.session_id(), self.state.next_sequence())?;
        for (key, value) in self.state.metadata() {
            recorder.set_metadata(key.clone(), value.clone())?;
        }
        Ok(TraceScope::new(
            self.guard,
            recorder,
            Some(self.state.clone()),
        ))
    }
}
