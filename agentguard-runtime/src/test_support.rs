//! In-process backend doubles (no HTTP).

use agentguard_core::{
    CorrectionRequest, CorrectionResponse, GuardBackend, StepKind, Trace, TraceRecorder,
    TransportError, VerifyRequest, VerifyResponse,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

#[derive(Debug, Clone)]
pub enum VerifyScript {
    Confidence(f64),
    Timeout,
    ApiError(u16),
}

#[derive(Debug, Clone)]
pub enum CorrectionScript {
    Output(serde_json::Value),
    Timeout,
    ApiError(u16),
}

/// Backend that answers from a fixed script and records what it was sent.
pub struct ScriptedBackend {
    verify: VerifyScript,
    correction: CorrectionScript,
    ingest_failures_left: AtomicUsize,
    ingest_delay: Duration,
    pub verify_calls: AtomicUsize,
    pub correct_calls: AtomicUsize,
    pub ingest_calls: AtomicUsize,
    pub verify_bodies: Mutex<Vec<serde_json::Value>>,
    pub correction_timeouts: Mutex<Vec<Duration>>,
    pub verify_timeouts: Mutex<Vec<Duration>>,
    pub batches: Mutex<Vec<Vec<String>>>,
}

impl ScriptedBackend {
    pub fn new(verify: VerifyScript, correction: CorrectionScript) -> Self {
        Self {
            verify,
            correction,
            ingest_failures_left: AtomicUsize::new(0),
            ingest_delay: Duration::ZERO,
            verify_calls: AtomicUsize::new(0),
            correct_calls: AtomicUsize::new(0),
            ingest_calls: AtomicUsize::new(0),
            verify_bodies: Mutex::new(Vec::new()),
            correction_timeouts: Mutex::new(Vec::new()),
            verify_timeouts: Mutex::new(Vec::new()),
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn confidence(confidence: f64) -> Self {
        Self::new(
            VerifyScript::Confidence(confidence),
            CorrectionScript::Output(json!("corrected")),
        )
    }

    /// Ingest fails for the first `n` attempts, then succeeds.
    pub fn failing_ingest(n: usize) -> Self {
        let backend = Self::confidence(1.0);
        backend.ingest_failures_left.store(n, Ordering::SeqCst);
        backend
    }

    /// Every ingest call takes `delay` before answering.
    pub fn slow_ingest(delay: Duration) -> Self {
        Self {
            ingest_delay: delay,
            ..Self::confidence(1.0)
        }
    }

    pub fn verify_calls(&self) -> usize {
        self.verify_calls.load(Ordering::SeqCst)
    }

    pub fn correct_calls(&self) -> usize {
        self.correct_calls.load(Ordering::SeqCst)
    }

    pub fn ingest_calls(&self) -> usize {
        self.ingest_calls.load(Ordering::SeqCst)
    }

    pub fn delivered_batches(&self) -> Vec<Vec<String>> {
        self.batches.lock().unwrap().clone()
    }
}

fn timeout(endpoint: &'static str, timeout: Duration) -> TransportError {
    TransportError::Timeout {
        endpoint,
        timeout_ms: timeout.as_millis(),
    }
}

#[async_trait]
impl GuardBackend for ScriptedBackend {
    async fn verify(
        &self,
        request: &VerifyRequest<'_>,
        t: Duration,
    ) -> Result<VerifyResponse, TransportError> {
        self.verify_calls.fetch_add(1, Ordering::SeqCst);
        self.verify_timeouts.lock().unwrap().push(t);
        self.verify_bodies
            .lock()
            .unwrap()
            .push(serde_json::to_value(request).unwrap());
        match &self.verify {
            VerifyScript::Confidence(c) => Ok(VerifyResponse {
                confidence: *c,
                explanation: None,
            }),
            VerifyScript::Timeout => Err(timeout("/v1/verify", t)),
            VerifyScript::ApiError(code) => Err(TransportError::Api {
                code: *code,
                message: "scripted failure".to_string(),
            }),
        }
    }

    async fn correct(
        &self,
        _request: &CorrectionRequest<'_>,
        t: Duration,
    ) -> Result<CorrectionResponse, TransportError> {
        self.correct_calls.fetch_add(1, Ordering::SeqCst);
        self.correction_timeouts.lock().unwrap().push(t);
        match &self.correction {
            CorrectionScript::Output(output) => Ok(CorrectionResponse {
                corrected_output: output.clone(),
                corrections: vec![json!({"reason": "scripted"})],
            }),
            CorrectionScript::Timeout => Err(timeout("/v1/correct", t)),
            CorrectionScript::ApiError(code) => Err(TransportError::Api {
                code: *code,
                message: "scripted failure".to_string(),
            }),
        }
    }

    async fn ingest_batch(&self, events: &[Trace], _t: Duration) -> Result<(), TransportError> {
        self.ingest_calls.fetch_add(1, Ordering::SeqCst);
        if !self.ingest_delay.is_zero() {
            tokio::time::sleep(self.ingest_delay).await;
        }
        let fail = self
            .ingest_failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if fail {
            return Err(TransportError::Api {
                code: 503,
                message: "unavailable".to_string(),
            });
        }
        self.batches
            .lock()
            .unwrap()
            .push(events.iter().map(|t| t.task().to_string()).collect());
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn finalized_trace(task: &str) -> Trace {
    let mut recorder = TraceRecorder::start("test-bot", task, json!("input"));
    recorder
        .step("generate", StepKind::Llm, json!("prompt"), json!("text"))
        .unwrap();
    recorder.finalize(json!("raw answer")).unwrap()
}

pub fn session_trace(task: &str, session_id: &str, sequence: u64) -> Trace {
    let mut recorder = TraceRecorder::start("test-bot", task, json!(format!("{task} input")));
    recorder.set_session(session_id, sequence).unwrap();
    recorder.finalize(json!(format!("{task} output"))).unwrap()
}
