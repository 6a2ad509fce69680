//! Per-execution trace accumulation.
//!
//! A recorder belongs to exactly one execution and is never shared, so it
//! carries no locking. `finalize` hands out a sealed copy and leaves the
//! recorder sealed; every later mutation fails with `InvalidState`.

use std::time::Instant;
use uuid::Uuid;

use crate::error::GuardError;
use crate::models::{StepKind, Trace, TraceEvent};

pub struct TraceRecorder {
    trace: Trace,
    origin: Instant,
    last_mark: Instant,
}

impl TraceRecorder {
    pub fn start(
        agent_id: impl Into<String>,
        task: impl Into<String>,
        input: serde_json::Value,
    ) -> Self {
        let now = Instant::now();
        Self {
            trace: Trace::open(agent_id.into(), task.into(), input),
            origin: now,
            last_mark: now,
        }
    }

    pub fn execution_id(&self) -> Uuid {
        self.trace.execution_id
    }

    pub fn session_id(&self) -> Option<&str> {
        self.trace.session_id.as_deref()
    }

    pub fn is_finalized(&self) -> bool {
        self.trace.sealed
    }

    /// Record a step whose duration runs from the previous step (or start) to now.
    pub fn step(
        &mut self,
        name: impl Into<String>,
        kind: StepKind,
        input: serde_json::Value,
        output: serde_json::Value,
    ) -> Result<(), GuardError> {
        self.step_with_metadata(name, kind, input, output, serde_json::Map::new())
    }

    pub fn step_with_metadata(
        &mut self,
        name: impl Into<String>,
        kind: StepKind,
        input: serde_json::Value,
        output: serde_json::Value,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), GuardError> {
        let name = name.into();
        self.ensure_open(&name)?;

        let now = Instant::now();
        let offset = self.last_mark.duration_since(self.origin);
        let started_at = self.trace.started_at
            + chrono::Duration::from_std(offset).unwrap_or_else(|_| chrono::Duration::zero());

        self.trace.steps.push(TraceEvent {
            name,
            kind,
            input,
            output,
            metadata,
            started_at,
            duration_ms: millis(now.duration_since(self.last_mark)),
        });
        self.last_mark = now;
        Ok(())
    }

    pub fn set_session(&mut self, session_id: impl Into<String>, sequence: u64) -> Result<(), GuardError> {
        self.ensure_open("session")?;
        self.trace.session_id = Some(session_id.into());
        self.trace.sequence = Some(sequence);
        Ok(())
    }

    pub fn set_parent_execution_id(&mut self, parent: Uuid) -> Result<(), GuardError> {
        self.ensure_open("parent_execution_id")?;
        self.trace.parent_execution_id = Some(parent);
        Ok(())
    }

    pub fn set_metadata(
        &mut self,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> Result<(), GuardError> {
        self.ensure_open("metadata")?;
        self.trace.metadata.insert(key.into(), value);
        Ok(())
    }

    pub fn set_ground_truth(&mut self, ground_truth: serde_json::Value) -> Result<(), GuardError> {
        self.ensure_open("ground_truth")?;
        self.trace.ground_truth = Some(ground_truth);
        Ok(())
    }

    pub fn set_schema(&mut self, schema: serde_json::Value) -> Result<(), GuardError> {
        self.ensure_open("schema")?;
        self.trace.schema = Some(schema);
        Ok(())
    }

    pub fn set_token_count(&mut self, tokens: u64) -> Result<(), GuardError> {
        self.ensure_open("token_count")?;
        self.trace.token_count = Some(tokens);
        Ok(())
    }

    pub fn set_cost_estimate(&mut self, cost: f64) -> Result<(), GuardError> {
        self.ensure_open("cost_estimate")?;
        self.trace.cost_estimate = Some(cost);
        Ok(())
    }

    /// Seal the trace with its final output. A second call fails.
    pub fn finalize(&mut self, output: serde_json::Value) -> Result<Trace, GuardError> {
        self.ensure_open("finalize")?;
        self.trace.output = output;
        Ok(self.seal())
    }

    /// Seal the trace for an execution that produced no output.
    pub fn fail(&mut self, error: impl std::fmt::Display) -> Result<Trace, GuardError> {
        self.ensure_open("fail")?;
        self.trace.error = Some(error.to_string());
        Ok(self.seal())
    }

    fn seal(&mut self) -> Trace {
        self.trace.duration_ms = millis(self.origin.elapsed());
        self.trace.sealed = true;
        tracing::debug!(
            execution_id = %self.trace.execution_id,
            agent_id = %self.trace.agent_id,
            steps = self.trace.steps.len(),
            duration_ms = self.trace.duration_ms,
            "Trace finalized"
        );
        self.trace.clone()
    }

    fn ensure_open(&self, operation: &str) -> Result<(), GuardError> {
        if self.trace.sealed {
            return Err(GuardError::InvalidState(format!(
                "trace {} is finalized; cannot apply '{}'",
                self.trace.execution_id, operation
            )));
        }
        Ok(())
    }
}

fn millis(d: std::time::Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}
