//! Async delivery of finalized traces.
//!
//! Producers push onto a shared pending batch without blocking. A single
//! background worker swaps the batch out and ships it to
//! `/v1/ingest/batch` when either `flush_batch_size` traces are pending or
//! `flush_interval_s` has passed since the last flush. Delivery is
//! best-effort: failed batches are retried with backoff, then dropped and
//! logged. Nothing here ever surfaces an error to the instrumented call.

use agentguard_core::{GuardBackend, GuardConfig, Trace, TransportError};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;

/// Delivery counters, readable at any time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryStats {
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub failed_flushes: u64,
    pub pending: usize,
}

/// Settings the queue and its worker read from `GuardConfig`.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    pub flush_interval: Duration,
    pub flush_batch_size: usize,
    pub max_queue_size: usize,
    pub timeout: Duration,
    pub drain_timeout: Duration,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
}

impl From<&GuardConfig> for DeliverySettings {
    fn from(config: &GuardConfig) -> Self {
        Self {
            flush_interval: config.flush_interval(),
            flush_batch_size: config.flush_batch_size,
            max_queue_size: config.max_queue_size,
            timeout: config.timeout(),
            drain_timeout: config.drain_timeout(),
            max_retries: config.max_retries,
            retry_delay_ms: config.retry_delay_ms,
        }
    }
}

struct Shared {
    pending: Mutex<Vec<Trace>>,
    batch_ready: Notify,
    flush_lock: tokio::sync::Mutex<()>,
    settings: DeliverySettings,
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
    failed_flushes: AtomicU64,
}

/// Cloneable handle to the pending batch.
#[derive(Clone)]
pub struct DeliveryQueue {
    shared: Arc<Shared>,
}

impl DeliveryQueue {
    pub fn new(settings: DeliverySettings) -> Self {
        Self {
            shared: Arc::new(Shared {
                pending: Mutex::new(Vec::with_capacity(settings.flush_batch_size)),
                batch_ready: Notify::new(),
                flush_lock: tokio::sync::Mutex::new(()),
                settings,
                enqueued: AtomicU64::new(0),
                delivered: AtomicU64::new(0),
                dropped: AtomicU64::new(0),
                failed_flushes: AtomicU64::new(0),
            }),
        }
    }

    pub fn settings(&self) -> &DeliverySettings {
        &self.shared.settings
    }

    /// Append a finalized trace. Returns `false` when the trace was refused
    /// (unsealed, or the queue is at `max_queue_size`); refusals are logged
    /// and counted, never raised.
    pub fn enqueue(&self, trace: Trace) -> bool {
        if let Err(e) = trace.ensure_sealed() {
            tracing::error!(error = %e, "Refusing to enqueue trace");
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let settings = &self.shared.settings;
        let should_flush = {
            let mut pending = self.lock_pending();
            if pending.len() >= settings.max_queue_size {
                drop(pending);
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    execution_id = %trace.execution_id(),
                    max_queue_size = settings.max_queue_size,
                    "Delivery queue full, dropping trace"
                );
                return false;
            }
            pending.push(trace);
            pending.len() >= settings.flush_batch_size
        };

        self.shared.enqueued.fetch_add(1, Ordering::Relaxed);
        if should_flush {
            self.shared.batch_ready.notify_one();
        }
        true
    }

    /// Swap the pending batch for an empty one.
    pub fn take_batch(&self) -> Vec<Trace> {
        let mut pending = self.lock_pending();
        std::mem::take(&mut *pending)
    }

    pub fn len(&self) -> usize {
        self.lock_pending().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> DeliveryStats {
        DeliveryStats {
            enqueued: self.shared.enqueued.load(Ordering::Relaxed),
            delivered: self.shared.delivered.load(Ordering::Relaxed),
            dropped: self.shared.dropped.load(Ordering::Relaxed),
            failed_flushes: self.shared.failed_flushes.load(Ordering::Relaxed),
            pending: self.len(),
        }
    }

    /// Take everything pending and deliver it in `flush_batch_size` chunks.
    /// Returns the number of traces delivered.
    pub async fn flush(&self, backend: &dyn GuardBackend) -> usize {
        let _serialized = self.shared.flush_lock.lock().await;

        let batch = self.take_batch();
        if batch.is_empty() {
            return 0;
        }

        let mut in_flight = InFlight {
            shared: &self.shared,
            unsettled: batch.len(),
        };
        let mut delivered = 0usize;
        for chunk in batch.chunks(self.shared.settings.flush_batch_size) {
            let outcome = self.send_with_retry(backend, chunk).await;
            in_flight.unsettled -= chunk.len();
            match outcome {
                Ok(()) => {
                    delivered += chunk.len();
                    self.shared
                        .delivered
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    tracing::debug!(
                        batch_size = chunk.len(),
                        backend = backend.name(),
                        "Flushed trace batch"
                    );
                }
                Err(e) => {
                    self.shared.failed_flushes.fetch_add(1, Ordering::Relaxed);
                    self.shared
                        .dropped
                        .fetch_add(chunk.len() as u64, Ordering::Relaxed);
                    tracing::error!(
                        batch_size = chunk.len(),
                        attempts = self.shared.settings.max_retries + 1,
                        error = %e,
                        "Trace batch delivery failed, dropping batch"
                    );
                }
            }
        }
        delivered
    }

    async fn send_with_retry(
        &self,
        backend: &dyn GuardBackend,
        chunk: &[Trace],
    ) -> Result<(), TransportError> {
        let settings = &self.shared.settings;
        let retry_strategy = ExponentialBackoff::from_millis(settings.retry_delay_ms.max(1))
            .max_delay(Duration::from_secs(5))
            .map(jitter)
            .take(settings.max_retries);

        Retry::spawn(retry_strategy, || async move {
            backend.ingest_batch(chunk, settings.timeout).await.map_err(|e| {
                tracing::warn!(batch_size = chunk.len(), error = %e, "Trace batch attempt failed");
                e
            })
        })
        .await
    }

    fn lock_pending(&self) -> MutexGuard<'_, Vec<Trace>> {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Traces taken off the queue by a flush but not yet delivered or dropped.
/// If the flush is cancelled mid-way, whatever is unsettled counts as dropped.
struct InFlight<'a> {
    shared: &'a Shared,
    unsettled: usize,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if self.unsettled == 0 {
            return;
        }
        self.shared
            .dropped
            .fetch_add(self.unsettled as u64, Ordering::Relaxed);
        tracing::warn!(
            unsettled = self.unsettled,
            "Trace flush cancelled, dropping in-flight traces"
        );
    }
}

/// Run the background flush worker until `shutdown` fires, then drain.
///
/// Spawned by `AgentGuard` on construction.
pub async fn run_flush_worker(
    queue: DeliveryQueue,
    backend: Arc<dyn GuardBackend>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let period = queue.settings().flush_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::info!(
        interval_ms = period.as_millis() as u64,
        batch_size = queue.settings().flush_batch_size,
        backend = backend.name(),
        "Trace delivery worker started"
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                queue.flush(backend.as_ref()).await;
            }
            _ = queue.shared.batch_ready.notified() => {
                queue.flush(backend.as_ref()).await;
                ticker.reset();
            }
            _ = shutdown.recv() => {
                break;
            }
        }
    }

    drain(&queue, backend.as_ref()).await;
}

/// Final best-effort flush bounded by `drain_timeout`.
pub async fn drain(queue: &DeliveryQueue, backend: &dyn GuardBackend) {
    let pending = queue.len();
    let drain_timeout = queue.settings().drain_timeout;

    match tokio::time::timeout(drain_timeout, queue.flush(backend)).await {
        Ok(delivered) => {
            tracing::info!(pending, delivered, "Trace delivery worker drained");
        }
        Err(_) => {
            // The cancelled flush has already counted its own batch.
            let remaining = queue.take_batch().len();
            queue
                .shared
                .dropped
                .fetch_add(remaining as u64, Ordering::Relaxed);
            tracing::warn!(
                pending,
                remaining,
                dropped = queue.stats().dropped,
                drain_timeout_ms = drain_timeout.as_millis() as u64,
                "Trace delivery drain timed out"
            );
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
