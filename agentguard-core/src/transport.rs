//! Transport to the remote verification service.
//!
//! Provides a `GuardBackend` trait with one implementation:
//! - **HttpTransport**: JSON over HTTP to `/v1/verify`, `/v1/correct` and
//!   `/v1/ingest/batch`, authenticated with the `X-AgentGuard-Key` header.
//!
//! Every call takes an explicit deadline. An exceeded deadline surfaces as
//! `TransportError::Timeout`, never as a generic HTTP error. Calls are single
//! attempts; retrying is the caller's decision.

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

use crate::models::{ConversationTurn, Trace};

pub const API_KEY_HEADER: &str = "X-AgentGuard-Key";
pub const VERIFY_PATH: &str = "/v1/verify";
pub const CORRECT_PATH: &str = "/v1/correct";
pub const INGEST_BATCH_PATH: &str = "/v1/ingest/batch";

// ============================================================================
// GuardBackend trait
// ============================================================================

/// Abstraction over the remote verification service.
#[async_trait]
pub trait GuardBackend: Send + Sync {
    /// Score a finalized trace.
    async fn verify(
        &self,
        request: &VerifyRequest<'_>,
        timeout: Duration,
    ) -> Result<VerifyResponse, TransportError>;

    /// Ask the service to rewrite an unreliable output.
    async fn correct(
        &self,
        request: &CorrectionRequest<'_>,
        timeout: Duration,
    ) -> Result<CorrectionResponse, TransportError>;

    /// Deliver a batch of traces for offline analysis.
    async fn ingest_batch(&self, events: &[Trace], timeout: Duration)
        -> Result<(), TransportError>;

    /// Backend name for logging.
    fn name(&self) -> &str;
}

// ============================================================================
// Error types
// ============================================================================

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{endpoint} timed out after {timeout_ms}ms")]
    Timeout {
        endpoint: &'static str,
        timeout_ms: u128,
    },

    #[error("API error ({code}): {message}")]
    Api { code: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Missing API key")]
    MissingApiKey,
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout { .. })
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
pub struct VerifyRequest<'a> {
    #[serde(flatten)]
    pub trace: &'a Trace,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_history: Option<Vec<ConversationTurn>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub confidence: f64,
    #[serde(default)]
    pub explanation: Option<String>,
}

impl VerifyResponse {
    pub fn validate(&self) -> Result<(), TransportError> {
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(TransportError::InvalidResponse(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub struct CorrectionRequest<'a> {
    pub trace: &'a Trace,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionResponse {
    pub corrected_output: serde_json::Value,
    #[serde(default)]
    pub corrections: Vec<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct IngestBatch<'a> {
    events: &'a [Trace],
}

// ============================================================================
// HttpTransport
// ============================================================================

/// HTTP client for the verification service.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    api_key: String,
    base_url: String,
}

impl HttpTransport {
    pub fn new(api_key: impl Into<String>, base_url: &str) -> Result<Self, TransportError> {
        let api_key = api_key.into();
        if api_key.is_empty() {
            return Err(TransportError::MissingApiKey);
        }

        let client = Client::builder().build()?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// POST `body` and return the response once it has a 2xx status.
    async fn post<B>(
        &self,
        endpoint: &'static str,
        body: &B,
        timeout: Duration,
    ) -> Result<reqwest::Response, TransportError>
    where
        B: Serialize + ?Sized,
    {
        let url = format!("{}{}", self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, &self.api_key)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| classify(e, endpoint, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            tracing::warn!(
                endpoint,
                code = status.as_u16(),
                message = %message,
                "AgentGuard API error"
            );
            return Err(TransportError::Api {
                code: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }

    async fn post_json<B, R>(
        &self,
        endpoint: &'static str,
        body: &B,
        timeout: Duration,
    ) -> Result<R, TransportError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let call = async {
            self.post(endpoint, body, timeout)
                .await?
                .json::<R>()
                .await
                .map_err(|e| classify(e, endpoint, timeout))
        };
        with_deadline(endpoint, timeout, call).await
    }
}

#[async_trait]
impl GuardBackend for HttpTransport {
    async fn verify(
        &self,
        request: &VerifyRequest<'_>,
        timeout: Duration,
    ) -> Result<VerifyResponse, TransportError> {
        let response: VerifyResponse = self.post_json(VERIFY_PATH, request, timeout).await?;
        response.validate()?;
        Ok(response)
    }

    async fn correct(
        &self,
        request: &CorrectionRequest<'_>,
        timeout: Duration,
    ) -> Result<CorrectionResponse, TransportError> {
        self.post_json(CORRECT_PATH, request, timeout).await
    }

    async fn ingest_batch(
        &self,
        events: &[Trace],
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let batch = IngestBatch { events };
        let call = async {
            self.post(INGEST_BATCH_PATH, &batch, timeout).await?;
            Ok::<(), TransportError>(())
        };
        with_deadline(INGEST_BATCH_PATH, timeout, call).await
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Outer deadline covering connect, send and body read.
async fn with_deadline<T, F>(
    endpoint: &'static str,
    timeout: Duration,
    call: F,
) -> Result<T, TransportError>
where
    F: std::future::Future<Output = Result<T, TransportError>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(timeout_error(endpoint, timeout)),
    }
}

fn classify(err: reqwest::Error, endpoint: &'static str, timeout: Duration) -> TransportError {
    if err.is_timeout() {
        timeout_error(endpoint, timeout)
    } else if err.is_decode() {
        TransportError::InvalidResponse(err.to_string())
    } else {
        TransportError::Http(err)
    }
}

fn timeout_error(endpoint: &'static str, timeout: Duration) -> TransportError {
    TransportError::Timeout {
        endpoint,
        timeout_ms: timeout.as_millis(),
    }
}

// ============================================================================
// TESTS
// ============================================================================
