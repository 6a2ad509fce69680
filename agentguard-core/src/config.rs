use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::GuardError;

pub const DEFAULT_API_URL: &str = "https://api.agentguard.dev";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Buffer traces and deliver them in the background.
    #[default]
    Async,
    /// Verify every trace inline before returning.
    Sync,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionMode {
    #[default]
    None,
    Cascade,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Transparency {
    #[default]
    Opaque,
    Transparent,
}

/// What a sync call does when the verify request itself fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VerifyFailurePolicy {
    /// Return the unverified output flagged.
    #[default]
    FailOpen,
    /// Treat the output as blocked.
    FailClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub pass: f64,
    pub flag: f64,
    pub block: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            pass: 0.8,
            flag: 0.5,
            block: 0.3,
        }
    }
}

impl ThresholdConfig {
    pub fn new(pass: f64, flag: f64, block: f64) -> Result<Self, GuardError> {
        let cfg = Self { pass, flag, block };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        for (name, value) in [("pass", self.pass), ("flag", self.flag), ("block", self.block)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GuardError::Config(format!(
                    "confidence_threshold.{name} must be within [0, 1], got {value}"
                )));
            }
        }
        if !(self.block <= self.flag && self.flag <= self.pass) {
            return Err(GuardError::Config(format!(
                "confidence_threshold must satisfy block <= flag <= pass, got block={} flag={} pass={}",
                self.block, self.flag, self.pass
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    pub api_url: String,
    pub mode: Mode,
    pub correction: CorrectionMode,
    pub transparency: Transparency,
    pub verify_failure: VerifyFailurePolicy,
    pub flush_interval_s: f64,
    pub flush_batch_size: usize,
    pub max_queue_size: usize,
    pub timeout_s: f64,
    pub correction_timeout_s: f64,
    pub drain_timeout_s: f64,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub conversation_window_size: usize,
    pub confidence_threshold: ThresholdConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            mode: Mode::Async,
            correction: CorrectionMode::None,
            transparency: Transparency::Opaque,
            verify_failure: VerifyFailurePolicy::FailOpen,
            flush_interval_s: 1.0,
            flush_batch_size: 50,
            max_queue_size: 10_000,
            timeout_s: 2.0,
            correction_timeout_s: 10.0,
            drain_timeout_s: 5.0,
            max_retries: 3,
            retry_delay_ms: 200,
            conversation_window_size: 10,
            confidence_threshold: ThresholdConfig::default(),
        }
    }
}

impl GuardConfig {
    /// Load from an optional TOML file plus `AGENTGUARD_*` environment
    /// overrides (nested keys use `__`, e.g. `AGENTGUARD_CONFIDENCE_THRESHOLD__PASS`).
    pub fn load(path: &str) -> Result<Self, GuardError> {
        let s = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(
                Environment::with_prefix("AGENTGUARD")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        let config: GuardConfig = s.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        if self.api_url.trim().is_empty() {
            return Err(GuardError::Config("api_url must not be empty".to_string()));
        }
        positive_seconds("flush_interval_s", self.flush_interval_s)?;
        positive_seconds("timeout_s", self.timeout_s)?;
        positive_seconds("correction_timeout_s", self.correction_timeout_s)?;
        positive_seconds("drain_timeout_s", self.drain_timeout_s)?;
        if self.correction_timeout_s <= self.timeout_s {
            return Err(GuardError::Config(format!(
                "correction_timeout_s ({}) must exceed timeout_s ({})",
                self.correction_timeout_s, self.timeout_s
            )));
        }
        if self.flush_batch_size == 0 {
            return Err(GuardError::Config("flush_batch_size must be at least 1".to_string()));
        }
        if self.max_queue_size < self.flush_batch_size {
            return Err(GuardError::Config(format!(
                "max_queue_size ({}) must be at least flush_batch_size ({})",
                self.max_queue_size, self.flush_batch_size
            )));
        }
        if self.max_retries > 10 {
            return Err(GuardError::Config(format!(
                "max_retries must be at most 10, got {}",
                self.max_retries
            )));
        }
        if self.conversation_window_size == 0 {
            return Err(GuardError::Config(
                "conversation_window_size must be at least 1".to_string(),
            ));
        }
        self.confidence_threshold.validate()
    }

    pub fn base_url(&self) -> &str {
        self.api_url.trim_end_matches('/')
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs_f64(self.flush_interval_s)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_s)
    }

    pub fn correction_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.correction_timeout_s)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.drain_timeout_s)
    }
}

fn positive_seconds(name: &str, value: f64) -> Result<(), GuardError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(GuardError::Config(format!(
            "{name} must be a positive number of seconds, got {value}"
        )))
    }
}
