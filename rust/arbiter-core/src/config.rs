// rust/arbiter-core/src/config.rs

//! Configuration for the scheduler and for workers.
//!
//! Both binaries read the same TOML layout, apply `ARB_`-prefixed
//! environment overrides, then apply their command-line flags on top:
//!
//! ```toml
//! [scheduler]
//! bind_address = "0.0.0.0"
//! control_port = 5000
//! data_port = 6000
//! beta = 1.0
//! completion_policy = "lenient"
//!
//! [worker]
//! job_id = "A"
//! scheduler_host = "10.0.0.1"
//! grad_mb = 1.0
//! rounds = 50
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ArbiterError, Result};
use crate::protocol::{DEFAULT_CONTROL_PORT, DEFAULT_DATA_PORT};
use crate::retry::RetryConfig;

// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    pub scheduler: SchedulerConfig,
    pub worker: WorkerConfig,
}

/// How the scheduler treats a completion from a job that does not hold the
/// link.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionPolicy {
    /// Any completion frees the link.
    #[default]
    Lenient,
    /// Only the current holder may free the link; other completions are
    /// logged and rejected.
    Strict,
}

impl FromStr for CompletionPolicy {
    type Err = ArbiterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "lenient" => Ok(Self::Lenient),
            "strict" => Ok(Self::Strict),
            other => Err(ArbiterError::config(format!(
                "unknown completion policy '{other}' (expected 'lenient' or 'strict')"
            ))),
        }
    }
}

impl fmt::Display for CompletionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Lenient => f.write_str("lenient"),
            Self::Strict => f.write_str("strict"),
        }
    }
}

/// Scheduler-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Address both listeners bind to.
    pub bind_address: String,
    /// Control listener port.
    pub control_port: u16,
    /// Data sink listener port.
    pub data_port: u16,
    /// Weight of intensity against the deficit term, in [0, 1].
    pub beta: f64,
    /// Completion handling when the reporter is not the holder.
    pub completion_policy: CompletionPolicy,
    /// Drop a connection's sessions when it closes, releasing the link if
    /// one of them held it.
    pub evict_on_disconnect: bool,
}

/// Worker-side settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Unique job identifier. Required.
    pub job_id: String,
    // Host of the scheduler control endpoint.
    pub scheduler_host: String,
    // Host of the data sink.
    pub receiver_host: String,
    pub control_port: u16,
    pub data_port: u16,
    /// Width of the synthetic model layer.
    pub model_size: usize,
    /// Payload size per round in MiB.
    pub grad_mb: f64,
    /// Number of compute/communicate rounds.
    pub rounds: u64,
    /// Pause between rounds in milliseconds.
    pub round_pause_ms: u64,
    /// Fixed delay between connection attempts in milliseconds.
    pub connect_retry_ms: u64,
    /// Give up waiting for a grant after this many milliseconds. Unset waits
    /// forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_timeout_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            data_port: DEFAULT_DATA_PORT,
            beta: 1.0,
            completion_policy: CompletionPolicy::Lenient,
            evict_on_disconnect: false,
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            job_id: String::new(),
            scheduler_host: "localhost".to_string(),
            receiver_host: "localhost".to_string(),
            control_port: DEFAULT_CONTROL_PORT,
            data_port: DEFAULT_DATA_PORT,
            model_size: 1024,
            grad_mb: 10.0,
            rounds: 100,
            round_pause_ms: 10,
            connect_retry_ms: 1000,
            grant_timeout_ms: None,
        }
    }
}

impl SchedulerConfig {
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.control_port)
    }

    pub fn data_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.data_port)
    }

    pub fn validate(&self) -> Result<()> {
        if self.bind_address.is_empty() {
            return Err(ArbiterError::config("scheduler.bind_address must not be empty"));
        }
        if !(0.0..=1.0).contains(&self.beta) {
            return Err(ArbiterError::config(format!(
                "scheduler.beta must be within [0, 1], got {}",
                self.beta
            )));
        }
        if self.control_port != 0 && self.control_port == self.data_port {
            return Err(ArbiterError::config(
                "scheduler.control_port and scheduler.data_port must differ",
            ));
        }
        Ok(())
    }
}

impl WorkerConfig {
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.scheduler_host, self.control_port)
    }

    pub fn data_addr(&self) -> String {
        format!("{}:{}", self.receiver_host, self.data_port)
    }

    /// Payload size in bytes.
    pub fn payload_size(&self) -> usize {
        (self.grad_mb * 1024.0 * 1024.0) as usize
    }

    pub fn round_pause(&self) -> Duration {
        Duration::from_millis(self.round_pause_ms)
    }

    pub fn grant_timeout(&self) -> Option<Duration> {
        self.grant_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_retry(&self) -> RetryConfig {
        RetryConfig::fixed(Duration::from_millis(self.connect_retry_ms))
    }

    pub fn validate(&self) -> Result<()> {
        if self.job_id.is_empty() {
            return Err(ArbiterError::config("worker.job_id is required"));
        }
        if self.scheduler_host.is_empty() || self.receiver_host.is_empty() {
            return Err(ArbiterError::config(
                "worker.scheduler_host and worker.receiver_host must not be empty",
            ));
        }
        if !self.grad_mb.is_finite() || self.grad_mb < 0.0 {
            return Err(ArbiterError::config(
                "worker.grad_mb must be a non-negative number",
            ));
        }
        if self.model_size == 0 {
            return Err(ArbiterError::config(
                "worker.model_size must be greater than 0",
            ));
        }
        if self.grant_timeout_ms == Some(0) {
            return Err(ArbiterError::config(
                "worker.grant_timeout_ms must be greater than 0 when set",
            ));
        }
        Ok(())
    }
}

impl FromStr for ArbiterConfig {
    type Err = ArbiterError;

    /// Parse configuration from a TOML string.
    fn from_str(s: &str) -> Result<Self> {
        toml::from_str(s)
            .map_err(|e| ArbiterError::config_with_source("failed to parse TOML config", e))
    }
}

impl ArbiterConfig {
    // Load configuration from a TOML file. Validation is left to the binary,
    // which knows which section it runs.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            ArbiterError::io(format!("reading config file '{}'", path.display()), e)
        })?;
        content.parse()
    }

    // Apply environment variable overrides.
    //
    // Variables are prefixed with `ARB_`, followed by the section and field:
    // - `ARB_SCHEDULER_BETA` overrides `scheduler.beta`
    // - `ARB_SCHEDULER_COMPLETION_POLICY` overrides `scheduler.completion_policy`
    // - `ARB_WORKER_JOB_ID` overrides `worker.job_id`
    // - `ARB_WORKER_GRANT_TIMEOUT_MS` overrides `worker.grant_timeout_ms`
    //
    // Values that fail to parse are ignored.
    #[must_use]
    pub fn with_env_overrides(mut self) -> Self {
        // Scheduler overrides
        if let Ok(val) = std::env::var("ARB_SCHEDULER_BIND_ADDRESS") {
            self.scheduler.bind_address = val;
        }
        override_parsed("ARB_SCHEDULER_CONTROL_PORT", &mut self.scheduler.control_port);
        override_parsed("ARB_SCHEDULER_DATA_PORT", &mut self.scheduler.data_port);
        override_parsed("ARB_SCHEDULER_BETA", &mut self.scheduler.beta);
        override_parsed(
            "ARB_SCHEDULER_COMPLETION_POLICY",
            &mut self.scheduler.completion_policy,
        );
        override_parsed(
            "ARB_SCHEDULER_EVICT_ON_DISCONNECT",
            &mut self.scheduler.evict_on_disconnect,
        );

        // Worker overrides
        if let Ok(val) = std::env::var("ARB_WORKER_JOB_ID") {
            self.worker.job_id = val;
        }
        if let Ok(val) = std::env::var("ARB_WORKER_SCHEDULER_HOST") {
            self.worker.scheduler_host = val;
        }
        if let Ok(val) = std::env::var("ARB_WORKER_RECEIVER_HOST") {
            self.worker.receiver_host = val;
        }
        override_parsed("ARB_WORKER_CONTROL_PORT", &mut self.worker.control_port);
        override_parsed("ARB_WORKER_DATA_PORT", &mut self.worker.data_port);
        override_parsed("ARB_WORKER_MODEL_SIZE", &mut self.worker.model_size);
        override_parsed("ARB_WORKER_GRAD_MB", &mut self.worker.grad_mb);
        override_parsed("ARB_WORKER_ROUNDS", &mut self.worker.rounds);
        override_parsed("ARB_WORKER_ROUND_PAUSE_MS", &mut self.worker.round_pause_ms);
        override_parsed("ARB_WORKER_CONNECT_RETRY_MS", &mut self.worker.connect_retry_ms);
        if let Ok(val) = std::env::var("ARB_WORKER_GRANT_TIMEOUT_MS") {
            if let Ok(v) = val.parse() {
                self.worker.grant_timeout_ms = Some(v);
            }
        }

        self
    }
}

fn override_parsed<T: FromStr>(var: &str, target: &mut T) {
    if let Ok(val) = std::env::var(var) {
        if let Ok(v) = val.parse() {
            *target = v;
        }
    }
}
