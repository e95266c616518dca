// rust/arbiter-core/src/lib.rs

//! Shared-link arbiter - core library
//!
//! This crate holds everything both sides of the link arbiter agree on: the
//! control and data wire formats, configuration, error types, connection
//! retry, and the worker-side protocol client.

pub mod config;
pub mod error;
pub mod protocol;
pub mod retry;
pub mod worker;

// Re-export commonly used types for convenience
pub use config::{ArbiterConfig, CompletionPolicy, SchedulerConfig, WorkerConfig};
pub use error::{ArbiterError, Result};
pub use protocol::{ControlMessage, Record};
pub use retry::RetryConfig;
pub use worker::{DenseLayer, FixedDelay, RunSummary, WorkerClient, WorkerPhase, Workload};
