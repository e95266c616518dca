//! Worker client: drives one training job through compute, request, wait,
//! transmit and report rounds against the scheduler and the data sink.

mod client;
mod workload;

pub use client::{connect_with_retry, RoundReport, RunSummary, WorkerClient, WorkerPhase};
pub use workload::{DenseLayer, FixedDelay, Workload, DEFAULT_BATCH};
