//! Training-job worker
//!
//! Alternates a synthetic compute step with a gradient-sized transmission,
//! asking the arbitration scheduler for the link before every send.
//!
//! # Usage
//!
//! ```bash
//! # Job "A" against a local scheduler, 1 MiB per round
//! arbiter-worker --job-id A --grad-mb 1
//!
//! # Remote scheduler and sink, bigger model, 50 rounds
//! arbiter-worker --job-id B --scheduler-host 10.0.0.1 --receiver-host 10.0.0.1 \
//!     --model-size 2048 --steps 50
//! ```

use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arbiter_core::{
    ArbiterConfig, ArbiterError, DenseLayer, FixedDelay, RunSummary, WorkerClient, Workload,
};

/// Training-job worker
#[derive(Parser, Debug)]
#[command(name = "arbiter-worker")]
#[command(about = "Computes, requests the shared link, and transmits its payload")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Unique job identifier
    #[arg(long)]
    job_id: Option<String>,

    /// Scheduler host
    #[arg(long)]
    scheduler_host: Option<String>,

    /// Data sink host
    #[arg(long)]
    receiver_host: Option<String>,

    /// Scheduler control port
    #[arg(long)]
    control_port: Option<u16>,

    /// Data sink port
    #[arg(long)]
    data_port: Option<u16>,

    /// Width of the synthetic model layer
    #[arg(long)]
    model_size: Option<usize>,

    /// Payload per round in MiB
    #[arg(long)]
    grad_mb: Option<f64>,

    /// Number of rounds
    #[arg(long)]
    steps: Option<u64>,

    /// Give up waiting for a grant after this many milliseconds
    #[arg(long)]
    grant_timeout_ms: Option<u64>,

    /// Replace the dense layer with a fixed compute delay in milliseconds
    #[arg(long)]
    fixed_compute_ms: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let filter = tracing_subscriber::filter::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::filter::EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => ArbiterConfig::from_file(path)?,
        None => ArbiterConfig::default(),
    }
    .with_env_overrides();

    let mut config = config.worker;
    if let Some(job_id) = args.job_id {
        config.job_id = job_id;
    }
    if let Some(host) = args.scheduler_host {
        config.scheduler_host = host;
    }
    if let Some(host) = args.receiver_host {
        config.receiver_host = host;
    }
    if let Some(port) = args.control_port {
        config.control_port = port;
    }
    if let Some(port) = args.data_port {
        config.data_port = port;
    }
    if let Some(size) = args.model_size {
        config.model_size = size;
    }
    if let Some(grad_mb) = args.grad_mb {
        config.grad_mb = grad_mb;
    }
    if let Some(steps) = args.steps {
        config.rounds = steps;
    }
    if let Some(timeout) = args.grant_timeout_ms {
        config.grant_timeout_ms = Some(timeout);
    }
    config.validate()?;

    let mut workload: Box<dyn Workload> = match args.fixed_compute_ms {
        Some(ms) => Box::new(FixedDelay::new(Duration::from_millis(ms))),
        None => Box::new(DenseLayer::new(config.model_size)),
    };

    tracing::info!("Starting job {}", config.job_id);
    tracing::info!("  Scheduler: {}", config.control_addr());
    tracing::info!("  Receiver: {}", config.data_addr());
    tracing::info!("  Workload: {}", workload.name());
    tracing::info!("  Payload: {} bytes x {} rounds", config.payload_size(), config.rounds);

    let job_id = config.job_id.clone();
    let shutdown = CancellationToken::new();
    let mut worker = WorkerClient::connect(config)
        .await?
        .with_cancellation(shutdown.clone());

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Stopping job...");
            ctrl_c.cancel();
        }
    });

    let result = worker.run(workload.as_mut()).await;
    let closed = worker.shutdown().await;

    let Some(summary) = settle(&job_id, result, closed)? else {
        return Ok(());
    };

    tracing::info!(
        "Job {} finished {} rounds: compute {:.3}s, waiting {:.3}s, transmitting {:.3}s",
        job_id,
        summary.rounds,
        summary.total_compute.as_secs_f64(),
        summary.total_wait.as_secs_f64(),
        summary.total_comm.as_secs_f64()
    );

    Ok(())
}

/// Combine the outcome of a run with the outcome of closing its connections.
///
/// A failed run wins over a failed close. Cancellation is a clean stop and
/// yields no summary.
fn settle(
    job_id: &str,
    run: arbiter_core::Result<RunSummary>,
    closed: arbiter_core::Result<()>,
) -> arbiter_core::Result<Option<RunSummary>> {
    if let Err(e) = &closed {
        tracing::warn!("Job {} did not close its connections cleanly: {}", job_id, e);
    }

    match run {
        Ok(summary) => closed.map(|()| Some(summary)),
        Err(ArbiterError::Cancelled) => {
            tracing::info!("Job {} cancelled", job_id);
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close_failure() -> ArbiterError {
        ArbiterError::io(
            "closing data connection",
            std::io::Error::from(std::io::ErrorKind::BrokenPipe),
        )
    }

    #[test]
    fn test_run_error_wins_over_close_error() {
        let run = Err(ArbiterError::protocol("scheduler went away"));
        let err = settle("A", run, Err(close_failure())).unwrap_err();
        assert!(matches!(err, ArbiterError::Protocol { .. }));
    }

    #[test]
    fn test_close_error_surfaces_after_clean_run() {
        let err = settle("A", Ok(RunSummary::default()), Err(close_failure())).unwrap_err();
        assert!(matches!(err, ArbiterError::Io { .. }));
    }

    #[test]
    fn test_cancelled_run_is_a_clean_stop() {
        let settled = settle("A", Err(ArbiterError::Cancelled), Err(close_failure())).unwrap();
        assert!(settled.is_none());
    }

    #[test]
    fn test_successful_run_returns_summary() {
        let summary = RunSummary {
            rounds: 3,
            ..Default::default()
        };
        let settled = settle("A", Ok(summary.clone()), Ok(())).unwrap();
        assert_eq!(settled, Some(summary));
    }
}
