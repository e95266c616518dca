//! Shared-link arbitration scheduler
//!
//! Runs the control server that decides which job may use the shared link,
//! and the data sink that receives the granted transfers.
//!
//! # Usage
//!
//! ```bash
//! # Control on :5000, data on :6000
//! arbiter-scheduler
//!
//! # Mix in the deficit term and only let the holder release the link
//! arbiter-scheduler --beta 0.7 --completion-policy strict
//!
//! # Start with configuration file
//! arbiter-scheduler --config arbiter.toml
//! ```

mod arbitration;
mod service;
mod sink;
mod state;

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use arbiter_core::{ArbiterConfig, CompletionPolicy};
use service::ControlServer;
use sink::DataSink;
use state::SchedulerState;

/// Shared-link arbitration scheduler
#[derive(Parser, Debug)]
#[command(name = "arbiter-scheduler")]
#[command(about = "Grants exclusive use of a shared link to competing training jobs")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<String>,

    /// Address to bind both listeners to
    #[arg(short, long)]
    address: Option<String>,

    /// Control channel port
    #[arg(long)]
    control_port: Option<u16>,

    /// Data channel port
    #[arg(long)]
    data_port: Option<u16>,

    /// Weight of compute intensity against the fairness deficit, in [0, 1]
    #[arg(long)]
    beta: Option<f64>,

    /// Completion handling (lenient, strict)
    #[arg(long)]
    completion_policy: Option<CompletionPolicy>,

    /// Drop a job's session when its connection closes
    #[arg(long)]
    evict_on_disconnect: bool,

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

    let mut config = config.scheduler;
    if let Some(address) = args.address {
        config.bind_address = address;
    }
    if let Some(port) = args.control_port {
        config.control_port = port;
    }
    if let Some(port) = args.data_port {
        config.data_port = port;
    }
    if let Some(beta) = args.beta {
        config.beta = beta;
    }
    if let Some(policy) = args.completion_policy {
        config.completion_policy = policy;
    }
    config.evict_on_disconnect |= args.evict_on_disconnect;
    config.validate()?;

    let state = Arc::new(SchedulerState::new(&config));

    tracing::info!("Starting arbitration scheduler");
    tracing::info!("  Beta: {}", state.beta());
    tracing::info!("  Completion policy: {}", state.completion_policy());
    tracing::info!("  Evict on disconnect: {}", config.evict_on_disconnect);

    let control = ControlServer::bind(&config.control_addr(), state.clone()).await?;
    let sink = DataSink::bind(&config.data_addr()).await?;
    let sink_stats = sink.stats();

    let shutdown = CancellationToken::new();
    let control_task = tokio::spawn(control.run(shutdown.clone()));
    let sink_task = tokio::spawn(sink.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down scheduler...");
    shutdown.cancel();

    control_task.await??;
    sink_task.await??;

    tracing::info!(
        "Issued {} grants to {} jobs",
        state.grants_issued().await,
        state.session_count().await
    );
    tracing::info!(
        "Sink received {} payloads ({} bytes, {} short reads) over {} connections",
        sink_stats.payloads(),
        sink_stats.bytes(),
        sink_stats.short_reads(),
        sink_stats.connections()
    );

    Ok(())
}
