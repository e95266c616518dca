//! Worker side of the arbitration protocol.
//!
//! Each round walks the same state machine:
//!
//! ```text
//! Computing -> Requesting -> WaitingForGrant -> Transmitting -> Reporting
//!     ^                                                            |
//!     +------------------------------------------------------------+
//! ```
//!
//! and the worker is `Done` after its configured number of rounds.

use std::io::ErrorKind;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::workload::Workload;
use crate::config::WorkerConfig;
use crate::error::{ArbiterError, Result};
use serde_json::Value;

use crate::protocol::{read_record, write_message, write_payload, ControlMessage, GRANT_COMMAND};
use crate::retry::{retry_async, Attempt, RetryConfig};

/// Where a worker is in its round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Computing,
    Requesting,
    WaitingForGrant,
    Transmitting,
    Reporting,
    Done,
}

/// Measurements from one completed round.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoundReport {
    pub round: u64,
    pub compute_time: Duration,
    /// Time between the send request and the grant.
    pub wait_time: Duration,
    pub comm_time: Duration,
}

/// Totals over a whole run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub rounds: u64,
    pub total_compute: Duration,
    pub total_wait: Duration,
    pub total_comm: Duration,
}

impl RunSummary {
    fn record(&mut self, report: &RoundReport) {
        self.rounds += 1;
        self.total_compute += report.compute_time;
        self.total_wait += report.wait_time;
        self.total_comm += report.comm_time;
    }
}

/// Connect to `addr`, retrying while the peer refuses connections.
///
/// Any other connect error is returned immediately.
pub async fn connect_with_retry(addr: &str, retry: &RetryConfig) -> Result<TcpStream> {
    retry_async(retry, |attempt| async move {
        match TcpStream::connect(addr).await {
            Ok(stream) => Attempt::Done(stream),
            Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                tracing::info!("Waiting for {} (attempt {})...", addr, attempt + 1);
                Attempt::Transient(e)
            }
            Err(e) => Attempt::Fatal(e),
        }
    })
    .await
    .map_err(|e| ArbiterError::connect(addr, e))
}

/// Read control records until a grant arrives. Every other record, whatever
/// its shape, means "not yet".
async fn next_grant(reader: &mut BufReader<OwnedReadHalf>, job_id: &str) -> Result<()> {
    loop {
        match read_record(reader).await? {
            Some(record)
                if record.get("command").and_then(Value::as_str) == Some(GRANT_COMMAND) =>
            {
                return Ok(())
            }
            Some(other) => {
                tracing::debug!("Job {} ignoring {:?} while waiting for grant", job_id, other);
            }
            None => {
                return Err(ArbiterError::protocol(
                    "scheduler closed the control connection before granting",
                ))
            }
        }
    }
}

/// A connected worker: one control connection to the scheduler and one data
/// connection to the sink, both held for the whole run.
pub struct WorkerClient {
    config: WorkerConfig,
    control_reader: BufReader<OwnedReadHalf>,
    control_writer: OwnedWriteHalf,
    data: TcpStream,
    payload: Bytes,
    phase: WorkerPhase,
    cancel: CancellationToken,
}

impl WorkerClient {
    /// Connect both channels, blocking until the scheduler and the sink
    /// accept.
    pub async fn connect(config: WorkerConfig) -> Result<Self> {
        let retry = config.connect_retry();

        let control = connect_with_retry(&config.control_addr(), &retry).await?;
        control
            .set_nodelay(true)
            .map_err(|e| ArbiterError::io("configuring control socket", e))?;
        tracing::info!(
            "Worker {} connected to scheduler at {}",
            config.job_id,
            config.control_addr()
        );

        let data = connect_with_retry(&config.data_addr(), &retry).await?;
        tracing::info!(
            "Worker {} connected to receiver at {}",
            config.job_id,
            config.data_addr()
        );

        let (read_half, write_half) = control.into_split();
        let payload = Bytes::from(vec![b'a'; config.payload_size()]);

        Ok(Self {
            config,
            control_reader: BufReader::new(read_half),
            control_writer: write_half,
            data,
            payload,
            phase: WorkerPhase::Computing,
            cancel: CancellationToken::new(),
        })
    }

    /// Abort a pending grant wait when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn job_id(&self) -> &str {
        &self.config.job_id
    }

    pub fn phase(&self) -> WorkerPhase {
        self.phase
    }

    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Run all configured rounds, then mark the worker done.
    pub async fn run<W>(&mut self, workload: &mut W) -> Result<RunSummary>
    where
        W: Workload + ?Sized,
    {
        let mut summary = RunSummary::default();
        let pause = self.config.round_pause();

        for round in 0..self.config.rounds {
            let report = self.run_round(round, workload).await?;
            tracing::info!(
                "Job {}: Step {}, Comp {:.4}s, Wait {:.4}s, Comm {:.4}s",
                self.config.job_id,
                report.round,
                report.compute_time.as_secs_f64(),
                report.wait_time.as_secs_f64(),
                report.comm_time.as_secs_f64()
            );
            summary.record(&report);

            if !pause.is_zero() && round + 1 < self.config.rounds {
                tokio::time::sleep(pause).await;
            }
        }

        self.phase = WorkerPhase::Done;
        Ok(summary)
    }

    /// Run one compute/request/wait/transmit/report cycle.
    ///
    /// Cancellation is honoured before and after the compute step and during
    /// the grant wait. Once granted, the round runs to its completion report
    /// so the link is released.
    pub async fn run_round<W>(&mut self, round: u64, workload: &mut W) -> Result<RoundReport>
    where
        W: Workload + ?Sized,
    {
        self.phase = WorkerPhase::Computing;
        self.ensure_active()?;
        let started = Instant::now();
        workload.compute().await?;
        let compute_time = started.elapsed();
        self.ensure_active()?;

        self.phase = WorkerPhase::Requesting;
        let request = ControlMessage::send_request(
            self.config.job_id.clone(),
            compute_time.as_secs_f64(),
            self.payload.len() as u64,
        );
        write_message(&mut self.control_writer, &request).await?;

        self.phase = WorkerPhase::WaitingForGrant;
        let requested = Instant::now();
        self.wait_for_grant().await?;
        let wait_time = requested.elapsed();

        self.phase = WorkerPhase::Transmitting;
        let started = Instant::now();
        write_payload(&mut self.data, &self.payload).await?;
        let comm_time = started.elapsed();

        self.phase = WorkerPhase::Reporting;
        let completion =
            ControlMessage::completion(self.config.job_id.clone(), comm_time.as_secs_f64());
        write_message(&mut self.control_writer, &completion).await?;

        Ok(RoundReport {
            round,
            compute_time,
            wait_time,
            comm_time,
        })
    }

    fn ensure_active(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(ArbiterError::Cancelled);
        }
        Ok(())
    }

    /// Block until the scheduler grants the link.
    ///
    /// Waits forever unless a grant timeout is configured or the cancellation
    /// token fires.
    async fn wait_for_grant(&mut self) -> Result<()> {
        let limit = self.config.grant_timeout();
        let job_id = self.config.job_id.as_str();
        let reader = &mut self.control_reader;
        let cancel = &self.cancel;

        let bounded = async move {
            match limit {
                Some(limit) => tokio::time::timeout(limit, next_grant(reader, job_id))
                    .await
                    .map_err(|_| ArbiterError::grant_timeout(job_id, limit))?,
                None => next_grant(reader, job_id).await,
            }
        };

        tokio::select! {
            result = bounded => result,
            _ = cancel.cancelled() => Err(ArbiterError::Cancelled),
        }
    }

    /// Close both connections.
    pub async fn shutdown(mut self) -> Result<()> {
        self.control_writer
            .shutdown()
            .await
            .map_err(|e| ArbiterError::io("closing control connection", e))?;
        self.data
            .shutdown()
            .await
            .map_err(|e| ArbiterError::io("closing data connection", e))
    }
}
