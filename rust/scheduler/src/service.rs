//! Control server: accepts job connections and feeds their messages into
//! the shared [`SchedulerState`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::BufReader;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio_util::sync::CancellationToken;

use arbiter_core::protocol::{read_message, write_message};
use arbiter_core::{ArbiterError, ControlMessage, Result};

use crate::state::SchedulerState;

pub struct ControlServer {
    listener: TcpListener,
    state: Arc<SchedulerState>,
}

impl ControlServer {
    pub async fn bind(addr: &str, state: Arc<SchedulerState>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ArbiterError::io(format!("binding control server to {addr}"), e))?;
        Ok(Self { listener, state })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| ArbiterError::io("reading control server address", e))
    }

    /// Accept job connections until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Control server listening on {}", self.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    tracing::info!("Job connected from {}", peer);
                    tokio::spawn(handle_connection(stream, peer, self.state.clone()));
                }
                Err(e) => tracing::warn!("Failed to accept control connection: {}", e),
            }
        }

        tracing::info!("Control server stopped");
        Ok(())
    }
}

/// Service one job connection until it closes or sends something
/// undecodable.
async fn handle_connection(stream: TcpStream, peer: SocketAddr, state: Arc<SchedulerState>) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Could not disable Nagle for {}: {}", peer, e);
    }

    let (read_half, write_half) = stream.into_split();
    let (outbox, inbox) = mpsc::unbounded_channel();
    let writer = tokio::spawn(write_loop(write_half, inbox, peer));

    let mut reader = BufReader::new(read_half);
    let mut job_ids: Vec<String> = Vec::new();

    loop {
        match read_message(&mut reader).await {
            Ok(Some(message)) => {
                if let Some(job_id) = message.job_id() {
                    if !job_ids.iter().any(|known| known == job_id) {
                        job_ids.push(job_id.to_string());
                    }
                }
                state.dispatch(message, &outbox).await;
            }
            Ok(None) => {
                tracing::info!("Job connection from {} closed", peer);
                break;
            }
            Err(e) if e.is_disconnect() => {
                tracing::warn!("Dropping job connection from {}: {}", peer, e);
                break;
            }
            Err(e) => {
                tracing::error!("Job connection from {} failed: {}", peer, e);
                break;
            }
        }
    }

    state.disconnect(&job_ids, &outbox).await;
    writer.abort();
}

/// Write queued messages to the job in order.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut inbox: UnboundedReceiver<ControlMessage>,
    peer: SocketAddr,
) {
    while let Some(message) = inbox.recv().await {
        if let Err(e) = write_message(&mut writer, &message).await {
            tracing::warn!("Failed to write to job at {}: {}", peer, e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::JobSession;
    use crate::sink::{DataSink, SinkStats};
    use arbiter_core::{CompletionPolicy, FixedDelay, SchedulerConfig, WorkerClient, WorkerConfig};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::tcp::OwnedReadHalf;

    struct Harness {
        control: SocketAddr,
        data: SocketAddr,
        state: Arc<SchedulerState>,
        sink_stats: Arc<SinkStats>,
        token: CancellationToken,
    }

    impl Harness {
        async fn start(config: SchedulerConfig) -> Self {
            let state = Arc::new(SchedulerState::new(&config));
            let server = ControlServer::bind("127.0.0.1:0", state.clone())
                .await
                .unwrap();
            let sink = DataSink::bind("127.0.0.1:0").await.unwrap();
            let control = server.local_addr().unwrap();
            let data = sink.local_addr().unwrap();
            let sink_stats = sink.stats();

            let token = CancellationToken::new();
            tokio::spawn(server.run(token.clone()));
            tokio::spawn(sink.run(token.clone()));

            Self {
                control,
                data,
                state,
                sink_stats,
                token,
            }
        }

        fn worker_config(&self, job_id: &str, rounds: u64) -> WorkerConfig {
            WorkerConfig {
                job_id: job_id.to_string(),
                scheduler_host: "127.0.0.1".to_string(),
                receiver_host: "127.0.0.1".to_string(),
                control_port: self.control.port(),
                data_port: self.data.port(),
                grad_mb: 0.01,
                rounds,
                round_pause_ms: 0,
                ..Default::default()
            }
        }

        async fn raw_job(&self) -> (BufReader<OwnedReadHalf>, OwnedWriteHalf) {
            let stream = TcpStream::connect(self.control).await.unwrap();
            let (read, write) = stream.into_split();
            (BufReader::new(read), write)
        }
    }

    async fn expect_grant(reader: &mut BufReader<OwnedReadHalf>) {
        let message = tokio::time::timeout(Duration::from_secs(5), read_message(reader))
            .await
            .expect("grant not delivered")
            .unwrap();
        assert_eq!(message, Some(ControlMessage::Grant));
    }

    async fn expect_silence(reader: &mut BufReader<OwnedReadHalf>) {
        let waited = tokio::time::timeout(Duration::from_millis(150), read_message(reader)).await;
        assert!(waited.is_err(), "unexpected message: {waited:?}");
    }

    async fn wait_for_session(
        state: &SchedulerState,
        job_id: &str,
        ready: impl Fn(&JobSession) -> bool,
    ) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !state.session(job_id).await.map_or(false, |s| ready(&s)) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("session never reached the expected state");
    }

    async fn send(writer: &mut OwnedWriteHalf, message: ControlMessage) {
        write_message(writer, &message).await.unwrap();
    }

    #[tokio::test]
    async fn test_workers_complete_all_rounds() {
        let harness = Harness::start(SchedulerConfig::default()).await;

        let mut tasks = Vec::new();
        for job_id in ["a", "b", "c"] {
            let config = harness.worker_config(job_id, 4);
            tasks.push(tokio::spawn(async move {
                let mut worker = WorkerClient::connect(config).await?;
                let mut workload = FixedDelay::new(Duration::from_millis(2));
                let summary = worker.run(&mut workload).await?;
                worker.shutdown().await?;
                Ok::<_, ArbiterError>(summary)
            }));
        }

        for task in tasks {
            let summary = tokio::time::timeout(Duration::from_secs(20), task)
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert_eq!(summary.rounds, 4);
        }

        for job_id in ["a", "b", "c"] {
            wait_for_session(&harness.state, job_id, |s| s.rounds_completed == 4).await;
            assert!(!harness.state.session(job_id).await.unwrap().waiting);
        }
        assert_eq!(harness.state.grants_issued().await, 12);

        let payload = (0.01 * 1024.0 * 1024.0) as u64;
        tokio::time::timeout(Duration::from_secs(5), async {
            while harness.sink_stats.payloads() < 12 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(harness.sink_stats.bytes(), 12 * payload);
        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_only_one_job_holds_the_link() {
        let harness = Harness::start(SchedulerConfig::default()).await;
        let (mut ra, mut wa) = harness.raw_job().await;
        let (mut rb, mut wb) = harness.raw_job().await;

        send(&mut wa, ControlMessage::send_request("a", 1.0, 10)).await;
        expect_grant(&mut ra).await;

        send(&mut wb, ControlMessage::send_request("b", 50.0, 10)).await;
        expect_silence(&mut rb).await;

        send(&mut wa, ControlMessage::completion("a", 0.01)).await;
        expect_grant(&mut rb).await;
        expect_silence(&mut ra).await;

        assert_eq!(harness.state.active_sender().await.as_deref(), Some("b"));
        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_release_goes_to_highest_priority() {
        let harness = Harness::start(SchedulerConfig::default()).await;
        let (mut rh, mut wh) = harness.raw_job().await;
        let (mut ra, mut wa) = harness.raw_job().await;
        let (mut rc, mut wc) = harness.raw_job().await;

        send(&mut wh, ControlMessage::send_request("holder", 1.0, 1)).await;
        expect_grant(&mut rh).await;

        send(&mut wa, ControlMessage::send_request("a", 3.0, 1)).await;
        send(&mut wc, ControlMessage::send_request("c", 4.0, 1)).await;
        wait_for_session(&harness.state, "a", |s| s.waiting).await;
        wait_for_session(&harness.state, "c", |s| s.waiting).await;

        send(&mut wh, ControlMessage::completion("holder", 0.01)).await;
        expect_grant(&mut rc).await;
        expect_silence(&mut ra).await;
        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_garbage_closes_only_that_connection() {
        let harness = Harness::start(SchedulerConfig::default()).await;
        let (mut rg, mut wg) = harness.raw_job().await;

        send(&mut wg, ControlMessage::send_request("g", 1.0, 1)).await;
        expect_grant(&mut rg).await;
        wg.write_all(b"this is not json\n").await.unwrap();

        // The scheduler hangs up without replying.
        let closed = tokio::time::timeout(Duration::from_secs(5), read_message(&mut rg))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(closed, None);

        // The session survives and still holds the link.
        assert!(harness.state.session("g").await.is_some());
        assert_eq!(harness.state.active_sender().await.as_deref(), Some("g"));

        // Other jobs are unaffected; a completion frees the stale slot.
        let (mut ro, mut wo) = harness.raw_job().await;
        send(&mut wo, ControlMessage::send_request("o", 1.0, 1)).await;
        expect_silence(&mut ro).await;
        send(&mut wo, ControlMessage::completion("g", 0.0)).await;
        expect_grant(&mut ro).await;
        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_other_records_are_accepted() {
        let harness = Harness::start(SchedulerConfig::default()).await;
        let (mut reader, mut writer) = harness.raw_job().await;

        writer
            .write_all(b"{\"job_id\":\"x\",\"hello\":true}\n{\"note\":1}\n")
            .await
            .unwrap();
        expect_silence(&mut reader).await;
        assert!(harness.state.session("x").await.is_some());

        send(&mut writer, ControlMessage::send_request("x", 1.0, 1)).await;
        expect_grant(&mut reader).await;
        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_eviction_frees_link_on_disconnect() {
        let harness = Harness::start(SchedulerConfig {
            evict_on_disconnect: true,
            completion_policy: CompletionPolicy::Strict,
            ..Default::default()
        })
        .await;
        let (mut ra, mut wa) = harness.raw_job().await;
        let (mut rb, mut wb) = harness.raw_job().await;

        send(&mut wa, ControlMessage::send_request("a", 1.0, 1)).await;
        expect_grant(&mut ra).await;
        send(&mut wb, ControlMessage::send_request("b", 1.0, 1)).await;
        expect_silence(&mut rb).await;

        drop(wa);
        drop(ra);
        expect_grant(&mut rb).await;
        assert!(harness.state.session("a").await.is_none());
        harness.token.cancel();
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let state = Arc::new(SchedulerState::new(&SchedulerConfig::default()));
        let server = ControlServer::bind("127.0.0.1:0", state).await.unwrap();
        let token = CancellationToken::new();
        let handle = tokio::spawn(server.run(token.clone()));

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
