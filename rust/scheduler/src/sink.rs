//! Data sink: accepts granted transfers and throws the bytes away.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use arbiter_core::protocol::drain_payload;
use arbiter_core::{ArbiterError, Result};

/// Process-wide transfer counters.
#[derive(Debug, Default)]
pub struct SinkStats {
    connections: AtomicU64,
    payloads: AtomicU64,
    bytes: AtomicU64,
    short_reads: AtomicU64,
}

impl SinkStats {
    pub fn connections(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }

    pub fn payloads(&self) -> u64 {
        self.payloads.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn short_reads(&self) -> u64 {
        self.short_reads.load(Ordering::Relaxed)
    }
}

pub struct DataSink {
    listener: TcpListener,
    stats: Arc<SinkStats>,
}

impl DataSink {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ArbiterError::io(format!("binding data sink to {addr}"), e))?;
        Ok(Self {
            listener,
            stats: Arc::new(SinkStats::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .map_err(|e| ArbiterError::io("reading data sink address", e))
    }

    pub fn stats(&self) -> Arc<SinkStats> {
        self.stats.clone()
    }

    /// Accept connections until `shutdown` fires. Each connection is drained
    /// on its own task.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        tracing::info!("Data sink listening on {}", self.local_addr()?);

        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!("Data connection from {}", peer);
                    self.stats.connections.fetch_add(1, Ordering::Relaxed);
                    tokio::spawn(drain_connection(stream, peer, self.stats.clone()));
                }
                Err(e) => tracing::warn!("Failed to accept data connection: {}", e),
            }
        }

        tracing::info!("Data sink stopped");
        Ok(())
    }
}

async fn drain_connection(mut stream: TcpStream, peer: SocketAddr, stats: Arc<SinkStats>) {
    loop {
        match drain_payload(&mut stream).await {
            Ok(Some(len)) => {
                stats.payloads.fetch_add(1, Ordering::Relaxed);
                stats.bytes.fetch_add(len, Ordering::Relaxed);
                tracing::trace!("Received {} bytes from {}", len, peer);
            }
            Ok(None) => {
                tracing::debug!("Data connection from {} closed", peer);
                break;
            }
            Err(e @ ArbiterError::ShortRead { .. }) => {
                stats.short_reads.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping data connection from {}: {}", peer, e);
                break;
            }
            Err(e) => {
                tracing::warn!("Data connection from {} failed: {}", peer, e);
                break;
            }
        }
    }
}
