//! Bidirectional stream splicing
//!
//! Couples two duplex endpoints and copies in both directions until either
//! side finishes. Each direction owns one fixed buffer, so a slow reader on
//! one side stalls the opposite read instead of queueing bytes.

use std::io;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Counters for one live forward
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    /// Total connections handled
    pub connection_count: u64,
    /// Connections being relayed right now
    pub active_connections: u64,
    /// Bytes from the local side toward the SSH peer
    pub bytes_sent: u64,
    /// Bytes from the SSH peer toward the local side
    pub bytes_received: u64,
}

pub type SharedStats = Arc<RwLock<ForwardStats>>;

/// Marks one connection active for as long as it is alive
pub(crate) struct ConnectionGuard {
    stats: SharedStats,
}

impl ConnectionGuard {
    pub(crate) fn new(stats: SharedStats) -> Self {
        {
            let mut s = stats.write();
            s.connection_count += 1;
            s.active_connections += 1;
        }
        Self { stats }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let mut s = self.stats.write();
        s.active_connections = s.active_connections.saturating_sub(1);
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Sent,
    Received,
}

/// Bytes moved by one [`StreamForwarder::run`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Relayed {
    pub sent: u64,
    pub received: u64,
}

/// Relays between a local endpoint and an SSH channel
#[derive(Clone)]
pub struct StreamForwarder {
    buffer_size: usize,
    stats: Option<SharedStats>,
}

impl StreamForwarder {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size: buffer_size.max(1),
            stats: None,
        }
    }

    pub fn with_stats(mut self, stats: SharedStats) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Splice `local` and `remote` until either side reaches EOF or fails.
    ///
    /// Whichever direction stops first stops the other; both write halves
    /// are then shut down and both endpoints dropped.
    pub async fn run<L, R>(&self, local: L, remote: R) -> Relayed
    where
        L: AsyncRead + AsyncWrite + Unpin,
        R: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut local_read, mut local_write) = tokio::io::split(local);
        let (mut remote_read, mut remote_write) = tokio::io::split(remote);
        let mut relayed = Relayed::default();

        {
            let outbound = self.pump(
                &mut local_read,
                &mut remote_write,
                &mut relayed.sent,
                Direction::Sent,
            );
            let inbound = self.pump(
                &mut remote_read,
                &mut local_write,
                &mut relayed.received,
                Direction::Received,
            );

            tokio::select! {
                result = outbound => {
                    if let Err(e) = result {
                        debug!("Local side ended with error: {}", e);
                    }
                }
                result = inbound => {
                    if let Err(e) = result {
                        debug!("Remote side ended with error: {}", e);
                    }
                }
            }
        }

        let _ = remote_write.shutdown().await;
        let _ = local_write.shutdown().await;
        debug!(
            "Relay finished: {} bytes sent, {} bytes received",
            relayed.sent, relayed.received
        );
        relayed
    }

    async fn pump<S, D>(
        &self,
        source: &mut S,
        sink: &mut D,
        total: &mut u64,
        direction: Direction,
    ) -> io::Result<()>
    where
        S: AsyncRead + Unpin,
        D: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                return Ok(());
            }
            sink.write_all(&buf[..n]).await?;
            sink.flush().await?;
            *total += n as u64;
            if let Some(stats) = &self.stats {
                let mut s = stats.write();
                match direction {
                    Direction::Sent => s.bytes_sent += n as u64,
                    Direction::Received => s.bytes_received += n as u64,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_relays_both_directions_until_remote_closes() {
        let (local, mut local_peer) = tokio::io::duplex(1024);
        let (remote, mut remote_peer) = tokio::io::duplex(1024);
        let stats = SharedStats::default();
        let forwarder = StreamForwarder::new(16).with_stats(stats.clone());

        let task = tokio::spawn(async move { forwarder.run(local, remote).await });

        local_peer.write_all(b"GET / HTTP/1.0\r\n\r\n").await.unwrap();
        let mut request = [0u8; 18];
        remote_peer.read_exact(&mut request).await.unwrap();
        assert_eq!(&request, b"GET / HTTP/1.0\r\n\r\n");

        remote_peer.write_all(b"HTTP/1.0 200 OK").await.unwrap();
        let mut response = [0u8; 15];
        local_peer.read_exact(&mut response).await.unwrap();
        assert_eq!(&response, b"HTTP/1.0 200 OK");

        drop(remote_peer);
        let relayed = task.await.unwrap();
        assert_eq!(relayed, Relayed { sent: 18, received: 15 });

        let mut rest = Vec::new();
        local_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        let s = stats.read().clone();
        assert_eq!(s.bytes_sent, 18);
        assert_eq!(s.bytes_received, 15);
    }

    #[tokio::test]
    async fn test_local_eof_closes_remote() {
        let (local, local_peer) = tokio::io::duplex(64);
        let (remote, mut remote_peer) = tokio::io::duplex(64);

        let task = tokio::spawn(async move { StreamForwarder::new(8).run(local, remote).await });
        drop(local_peer);

        let mut rest = Vec::new();
        remote_peer.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        assert_eq!(task.await.unwrap(), Relayed::default());
    }

    #[test]
    fn test_connection_guard_counts() {
        let stats = SharedStats::default();
        let first = ConnectionGuard::new(stats.clone());
        let second = ConnectionGuard::new(stats.clone());
        assert_eq!(stats.read().active_connections, 2);
        drop(first);
        drop(second);
        let s = stats.read().clone();
        assert_eq!(s.connection_count, 2);
        assert_eq!(s.active_connections, 0);
    }
}
