//! Dynamic SOCKS Proxy Forwarding
//!
//! A local SOCKS4/4a/5 proxy whose destination is chosen per connection by
//! the client; each CONNECT becomes a direct-tcpip channel.
//! Example: Local SOCKS proxy on 127.0.0.1:1080 -> SSH tunnel -> any destination

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::local::{bind_listener, spawn_listener, ListenerHandle};
use super::socks::{self, Command};
use super::stream::{ConnectionGuard, StreamForwarder};
use crate::ssh::{SshError, WireEngine};

/// Dynamic (SOCKS) port forwarding configuration
#[derive(Debug, Clone)]
pub struct DynamicForward {
    /// Local address to bind the proxy (e.g., "127.0.0.1:1080")
    pub local_addr: String,
    pub buffer_size: usize,
}

/// Start the SOCKS proxy
pub async fn start_dynamic_forward(
    engine: Arc<dyn WireEngine>,
    config: DynamicForward,
) -> Result<ListenerHandle, SshError> {
    let listener = bind_listener(&config.local_addr).await?;
    let disconnect_rx = engine.subscribe_connection_lost();
    let buffer_size = config.buffer_size;

    let handle = spawn_listener(
        listener,
        "SOCKS proxy".to_string(),
        disconnect_rx,
        move |stream, peer_addr, stats| {
            let engine = engine.clone();
            async move {
                let _guard = ConnectionGuard::new(stats.clone());
                let forwarder = StreamForwarder::new(buffer_size).with_stats(stats);
                if let Err(e) = serve_client(engine.as_ref(), stream, peer_addr, forwarder).await {
                    warn!("SOCKS connection error from {}: {}", peer_addr, e);
                }
            }
        },
    )?;

    info!("Started SOCKS proxy on {}", handle.bound_addr);
    Ok(handle)
}

/// Drive one client from greeting to relay.
///
/// Every failure before the relay starts is answered with the reply the
/// client's protocol version expects, then the socket is closed.
pub(crate) async fn serve_client<S>(
    engine: &dyn WireEngine,
    mut stream: S,
    peer_addr: SocketAddr,
    forwarder: StreamForwarder,
) -> Result<(), SshError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = match socks::read_request(&mut stream).await {
        Ok(request) if request.command() == Command::Connect => request,
        Ok(request) => {
            let err = socks::unsupported_command(&request);
            return reject(stream, err).await;
        }
        Err(err) => return reject(stream, err).await,
    };

    let target = request.target().clone();
    debug!("SOCKS: {} requests {}", peer_addr, target);

    let channel = match engine
        .open_direct_tcpip(
            &target.host(),
            target.port(),
            &peer_addr.ip().to_string(),
            peer_addr.port(),
        )
        .await
    {
        Ok(channel) => channel,
        Err(e) => {
            let reply = socks::failure_reply(request.version(), e.open_failure());
            let _ = stream.write_all(&reply).await;
            let _ = stream.shutdown().await;
            return Err(e);
        }
    };

    stream.write_all(&socks::success_reply(request.version())).await?;
    debug!("SOCKS: relaying {} <-> {}", peer_addr, target);
    forwarder.run(stream, channel).await;
    Ok(())
}

async fn reject<S>(mut stream: S, err: socks::SocksError) -> Result<(), SshError>
where
    S: AsyncWrite + Unpin,
{
    if let Some(reply) = err.reply() {
        let _ = stream.write_all(&reply).await;
    }
    let _ = stream.shutdown().await;
    Err(SshError::ProtocolError(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::OpenFailure;
    use crate::testing::MockEngine;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn proxy() -> DynamicForward {
        DynamicForward {
            local_addr: "127.0.0.1:0".into(),
            buffer_size: 4096,
        }
    }

    async fn socks5_connect(addr: SocketAddr, host: &str, port: u16) -> (TcpStream, Vec<u8>) {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [5, 0]);

        let mut request = vec![5, 1, 0, 3, host.len() as u8];
        request.extend_from_slice(host.as_bytes());
        request.extend_from_slice(&port.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = vec![0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        (client, reply)
    }

    #[tokio::test]
    async fn test_unreachable_host_then_keeps_accepting() {
        let mock = Arc::new(
            MockEngine::new().fail_direct("unreachable.test", 80, OpenFailure::HostUnreachable),
        );
        let mut peers = mock.take_direct_peers();
        let handle = start_dynamic_forward(mock.clone(), proxy()).await.unwrap();

        let (mut failed, reply) = socks5_connect(handle.bound_addr, "unreachable.test", 80).await;
        assert_eq!(reply[1], 0x04);
        let mut rest = Vec::new();
        let n = tokio::time::timeout(Duration::from_secs(5), failed.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);

        let (mut ok, reply) = socks5_connect(handle.bound_addr, "example.org", 443).await;
        assert_eq!(reply[1], 0x00);
        let mut peer = peers.recv().await.unwrap();
        assert_eq!((peer.host.as_str(), peer.port), ("example.org", 443));

        ok.write_all(b"hello").await.unwrap();
        let mut got = [0u8; 5];
        peer.stream.read_exact(&mut got).await.unwrap();
        assert_eq!(&got, b"hello");

        let stats = handle.stats();
        assert_eq!(stats.connection_count, 2);
        handle.stop().await;
    }

    #[tokio::test]
    async fn test_refused_and_timeout_codes() {
        let mock = MockEngine::new()
            .fail_direct("10.0.0.1", 22, OpenFailure::ConnectionRefused)
            .fail_direct("10.0.0.2", 22, OpenFailure::TimedOut);
        let peer_addr: SocketAddr = "127.0.0.1:40000".parse().unwrap();

        for (ip, code) in [([10, 0, 0, 1], 0x05), ([10, 0, 0, 2], 0x06)] {
            let (server, mut client) = tokio::io::duplex(256);
            let mut request = vec![5, 1, 0, 5, 1, 0, 1];
            request.extend_from_slice(&ip);
            request.extend_from_slice(&22u16.to_be_bytes());
            client.write_all(&request).await.unwrap();

            let result = serve_client(&mock, server, peer_addr, StreamForwarder::new(64)).await;
            assert!(result.is_err());

            let mut written = Vec::new();
            client.read_to_end(&mut written).await.unwrap();
            assert_eq!(written, vec![5, 0, 5, code, 0, 1, 0, 0, 0, 0, 0, 0]);
        }
    }

    #[tokio::test]
    async fn test_socks4_connect_and_bind_rejected() {
        let mock = MockEngine::new();
        let mut peers = mock.take_direct_peers();
        let peer_addr: SocketAddr = "127.0.0.1:40001".parse().unwrap();

        let (server, mut client) = tokio::io::duplex(256);
        client.write_all(&[4, 2, 0, 21, 10, 1, 1, 1, 0]).await.unwrap();
        let result = serve_client(&mock, server, peer_addr, StreamForwarder::new(64)).await;
        assert!(result.is_err());
        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        assert_eq!(written, vec![0, 91, 0, 0, 0, 0, 0, 0]);
        assert!(mock.calls().is_empty());

        let (server, mut client) = tokio::io::duplex(256);
        let task = tokio::spawn(async move {
            let mock = mock;
            serve_client(&mock, server, peer_addr, StreamForwarder::new(64)).await
        });
        client.write_all(&[4, 1, 0, 80, 10, 1, 1, 1, 0]).await.unwrap();
        let mut granted = [0u8; 8];
        client.read_exact(&mut granted).await.unwrap();
        assert_eq!(granted[..2], [0, 90]);

        let peer = peers.recv().await.unwrap();
        assert_eq!((peer.host.as_str(), peer.port), ("10.1.1.1", 80));
        drop(peer);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_unknown_version_answered_and_closed() {
        let mock = MockEngine::new();
        let peer_addr: SocketAddr = "127.0.0.1:40002".parse().unwrap();
        let (server, mut client) = tokio::io::duplex(256);
        client.write_all(b"\x16\x03\x01").await.unwrap();

        let result = serve_client(&mock, server, peer_addr, StreamForwarder::new(64)).await;
        assert!(result.is_err());
        let mut written = Vec::new();
        client.read_to_end(&mut written).await.unwrap();
        assert_eq!(written, vec![5, 1, 0, 1, 0, 0, 0, 0, 0, 0]);
    }
}
