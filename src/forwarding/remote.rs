//! Remote Port Forwarding
//!
//! Asks the server to listen on a port; every connection it accepts arrives
//! as a forwarded channel, which is spliced to a TCP connection made locally
//! to the destination.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::stream::{ConnectionGuard, ForwardStats, SharedStats, StreamForwarder};
use crate::ssh::engine::ForwardedChannelHandler;
use crate::ssh::{BoxedStream, SshError, WireEngine};

/// Remote port forwarding configuration
#[derive(Debug, Clone)]
pub struct RemoteForward {
    /// Address the server binds ("" lets the server choose)
    pub remote_addr: String,
    pub remote_port: u16,
    /// Destination reached from this side
    pub local_host: String,
    pub local_port: u16,
    pub buffer_size: usize,
    pub connect_timeout: Duration,
}

/// Registration token for a remote forward
pub struct RemoteForwardHandle {
    pub config: RemoteForward,
    /// Port the server listens on; differs from `config.remote_port` when 0 was requested
    pub bound_port: u16,
    stats: SharedStats,
}

impl RemoteForwardHandle {
    /// Cancel the server-side listener
    pub async fn stop(self, engine: &dyn WireEngine) -> Result<(), SshError> {
        info!(
            "Stopping remote port forward {}:{}",
            self.config.remote_addr, self.bound_port
        );
        engine
            .cancel_remote_port_forwarding(&self.config.remote_addr, self.bound_port)
            .await
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }
}

/// Start remote port forwarding
pub async fn start_remote_forward(
    engine: &dyn WireEngine,
    config: RemoteForward,
) -> Result<RemoteForwardHandle, SshError> {
    let stats = SharedStats::default();
    let handler = channel_handler(&config, stats.clone());

    let bound_port = engine
        .request_remote_port_forwarding(&config.remote_addr, config.remote_port, handler)
        .await?;

    info!(
        "Started remote port forward: {}:{} -> {}:{}",
        config.remote_addr, bound_port, config.local_host, config.local_port
    );
    Ok(RemoteForwardHandle {
        config,
        bound_port,
        stats,
    })
}

fn channel_handler(config: &RemoteForward, stats: SharedStats) -> ForwardedChannelHandler {
    let local_host = Arc::new(config.local_host.clone());
    let local_port = config.local_port;
    let buffer_size = config.buffer_size;
    let connect_timeout = config.connect_timeout;

    Arc::new(move |channel: BoxedStream, origin_addr: String, origin_port: u16| {
        let local_host = local_host.clone();
        let stats = stats.clone();
        debug!(
            "Forwarded connection from {}:{} for {}:{}",
            origin_addr, origin_port, local_host, local_port
        );
        tokio::spawn(async move {
            let _guard = ConnectionGuard::new(stats.clone());
            let target = (local_host.as_str(), local_port);
            let local_stream =
                match tokio::time::timeout(connect_timeout, TcpStream::connect(target)).await {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        warn!(
                            "Failed to connect to {}:{} for remote forward: {}",
                            local_host, local_port, e
                        );
                        return;
                    }
                    Err(_) => {
                        warn!(
                            "Timed out connecting to {}:{} for remote forward",
                            local_host, local_port
                        );
                        return;
                    }
                };
            if let Err(e) = local_stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY: {}", e);
            }

            StreamForwarder::new(buffer_size)
                .with_stats(stats)
                .run(local_stream, channel)
                .await;
        });
    })
}
