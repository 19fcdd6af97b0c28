//! Local Port Forwarding
//!
//! Listens on a local port and, per accepted connection, opens a
//! direct-tcpip channel to the destination and splices the two.
//! The listener machinery here is shared with the SOCKS proxy.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::stream::{ConnectionGuard, ForwardStats, SharedStats, StreamForwarder};
use crate::ssh::{SshError, WireEngine};

/// Handle to a running listener (local forward or SOCKS proxy)
pub struct ListenerHandle {
    /// Actual bound address (differs from the request when port 0 was asked)
    pub bound_addr: SocketAddr,
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    stats: SharedStats,
    task: JoinHandle<()>,
}

impl ListenerHandle {
    /// Stop accepting and wait until the socket is unbound.
    ///
    /// Connections already being relayed keep running until either end closes.
    pub async fn stop(self) {
        info!("Stopping listener on {}", self.bound_addr);
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(()).await;
        if let Err(e) = self.task.await {
            warn!("Listener task on {} ended abnormally: {}", self.bound_addr, e);
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> ForwardStats {
        self.stats.read().clone()
    }
}

/// Bind a listener, mapping the common failures to readable errors
pub(crate) async fn bind_listener(addr: &str) -> Result<TcpListener, SshError> {
    TcpListener::bind(addr).await.map_err(|e| match e.kind() {
        std::io::ErrorKind::AddrInUse => SshError::Forward(format!(
            "Port already in use: {}. Another application may be using this port.",
            addr
        )),
        std::io::ErrorKind::PermissionDenied => SshError::Forward(format!(
            "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
            addr
        )),
        std::io::ErrorKind::AddrNotAvailable => SshError::Forward(format!(
            "Address not available: {}. The specified address is not valid on this system.",
            addr
        )),
        _ => SshError::Forward(format!("Failed to bind to {}: {}", addr, e)),
    })
}

/// Run an accept loop on `listener`, handing each connection to `on_accept`
/// on its own task, until stopped or the SSH connection drops.
pub(crate) fn spawn_listener<F, Fut>(
    listener: TcpListener,
    label: String,
    mut disconnect_rx: broadcast::Receiver<String>,
    on_accept: F,
) -> Result<ListenerHandle, SshError>
where
    F: Fn(TcpStream, SocketAddr, SharedStats) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let bound_addr = listener
        .local_addr()
        .map_err(|e| SshError::Forward(format!("Failed to get bound address: {}", e)))?;

    let running = Arc::new(AtomicBool::new(true));
    let running_clone = running.clone();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let stats = SharedStats::default();
    let stats_clone = stats.clone();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Ok(reason) = disconnect_rx.recv() => {
                    info!("{} on {} stopped: {}", label, bound_addr, reason);
                    break;
                }

                _ = stop_rx.recv() => {
                    info!("{} on {} stopped by request", label, bound_addr);
                    break;
                }

                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            if !running_clone.load(Ordering::SeqCst) {
                                break;
                            }

                            // Disable Nagle's algorithm for low-latency forwarding
                            if let Err(e) = stream.set_nodelay(true) {
                                warn!("Failed to set TCP_NODELAY: {}", e);
                            }

                            debug!("{}: accepted connection from {}", label, peer_addr);
                            tokio::spawn(on_accept(stream, peer_addr, stats_clone.clone()));
                        }
                        Err(e) => {
                            error!("{} accept error: {}", label, e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        running_clone.store(false, Ordering::SeqCst);
        debug!("{} task on {} exited", label, bound_addr);
    });

    Ok(ListenerHandle {
        bound_addr,
        running,
        stop_tx,
        stats,
        task,
    })
}

/// Where a local forward sends its connections
#[derive(Debug, Clone)]
pub struct LocalForward {
    /// Local address to bind to (e.g., "127.0.0.1:8888")
    pub local_addr: String,
    pub dest_host: String,
    pub dest_port: u16,
    pub buffer_size: usize,
}

/// Start local port forwarding
pub async fn start_local_forward(
    engine: Arc<dyn WireEngine>,
    config: LocalForward,
) -> Result<ListenerHandle, SshError> {
    let listener = bind_listener(&config.local_addr).await?;
    let disconnect_rx = engine.subscribe_connection_lost();
    let dest_host = Arc::new(config.dest_host.clone());
    let dest_port = config.dest_port;
    let buffer_size = config.buffer_size;

    let handle = spawn_listener(
        listener,
        "Local port forward".to_string(),
        disconnect_rx,
        move |stream, peer_addr, stats| {
            let engine = engine.clone();
            let dest_host = dest_host.clone();
            async move {
                let _guard = ConnectionGuard::new(stats.clone());
                if let Err(e) = handle_forward_connection(
                    engine.as_ref(),
                    stream,
                    peer_addr,
                    &dest_host,
                    dest_port,
                    StreamForwarder::new(buffer_size).with_stats(stats),
                )
                .await
                {
                    warn!("Forward connection error: {}", e);
                }
            }
        },
    )?;

    info!(
        "Started local port forward: {} -> {}:{}",
        handle.bound_addr, config.dest_host, config.dest_port
    );
    Ok(handle)
}

async fn handle_forward_connection(
    engine: &dyn WireEngine,
    local_stream: TcpStream,
    peer_addr: SocketAddr,
    dest_host: &str,
    dest_port: u16,
    forwarder: StreamForwarder,
) -> Result<(), SshError> {
    let channel = engine
        .open_direct_tcpip(
            dest_host,
            dest_port,
            &peer_addr.ip().to_string(),
            peer_addr.port(),
        )
        .await?;
    debug!("Opened channel for forward to {}:{}", dest_host, dest_port);

    forwarder.run(local_stream, channel).await;
    Ok(())
}
