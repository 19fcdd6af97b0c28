//! Handle Owner Task
//!
//! This module implements the "single owner" pattern for the russh `Handle`.
//!
//! # Architecture
//!
//! Only one task owns the `Handle<ClientHandler>`. All other components
//! communicate with it via `HandleController` which sends commands through
//! an mpsc channel. Authentication needs `&mut Handle`, so it goes through
//! the same queue as channel opens and forward requests.
//!
//! The task also watches the transport: once russh reports the handle
//! closed, the reason is broadcast on the connection-lost channel.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(handle, lost_tx, "user@host:22".into());
//! let result = controller.authenticate_password("user", "secret").await?;
//! let channel = controller.open_session_channel().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use russh::client::{AuthResult, Handle, KeyboardInteractiveAuthResponse, Msg};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PrivateKey;
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use super::client::ClientHandler;
use super::error::SshError;

/// How often the owner task checks whether the transport went away
const CLOSED_POLL_INTERVAL: Duration = Duration::from_secs(1);

type Reply<T> = oneshot::Sender<Result<T, russh::Error>>;

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    AuthNone {
        user: String,
        reply_tx: Reply<AuthResult>,
    },

    AuthPassword {
        user: String,
        password: Zeroizing<String>,
        reply_tx: Reply<AuthResult>,
    },

    AuthPublicKey {
        user: String,
        key: Arc<PrivateKey>,
        reply_tx: Reply<AuthResult>,
    },

    /// Begin a keyboard-interactive exchange
    KbiStart {
        user: String,
        reply_tx: Reply<KeyboardInteractiveAuthResponse>,
    },

    /// Answer the server's latest info request
    KbiRespond {
        responses: Vec<String>,
        reply_tx: Reply<KeyboardInteractiveAuthResponse>,
    },

    /// Open a session channel (for PTY/shell)
    ChannelOpenSession { reply_tx: Reply<Channel<Msg>> },

    /// Open a direct-tcpip channel (for local forward / dynamic forward)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: Reply<Channel<Msg>>,
    },

    /// Request remote forward (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: Reply<u32>,
    },

    /// Cancel remote forward
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: Reply<()>,
    },

    /// Disconnect the SSH connection
    Disconnect,
}

/// Controller for sending commands to the Handle Owner Task
///
/// Cloning is cheap (it copies the sender). Any holder has full control of
/// the connection.
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
}

impl HandleController {
    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> HandleCommand,
    ) -> Result<T, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(build(reply_tx))
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(SshError::from)
    }

    pub async fn authenticate_none(&self, user: &str) -> Result<AuthResult, SshError> {
        let user = user.to_string();
        self.request(|reply_tx| HandleCommand::AuthNone { user, reply_tx })
            .await
    }

    pub async fn authenticate_password(
        &self,
        user: &str,
        password: &str,
    ) -> Result<AuthResult, SshError> {
        let user = user.to_string();
        let password = Zeroizing::new(password.to_string());
        self.request(|reply_tx| HandleCommand::AuthPassword {
            user,
            password,
            reply_tx,
        })
        .await
    }

    pub async fn authenticate_publickey(
        &self,
        user: &str,
        key: Arc<PrivateKey>,
    ) -> Result<AuthResult, SshError> {
        let user = user.to_string();
        self.request(|reply_tx| HandleCommand::AuthPublicKey {
            user,
            key,
            reply_tx,
        })
        .await
    }

    pub async fn kbi_start(&self, user: &str) -> Result<KeyboardInteractiveAuthResponse, SshError> {
        let user = user.to_string();
        self.request(|reply_tx| HandleCommand::KbiStart { user, reply_tx })
            .await
    }

    pub async fn kbi_respond(
        &self,
        responses: Vec<String>,
    ) -> Result<KeyboardInteractiveAuthResponse, SshError> {
        self.request(|reply_tx| HandleCommand::KbiRespond {
            responses,
            reply_tx,
        })
        .await
    }

    /// Open a session channel (for PTY/shell)
    pub async fn open_session_channel(&self) -> Result<Channel<Msg>, SshError> {
        self.request(|reply_tx| HandleCommand::ChannelOpenSession { reply_tx })
            .await
    }

    /// Open a direct-tcpip channel (for local forward / dynamic forward)
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let host = host.to_string();
        let originator_host = originator_host.to_string();
        self.request(|reply_tx| HandleCommand::ChannelOpenDirectTcpip {
            host,
            port,
            originator_host,
            originator_port,
            reply_tx,
        })
        .await
    }

    /// Request remote port forward (tcpip-forward)
    ///
    /// Returns the actual bound port (may differ if requested port was 0)
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let address = address.to_string();
        self.request(|reply_tx| HandleCommand::TcpipForward {
            address,
            port,
            reply_tx,
        })
        .await
    }

    /// Cancel a remote port forward
    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let address = address.to_string();
        self.request(|reply_tx| HandleCommand::CancelTcpipForward {
            address,
            port,
            reply_tx,
        })
        .await
    }

    /// Disconnect the SSH connection
    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// Spawn the Handle Owner Task
///
/// Consumes ownership of the Handle and returns a HandleController for
/// sending commands. `lost_tx` fires once if the transport closes on its own.
pub fn spawn_handle_owner_task(
    handle: Handle<ClientHandler>,
    lost_tx: broadcast::Sender<String>,
    label: String,
) -> HandleController {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<HandleCommand>(64);

    tokio::spawn(async move {
        let mut handle = handle; // Move into task, becomes sole owner
        let mut poll = tokio::time::interval(CLOSED_POLL_INTERVAL);

        info!("Handle owner task started for {}", label);

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        info!("All controllers dropped for {}", label);
                        break;
                    };
                    if !execute(&mut handle, cmd).await {
                        info!("Disconnect requested for {}", label);
                        break;
                    }
                }

                _ = poll.tick() => {
                    if handle.is_closed() {
                        warn!("Transport for {} closed by peer", label);
                        let _ = lost_tx.send(format!("Connection to {} lost", label));
                        break;
                    }
                }
            }
        }

        // Notify callers still waiting that the connection is closed
        drain_pending_commands(&mut cmd_rx);

        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Session closed", "en")
            .await;
        info!("Handle owner task terminated for {}", label);
    });

    HandleController { cmd_tx }
}

/// Run one command against the handle; false means stop the task
async fn execute(handle: &mut Handle<ClientHandler>, cmd: HandleCommand) -> bool {
    match cmd {
        HandleCommand::AuthNone { user, reply_tx } => {
            let _ = reply_tx.send(handle.authenticate_none(user).await);
        }

        HandleCommand::AuthPassword {
            user,
            password,
            reply_tx,
        } => {
            let result = handle
                .authenticate_password(user, password.as_str())
                .await;
            let _ = reply_tx.send(result);
        }

        HandleCommand::AuthPublicKey {
            user,
            key,
            reply_tx,
        } => {
            let hash_alg = if key.algorithm().is_rsa() {
                handle.best_supported_rsa_hash().await.ok().flatten().flatten()
            } else {
                None
            };
            let result = handle
                .authenticate_publickey(user, PrivateKeyWithHashAlg::new(key, hash_alg))
                .await;
            let _ = reply_tx.send(result);
        }

        HandleCommand::KbiStart { user, reply_tx } => {
            let result = handle
                .authenticate_keyboard_interactive_start(user, None::<String>)
                .await;
            let _ = reply_tx.send(result);
        }

        HandleCommand::KbiRespond {
            responses,
            reply_tx,
        } => {
            let result = handle
                .authenticate_keyboard_interactive_respond(responses)
                .await;
            let _ = reply_tx.send(result);
        }

        HandleCommand::ChannelOpenSession { reply_tx } => {
            let result = handle.channel_open_session().await;
            if reply_tx.send(result).is_err() {
                warn!("Caller dropped before receiving channel_open_session result");
            }
        }

        HandleCommand::ChannelOpenDirectTcpip {
            host,
            port,
            originator_host,
            originator_port,
            reply_tx,
        } => {
            let result = handle
                .channel_open_direct_tcpip(&host, port, &originator_host, originator_port)
                .await;
            if reply_tx.send(result).is_err() {
                debug!("Caller dropped before receiving direct_tcpip result");
            }
        }

        HandleCommand::TcpipForward {
            address,
            port,
            reply_tx,
        } => {
            let result = handle.tcpip_forward(&address, port).await;
            match &result {
                Ok(bound_port) => {
                    let bound_port = *bound_port;
                    if reply_tx.send(result).is_err() {
                        // Forward exists but nobody owns it: cancel it now
                        warn!(
                            "Caller dropped after tcpip_forward succeeded. \
                             Cancelling orphaned forward {}:{}",
                            address, bound_port
                        );
                        let _ = handle.cancel_tcpip_forward(&address, bound_port).await;
                    }
                }
                Err(_) => {
                    let _ = reply_tx.send(result);
                }
            }
        }

        HandleCommand::CancelTcpipForward {
            address,
            port,
            reply_tx,
        } => {
            let _ = reply_tx.send(handle.cancel_tcpip_forward(&address, port).await);
        }

        HandleCommand::Disconnect => return false,
    }
    true
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    // Close receiver first, prevent new messages
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::AuthNone { reply_tx, .. }
            | HandleCommand::AuthPassword { reply_tx, .. }
            | HandleCommand::AuthPublicKey { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::KbiStart { reply_tx, .. }
            | HandleCommand::KbiRespond { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::ChannelOpenSession { reply_tx }
            | HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Disconnect => {}
        }
    }
}
