//! Shell channels over russh
//!
//! A started shell channel is owned by one task that multiplexes writes,
//! window changes and close requests against `channel.wait()`, the same
//! select loop used for every interactive channel.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info};

use super::engine::{
    AgentChannelHandler, SessionChannel, ShellControl, ShellEvent, ShellInput, ShellIo,
    TerminalGeometry,
};
use super::error::SshError;

/// Where the client handler delivers agent channels opened by the server
pub(crate) type AgentSlot = Arc<RwLock<Option<AgentChannelHandler>>>;

/// Commands that can be sent to the shell task
#[derive(Debug)]
enum ShellCommand {
    /// Data to send to stdin
    Data(Vec<u8>),
    /// Change the PTY size
    Resize(TerminalGeometry, oneshot::Sender<Result<(), SshError>>),
    /// Close stdin
    Eof,
    /// Close the channel
    Close,
}

/// Session channel before its shell is started
pub(crate) struct RusshSessionChannel {
    channel: Channel<Msg>,
    agent_slot: AgentSlot,
    label: String,
}

impl RusshSessionChannel {
    pub(crate) fn new(channel: Channel<Msg>, agent_slot: AgentSlot, label: String) -> Self {
        Self {
            channel,
            agent_slot,
            label,
        }
    }
}

#[async_trait]
impl SessionChannel for RusshSessionChannel {
    async fn request_agent_forwarding(
        &mut self,
        handler: AgentChannelHandler,
    ) -> Result<(), SshError> {
        *self.agent_slot.write() = Some(handler);
        self.channel
            .agent_forward(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Agent forwarding request failed: {}", e)))
    }

    async fn request_pty(&mut self, term: &str, geometry: TerminalGeometry) -> Result<(), SshError> {
        self.channel
            .request_pty(
                false,
                term,
                geometry.cols,
                geometry.rows,
                geometry.width_px,
                geometry.height_px,
                &[],
            )
            .await
            .map_err(|e| SshError::ChannelError(format!("PTY request failed: {}", e)))
    }

    async fn start_shell(&mut self) -> Result<(), SshError> {
        self.channel
            .request_shell(false)
            .await
            .map_err(|e| SshError::ChannelError(format!("Shell request failed: {}", e)))
    }

    fn into_io(self: Box<Self>) -> ShellIo {
        let RusshSessionChannel { channel, label, .. } = *self;
        spawn_shell_task(channel, label)
    }
}

fn spawn_shell_task(mut channel: Channel<Msg>, label: String) -> ShellIo {
    let (cmd_tx, mut cmd_rx) = mpsc::channel::<ShellCommand>(1024);
    let (event_tx, event_rx) = mpsc::channel::<ShellEvent>(1024);

    tokio::spawn(async move {
        debug!("Shell channel task started for {}", label);

        loop {
            tokio::select! {
                Some(cmd) = cmd_rx.recv() => {
                    match cmd {
                        ShellCommand::Data(data) => {
                            if let Err(e) = channel.data(&data[..]).await {
                                error!("Failed to send data to shell channel: {}", e);
                                break;
                            }
                        }
                        ShellCommand::Resize(geometry, reply_tx) => {
                            let result = channel
                                .window_change(
                                    geometry.cols,
                                    geometry.rows,
                                    geometry.width_px,
                                    geometry.height_px,
                                )
                                .await
                                .map_err(|e| SshError::ChannelError(e.to_string()));
                            let _ = reply_tx.send(result);
                        }
                        ShellCommand::Eof => {
                            let _ = channel.eof().await;
                        }
                        ShellCommand::Close => {
                            info!("Close command received for {}", label);
                            let _ = channel.eof().await;
                            let _ = channel.close().await;
                            break;
                        }
                    }
                }

                msg = channel.wait() => {
                    let event = match msg {
                        Some(ChannelMsg::Data { data }) => ShellEvent::Stdout(Bytes::copy_from_slice(&data)),
                        Some(ChannelMsg::ExtendedData { data, ext: 1 }) => {
                            ShellEvent::Stderr(Bytes::copy_from_slice(&data))
                        }
                        Some(ChannelMsg::ExitStatus { exit_status }) => {
                            info!("Shell exit status {} for {}", exit_status, label);
                            ShellEvent::ExitStatus(exit_status)
                        }
                        Some(ChannelMsg::Eof) => ShellEvent::Eof,
                        Some(ChannelMsg::Close) | None => {
                            info!("Shell channel closed for {}", label);
                            let _ = event_tx.send(ShellEvent::Closed).await;
                            break;
                        }
                        Some(_) => continue,
                    };
                    if event_tx.send(event).await.is_err() {
                        debug!("Shell reader for {} went away", label);
                        break;
                    }
                }
            }
        }

        debug!("Shell channel task terminated for {}", label);
    });

    let control = Arc::new(ChannelControl {
        cmd_tx: cmd_tx.clone(),
    });
    ShellIo {
        input: Box::new(ChannelInput { cmd_tx }),
        events: event_rx,
        control,
    }
}

fn channel_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "shell channel closed")
}

struct ChannelInput {
    cmd_tx: mpsc::Sender<ShellCommand>,
}

#[async_trait]
impl ShellInput for ChannelInput {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.cmd_tx
            .send(ShellCommand::Data(data.to_vec()))
            .await
            .map_err(|_| channel_gone())
    }

    async fn flush(&mut self) -> io::Result<()> {
        if self.cmd_tx.is_closed() {
            return Err(channel_gone());
        }
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        let _ = self.cmd_tx.send(ShellCommand::Eof).await;
        Ok(())
    }
}

struct ChannelControl {
    cmd_tx: mpsc::Sender<ShellCommand>,
}

#[async_trait]
impl ShellControl for ChannelControl {
    async fn resize(&self, geometry: TerminalGeometry) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(ShellCommand::Resize(geometry, reply_tx))
            .await
            .map_err(|_| SshError::NotConnected)?;
        reply_rx.await.map_err(|_| SshError::NotConnected)?
    }

    async fn close(&self) {
        let _ = self.cmd_tx.send(ShellCommand::Close).await;
    }
}
