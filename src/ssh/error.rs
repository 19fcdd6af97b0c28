//! SSH Error types

use std::fmt;
use std::io;

use thiserror::Error;

/// Why a direct channel (or the TCP connect behind it) could not be opened.
///
/// Kept as a closed set so the SOCKS acceptor can map every failure to a
/// reply code without inspecting message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenFailure {
    HostUnreachable,
    ConnectionRefused,
    TimedOut,
    Other,
}

impl OpenFailure {
    /// Classify a local socket error.
    pub fn from_io(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => OpenFailure::ConnectionRefused,
            io::ErrorKind::TimedOut => OpenFailure::TimedOut,
            _ => OpenFailure::Other,
        }
    }
}

impl fmt::Display for OpenFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpenFailure::HostUnreachable => write!(f, "host unreachable"),
            OpenFailure::ConnectionRefused => write!(f, "connection refused"),
            OpenFailure::TimedOut => write!(f, "timed out"),
            OpenFailure::Other => write!(f, "open failed"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Host key for {0} was not accepted")]
    HostKeyRejected(String),

    #[error("Authentication failed after {0} attempts")]
    AuthExhausted(u32),

    #[error("Port forward failed: {0}")]
    Forward(String),

    #[error("Channel open failed ({reason}): {message}")]
    ChannelOpen {
        reason: OpenFailure,
        message: String,
    },

    #[error("Remote end closed connection")]
    StreamClosed,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Disconnected")]
    Disconnected,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SshError {
    /// The transport is gone; nothing further can be tried on it
    pub fn is_connection_lost(&self) -> bool {
        matches!(self, SshError::Disconnected | SshError::NotConnected)
    }

    /// Nearest [`OpenFailure`] for errors raised while opening an upstream.
    pub fn open_failure(&self) -> OpenFailure {
        match self {
            SshError::ChannelOpen { reason, .. } => *reason,
            SshError::Timeout(_) => OpenFailure::TimedOut,
            SshError::IoError(e) => OpenFailure::from_io(e),
            _ => OpenFailure::Other,
        }
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        match err {
            russh::Error::ChannelOpenFailure(failure) => {
                let reason = match failure {
                    russh::ChannelOpenFailure::ConnectFailed => OpenFailure::HostUnreachable,
                    _ => OpenFailure::Other,
                };
                SshError::ChannelOpen {
                    reason,
                    message: format!("{:?}", failure),
                }
            }
            russh::Error::Disconnect => SshError::Disconnected,
            other => SshError::ProtocolError(other.to_string()),
        }
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}
