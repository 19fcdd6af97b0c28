//! Wire protocol seam
//!
//! Everything the session core needs from an SSH implementation, expressed
//! as object-safe async traits. [`RusshEngine`](super::client::RusshEngine)
//! is the production implementation; tests drive the core through a
//! scripted engine.
//!
//! ```text
//! SshTransport ──▶ WireEngine ──▶ SessionChannel ──into_io()──▶ ShellIo
//!                      │                                     ├─ input   (ShellInput)
//!                      │                                     ├─ events  (mpsc<ShellEvent>)
//!                      │                                     └─ control (ShellControl)
//!                      └──▶ open_direct_tcpip() ──▶ BoxedStream
//! ```

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use russh::keys::PrivateKey;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};

use super::error::SshError;

/// Any duplex byte stream: a TCP socket, a forwarded channel, an in-memory pipe.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + ?Sized> DuplexStream for T {}

pub type BoxedStream = Box<dyn DuplexStream>;

/// Receives agent channels opened by the server after agent forwarding was granted
pub type AgentChannelHandler = Arc<dyn Fn(BoxedStream) + Send + Sync>;

/// Receives channels for a remote forward: stream, originator address and port
pub type ForwardedChannelHandler = Arc<dyn Fn(BoxedStream, String, u16) + Send + Sync>;

/// Authentication methods the core knows how to drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMethodKind {
    None,
    PublicKey,
    KeyboardInteractive,
    Password,
}

impl AuthMethodKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethodKind::None => "none",
            AuthMethodKind::PublicKey => "publickey",
            AuthMethodKind::KeyboardInteractive => "keyboard-interactive",
            AuthMethodKind::Password => "password",
        }
    }
}

/// Host key presented by the server during key exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerKey {
    pub algorithm: String,
    /// SSH wire encoding of the public key
    pub key_bytes: Vec<u8>,
}

impl ServerKey {
    pub fn new(algorithm: impl Into<String>, key_bytes: Vec<u8>) -> Self {
        Self {
            algorithm: algorithm.into(),
            key_bytes,
        }
    }

    /// OpenSSH style `SHA256:...` fingerprint
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.key_bytes)
    }
}

/// SHA256 fingerprint of a wire-encoded public key
pub fn fingerprint_of(key_bytes: &[u8]) -> String {
    let hash = Sha256::digest(key_bytes);
    format!("SHA256:{}", BASE64.encode(hash).trim_end_matches('='))
}

/// Negotiated connection parameters, narrated after the handshake
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
    pub server_id: Option<String>,
    pub compression: bool,
}

/// Terminal size in cells and pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalGeometry {
    pub cols: u32,
    pub rows: u32,
    pub width_px: u32,
    pub height_px: u32,
}

impl Default for TerminalGeometry {
    fn default() -> Self {
        Self {
            cols: 80,
            rows: 24,
            width_px: 0,
            height_px: 0,
        }
    }
}

/// One keyboard-interactive prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InteractivePrompt {
    pub prompt: String,
    pub echo: bool,
}

/// Decides whether the server's host key is acceptable.
///
/// Called from inside the engine's handshake; returning false aborts it.
#[async_trait]
pub trait ServerKeyVerifier: Send + Sync {
    async fn verify_server_key(&self, host: &str, port: u16, key: &ServerKey) -> bool;
}

/// Answers one keyboard-interactive round.
///
/// Returns `None` when the user cancelled, which abandons the attempt.
#[async_trait]
pub trait InteractiveResponder: Send {
    async fn respond(
        &mut self,
        name: &str,
        instructions: &str,
        prompts: &[InteractivePrompt],
    ) -> Option<Vec<String>>;
}

/// Output of a running shell channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellEvent {
    Stdout(Bytes),
    Stderr(Bytes),
    ExitStatus(u32),
    Eof,
    Closed,
}

/// Writer side of a shell channel
#[async_trait]
pub trait ShellInput: Send {
    async fn write(&mut self, data: &[u8]) -> io::Result<()>;
    async fn flush(&mut self) -> io::Result<()>;
    async fn close(&mut self) -> io::Result<()>;
}

/// [`ShellInput`] over any `AsyncWrite`
pub struct StreamInput<W>(pub W);

#[async_trait]
impl<W: AsyncWrite + Send + Unpin> ShellInput for StreamInput<W> {
    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.0.write_all(data).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.0.flush().await
    }

    async fn close(&mut self) -> io::Result<()> {
        self.0.shutdown().await
    }
}

/// Out-of-band operations on a shell channel
#[async_trait]
pub trait ShellControl: Send + Sync {
    async fn resize(&self, geometry: TerminalGeometry) -> Result<(), SshError>;
    async fn close(&self);
}

/// A started shell split into its independently owned parts
pub struct ShellIo {
    pub input: Box<dyn ShellInput>,
    pub events: mpsc::Receiver<ShellEvent>,
    pub control: Arc<dyn ShellControl>,
}

/// A freshly opened session channel, before the shell starts
#[async_trait]
pub trait SessionChannel: Send {
    async fn request_agent_forwarding(&mut self, handler: AgentChannelHandler)
        -> Result<(), SshError>;
    async fn request_pty(&mut self, term: &str, geometry: TerminalGeometry) -> Result<(), SshError>;
    async fn start_shell(&mut self) -> Result<(), SshError>;
    fn into_io(self: Box<Self>) -> ShellIo;
}

/// The SSH connection primitives consumed by the session core
#[async_trait]
pub trait WireEngine: Send + Sync {
    /// Must be called before `connect` to take effect
    fn set_compression(&self, enabled: bool) -> Result<(), SshError>;

    async fn connect(
        &self,
        host: &str,
        port: u16,
        verifier: Arc<dyn ServerKeyVerifier>,
    ) -> Result<ConnectionInfo, SshError>;

    async fn authenticate_none(&self, user: &str) -> Result<bool, SshError>;

    async fn authenticate_password(&self, user: &str, password: &str) -> Result<bool, SshError>;

    async fn authenticate_publickey(&self, user: &str, key: Arc<PrivateKey>)
        -> Result<bool, SshError>;

    async fn authenticate_keyboard_interactive(
        &self,
        user: &str,
        responder: &mut dyn InteractiveResponder,
    ) -> Result<bool, SshError>;

    async fn is_auth_method_available(
        &self,
        user: &str,
        method: AuthMethodKind,
    ) -> Result<bool, SshError>;

    fn is_authentication_complete(&self) -> bool;

    async fn open_session(&self) -> Result<Box<dyn SessionChannel>, SshError>;

    async fn open_direct_tcpip(
        &self,
        dest_host: &str,
        dest_port: u16,
        origin_host: &str,
        origin_port: u16,
    ) -> Result<BoxedStream, SshError>;

    /// Ask the server to listen on `bind_port`; every connection it accepts
    /// there arrives as a channel passed to `on_channel`. Returns the port
    /// the server actually bound, which differs when `bind_port` is 0.
    async fn request_remote_port_forwarding(
        &self,
        bind_address: &str,
        bind_port: u16,
        on_channel: ForwardedChannelHandler,
    ) -> Result<u16, SshError>;

    async fn cancel_remote_port_forwarding(
        &self,
        bind_address: &str,
        bind_port: u16,
    ) -> Result<(), SshError>;

    /// Fires once with a reason when the transport drops underneath us
    fn subscribe_connection_lost(&self) -> broadcast::Receiver<String>;

    async fn close(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        let fp = fingerprint_of(b"not really a key");
        assert!(fp.starts_with("SHA256:"));
        assert!(!fp.ends_with('='));
        assert_eq!(fp, ServerKey::new("ssh-ed25519", b"not really a key".to_vec()).fingerprint());
    }

    #[tokio::test]
    async fn test_stream_input_writes_through() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut input = StreamInput(a);
        input.write(b"hello").await.unwrap();
        input.flush().await.unwrap();
        input.close().await.unwrap();

        let mut out = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut b, &mut out).await.unwrap();
        assert_eq!(out, b"hello");
    }
}
