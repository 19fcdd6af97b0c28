//! Scripted collaborators shared by the unit tests

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use russh::keys::PrivateKey;
use tokio::io::DuplexStream;
use tokio::sync::{broadcast, mpsc};

use crate::agent::keys::public_blob;
use crate::ssh::engine::{
    AgentChannelHandler, AuthMethodKind, BoxedStream, ConnectionInfo, ForwardedChannelHandler,
    InteractivePrompt, InteractiveResponder, ServerKey, ServerKeyVerifier, SessionChannel,
    ShellControl, ShellEvent, ShellIo, StreamInput, TerminalGeometry, WireEngine,
};
use crate::ssh::{CredentialSource, OpenFailure, SshError};

/// Port the mock "server" assigns when a remote forward asks for port 0
pub(crate) const MOCK_ASSIGNED_PORT: u16 = 40000;

#[derive(Default)]
struct PromptScript {
    booleans: VecDeque<Option<bool>>,
    strings: VecDeque<Option<String>>,
    asked: Vec<String>,
}

/// Answers prompts from fixed queues; an empty queue answers "cancelled"
#[derive(Clone, Default)]
pub(crate) struct ScriptedPrompts {
    inner: Arc<Mutex<PromptScript>>,
}

impl ScriptedPrompts {
    pub(crate) fn booleans(answers: impl IntoIterator<Item = Option<bool>>) -> Self {
        let prompts = Self::default();
        prompts.inner.lock().booleans.extend(answers);
        prompts
    }

    pub(crate) fn with_strings<S: Into<String>>(
        self,
        answers: impl IntoIterator<Item = Option<S>>,
    ) -> Self {
        self.inner
            .lock()
            .strings
            .extend(answers.into_iter().map(|a| a.map(Into::into)));
        self
    }

    /// Messages of every prompt shown so far
    pub(crate) fn asked(&self) -> Vec<String> {
        self.inner.lock().asked.clone()
    }
}

#[async_trait]
impl CredentialSource for ScriptedPrompts {
    async fn request_boolean(&self, _title: Option<&str>, message: &str) -> Option<bool> {
        let mut inner = self.inner.lock();
        inner.asked.push(message.to_string());
        inner.booleans.pop_front().flatten()
    }

    async fn request_string(
        &self,
        _title: Option<&str>,
        message: &str,
        _secret: bool,
    ) -> Option<String> {
        let mut inner = self.inner.lock();
        inner.asked.push(message.to_string());
        inner.strings.pop_front().flatten()
    }
}

/// Server side of a direct channel opened through [`MockEngine`]
pub(crate) struct DirectPeer {
    pub host: String,
    pub port: u16,
    pub stream: DuplexStream,
}

/// Test side of the shell opened through [`MockEngine`]
pub(crate) struct ShellPeer {
    pub events: mpsc::Sender<ShellEvent>,
    /// Everything the session wrote to the shell's stdin
    pub input: DuplexStream,
    pub resizes: Arc<Mutex<Vec<TerminalGeometry>>>,
}

struct MockState {
    host_key: ServerKey,
    connect_error: Option<String>,
    methods: Vec<AuthMethodKind>,
    accept_none: bool,
    passwords: Vec<String>,
    accepted_keys: Vec<Vec<u8>>,
    erroring_keys: Vec<Vec<u8>>,
    ki_outcomes: VecDeque<bool>,
    authenticated: bool,
    direct_failures: HashMap<(String, u16), OpenFailure>,
    remote_fails: bool,
    resize_fails: bool,
    shell_fails: bool,
    shell: Option<ShellPeer>,
    agent_handler: Option<AgentChannelHandler>,
    remote_listeners: HashMap<u16, ForwardedChannelHandler>,
    calls: Vec<String>,
}

/// Scripted [`WireEngine`]: records every call and answers from its script
pub(crate) struct MockEngine {
    state: Arc<Mutex<MockState>>,
    direct_tx: mpsc::UnboundedSender<DirectPeer>,
    direct_rx: Mutex<Option<mpsc::UnboundedReceiver<DirectPeer>>>,
    lost_tx: broadcast::Sender<String>,
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        let (direct_tx, direct_rx) = mpsc::unbounded_channel();
        let (lost_tx, _) = broadcast::channel(4);
        Self {
            state: Arc::new(Mutex::new(MockState {
                host_key: ServerKey::new("ssh-ed25519", vec![7; 51]),
                connect_error: None,
                methods: vec![AuthMethodKind::Password],
                accept_none: false,
                passwords: Vec::new(),
                accepted_keys: Vec::new(),
                erroring_keys: Vec::new(),
                ki_outcomes: VecDeque::new(),
                authenticated: false,
                direct_failures: HashMap::new(),
                remote_fails: false,
                resize_fails: false,
                shell_fails: false,
                shell: None,
                agent_handler: None,
                remote_listeners: HashMap::new(),
                calls: Vec::new(),
            })),
            direct_tx,
            direct_rx: Mutex::new(Some(direct_rx)),
            lost_tx,
        }
    }

    pub(crate) fn with_host_key(self, key: ServerKey) -> Self {
        self.state.lock().host_key = key;
        self
    }

    pub(crate) fn with_methods(self, methods: &[AuthMethodKind]) -> Self {
        self.state.lock().methods = methods.to_vec();
        self
    }

    pub(crate) fn accept_none(self) -> Self {
        self.state.lock().accept_none = true;
        self
    }

    pub(crate) fn accept_password(self, password: &str) -> Self {
        self.state.lock().passwords.push(password.to_string());
        self
    }

    pub(crate) fn accept_key(self, key: &PrivateKey) -> Self {
        self.state.lock().accepted_keys.push(public_blob(key));
        self
    }

    /// Publickey attempts with this key fail with a protocol error
    pub(crate) fn error_key(self, key: &PrivateKey) -> Self {
        self.state.lock().erroring_keys.push(public_blob(key));
        self
    }

    pub(crate) fn ki_outcomes(self, outcomes: impl IntoIterator<Item = bool>) -> Self {
        self.state.lock().ki_outcomes.extend(outcomes);
        self
    }

    pub(crate) fn fail_connect(self, message: &str) -> Self {
        self.state.lock().connect_error = Some(message.to_string());
        self
    }

    pub(crate) fn fail_direct(self, host: &str, port: u16, reason: OpenFailure) -> Self {
        self.state
            .lock()
            .direct_failures
            .insert((host.to_string(), port), reason);
        self
    }

    pub(crate) fn fail_remote_forward(self) -> Self {
        self.state.lock().remote_fails = true;
        self
    }

    pub(crate) fn fail_resize(self) -> Self {
        self.state.lock().resize_fails = true;
        self
    }

    pub(crate) fn fail_shell(self) -> Self {
        self.state.lock().shell_fails = true;
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub(crate) fn take_direct_peers(&self) -> mpsc::UnboundedReceiver<DirectPeer> {
        self.direct_rx
            .lock()
            .take()
            .expect("direct peers already taken")
    }

    pub(crate) fn take_shell(&self) -> Option<ShellPeer> {
        self.state.lock().shell.take()
    }

    /// Simulate the server opening an agent channel; returns the server end
    pub(crate) fn open_agent_channel(&self) -> Option<DuplexStream> {
        let handler = self.state.lock().agent_handler.clone()?;
        let (ours, theirs) = tokio::io::duplex(4096);
        handler(Box::new(theirs));
        Some(ours)
    }

    /// Simulate a connection accepted by the server on a remote forward
    pub(crate) fn open_forwarded(&self, bind_port: u16) -> Option<DuplexStream> {
        let handler = self.state.lock().remote_listeners.get(&bind_port).cloned()?;
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        handler(Box::new(theirs), "203.0.113.7".into(), 50022);
        Some(ours)
    }

    pub(crate) fn drop_connection(&self, reason: &str) {
        let _ = self.lost_tx.send(reason.to_string());
    }

    fn record(&self, call: impl Into<String>) {
        self.state.lock().calls.push(call.into());
    }

    fn finish_auth(&self, ok: bool) -> Result<bool, SshError> {
        if ok {
            self.state.lock().authenticated = true;
        }
        Ok(ok)
    }
}

#[async_trait]
impl WireEngine for MockEngine {
    fn set_compression(&self, enabled: bool) -> Result<(), SshError> {
        self.record(format!("compression:{}", enabled));
        Ok(())
    }

    async fn connect(
        &self,
        host: &str,
        port: u16,
        verifier: Arc<dyn ServerKeyVerifier>,
    ) -> Result<ConnectionInfo, SshError> {
        self.record(format!("connect:{}:{}", host, port));
        let (error, key) = {
            let state = self.state.lock();
            (state.connect_error.clone(), state.host_key.clone())
        };
        if let Some(message) = error {
            return Err(SshError::Handshake(message));
        }
        if !verifier.verify_server_key(host, port, &key).await {
            return Err(SshError::Handshake("server key was not accepted".into()));
        }
        Ok(ConnectionInfo {
            server_id: Some("SSH-2.0-MockSSH".into()),
            compression: false,
        })
    }

    async fn authenticate_none(&self, _user: &str) -> Result<bool, SshError> {
        self.record("auth:none");
        let ok = self.state.lock().accept_none;
        self.finish_auth(ok)
    }

    async fn authenticate_password(&self, _user: &str, password: &str) -> Result<bool, SshError> {
        self.record(format!("auth:password:{}", password));
        let ok = {
            let state = self.state.lock();
            state.methods.contains(&AuthMethodKind::Password)
                && state.passwords.iter().any(|p| p == password)
        };
        self.finish_auth(ok)
    }

    async fn authenticate_publickey(
        &self,
        _user: &str,
        key: Arc<PrivateKey>,
    ) -> Result<bool, SshError> {
        self.record(format!("auth:publickey:{}", key.comment()));
        let blob = public_blob(&key);
        let ok = {
            let state = self.state.lock();
            if state.erroring_keys.contains(&blob) {
                return Err(SshError::ProtocolError(format!(
                    "signing with {} failed",
                    key.comment()
                )));
            }
            state.methods.contains(&AuthMethodKind::PublicKey) && state.accepted_keys.contains(&blob)
        };
        self.finish_auth(ok)
    }

    async fn authenticate_keyboard_interactive(
        &self,
        _user: &str,
        responder: &mut dyn InteractiveResponder,
    ) -> Result<bool, SshError> {
        self.record("auth:keyboard-interactive");
        let prompts = [InteractivePrompt {
            prompt: "Verification code: ".into(),
            echo: false,
        }];
        if responder.respond("", "", &prompts).await.is_none() {
            return Ok(false);
        }
        let ok = self.state.lock().ki_outcomes.pop_front().unwrap_or(false);
        self.finish_auth(ok)
    }

    async fn is_auth_method_available(
        &self,
        _user: &str,
        method: AuthMethodKind,
    ) -> Result<bool, SshError> {
        Ok(self.state.lock().methods.contains(&method))
    }

    fn is_authentication_complete(&self) -> bool {
        self.state.lock().authenticated
    }

    async fn open_session(&self) -> Result<Box<dyn SessionChannel>, SshError> {
        self.record("session");
        if self.state.lock().shell_fails {
            return Err(SshError::ChannelError("session channel refused".into()));
        }
        Ok(Box::new(MockSessionChannel {
            state: self.state.clone(),
        }))
    }

    async fn open_direct_tcpip(
        &self,
        dest_host: &str,
        dest_port: u16,
        _origin_host: &str,
        _origin_port: u16,
    ) -> Result<BoxedStream, SshError> {
        self.record(format!("direct:{}:{}", dest_host, dest_port));
        let failure = self
            .state
            .lock()
            .direct_failures
            .get(&(dest_host.to_string(), dest_port))
            .copied();
        if let Some(reason) = failure {
            return Err(SshError::ChannelOpen {
                reason,
                message: format!("{}:{}", dest_host, dest_port),
            });
        }
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let _ = self.direct_tx.send(DirectPeer {
            host: dest_host.to_string(),
            port: dest_port,
            stream: theirs,
        });
        Ok(Box::new(ours))
    }

    async fn request_remote_port_forwarding(
        &self,
        bind_address: &str,
        bind_port: u16,
        on_channel: ForwardedChannelHandler,
    ) -> Result<u16, SshError> {
        self.record(format!("remote:{}:{}", bind_address, bind_port));
        let mut state = self.state.lock();
        if state.remote_fails {
            return Err(SshError::Forward("remote listener refused".into()));
        }
        let bound = if bind_port == 0 {
            MOCK_ASSIGNED_PORT
        } else {
            bind_port
        };
        state.remote_listeners.insert(bound, on_channel);
        Ok(bound)
    }

    async fn cancel_remote_port_forwarding(
        &self,
        bind_address: &str,
        bind_port: u16,
    ) -> Result<(), SshError> {
        self.record(format!("cancel:{}:{}", bind_address, bind_port));
        self.state.lock().remote_listeners.remove(&bind_port);
        Ok(())
    }

    fn subscribe_connection_lost(&self) -> broadcast::Receiver<String> {
        self.lost_tx.subscribe()
    }

    async fn close(&self) {
        self.record("close");
    }
}

struct MockSessionChannel {
    state: Arc<Mutex<MockState>>,
}

impl MockSessionChannel {
    fn record(&self, call: impl Into<String>) {
        self.state.lock().calls.push(call.into());
    }
}

#[async_trait]
impl SessionChannel for MockSessionChannel {
    async fn request_agent_forwarding(
        &mut self,
        handler: AgentChannelHandler,
    ) -> Result<(), SshError> {
        self.record("agent-forwarding");
        self.state.lock().agent_handler = Some(handler);
        Ok(())
    }

    async fn request_pty(&mut self, term: &str, geometry: TerminalGeometry) -> Result<(), SshError> {
        self.record(format!("pty:{}:{}x{}", term, geometry.cols, geometry.rows));
        Ok(())
    }

    async fn start_shell(&mut self) -> Result<(), SshError> {
        self.record("shell");
        Ok(())
    }

    fn into_io(self: Box<Self>) -> ShellIo {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let resizes = Arc::new(Mutex::new(Vec::new()));
        let control = Arc::new(MockShellControl {
            state: self.state.clone(),
            resizes: resizes.clone(),
        });
        self.state.lock().shell = Some(ShellPeer {
            events: events_tx,
            input: theirs,
            resizes,
        });
        ShellIo {
            input: Box::new(StreamInput(ours)),
            events: events_rx,
            control,
        }
    }
}

struct MockShellControl {
    state: Arc<Mutex<MockState>>,
    resizes: Arc<Mutex<Vec<TerminalGeometry>>>,
}

#[async_trait]
impl ShellControl for MockShellControl {
    async fn resize(&self, geometry: TerminalGeometry) -> Result<(), SshError> {
        if self.state.lock().resize_fails {
            return Err(SshError::ChannelError("window change refused".into()));
        }
        self.resizes.lock().push(geometry);
        Ok(())
    }

    async fn close(&self) {
        self.state.lock().calls.push("shell-close".into());
    }
}
