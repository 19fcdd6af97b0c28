//! SSH session orchestrator
//!
//! [`SshTransport`] owns one host connection from handshake to teardown:
//!
//! ```text
//! connect()
//!   ├─ engine.connect ── HostKeyGate (trust store, prompt)
//!   ├─ Authenticator loop
//!   ├─ re-attach registered port forwards
//!   └─ shell: session channel ─ agent forwarding ─ pty ─ shell
//!         ├─ reader   (read / read_output)
//!         ├─ writer   (WriteDispatcher)
//!         └─ control  (resize / close)
//!
//! disconnect watcher ◀── DisconnectSignal ◀── read EOF | write failure | connection lost | close()
//! ```
//!
//! Teardown runs on the watcher task only, so no callback re-enters the
//! public API.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::{
    DisconnectNotice, DisconnectSignal, EventEmitter, SessionEvent, Transcript, TranscriptLine,
};
use super::host_key::{HostKeyDecision, HostKeyGate};
use super::state::{SessionState, StateCell};
use super::writer::WriteDispatcher;
use crate::agent::{AgentBridge, IdentityRegistry};
use crate::config::TransportSettings;
use crate::forwarding::{PortForwardRegistry, PortForwardSpec, PortForwardView};
use crate::ssh::engine::{AgentChannelHandler, ShellControl, ShellIo};
use crate::ssh::{
    AgentForwarding, Authenticator, CredentialSource, HostProfile, KeyStore, ShellEvent, SshError,
    TerminalGeometry, TrustStore, WireEngine,
};

const OPTION_COMPRESSION: &str = "compression";
/// Upper bound on waiting for queued shell writes during `close()`
const WRITE_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// External collaborators of one transport
#[derive(Clone)]
pub struct SessionDeps {
    pub engine: Arc<dyn WireEngine>,
    pub trust: Arc<dyn TrustStore>,
    pub prompts: Arc<dyn CredentialSource>,
    pub keys: Arc<dyn KeyStore>,
    /// Process-wide; shared by every session that forwards the agent
    pub identities: Arc<IdentityRegistry>,
}

/// One chunk of shell output, with its stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellOutput {
    Stdout(Bytes),
    Stderr(Bytes),
}

struct ShellReader {
    events: mpsc::Receiver<ShellEvent>,
    pending: BytesMut,
    disconnect: DisconnectSignal,
}

impl ShellReader {
    async fn next_output(&mut self) -> Result<ShellOutput, SshError> {
        loop {
            match self.events.recv().await {
                Some(ShellEvent::Stdout(data)) => return Ok(ShellOutput::Stdout(data)),
                Some(ShellEvent::Stderr(data)) => return Ok(ShellOutput::Stderr(data)),
                Some(ShellEvent::ExitStatus(code)) => {
                    info!("Remote shell exited with status {}", code);
                }
                Some(ShellEvent::Eof) | Some(ShellEvent::Closed) | None => {
                    self.disconnect.fire(false, "Remote end closed connection");
                    return Err(SshError::StreamClosed);
                }
            }
        }
    }
}

/// Per-connection tasks
struct Connection {
    disconnect: DisconnectSignal,
    watcher: JoinHandle<()>,
}

/// Pieces the disconnect watcher tears down
struct Teardown {
    engine: Arc<dyn WireEngine>,
    forwards: Arc<PortForwardRegistry>,
    state: Arc<StateCell>,
    events: EventEmitter,
    transcript: Transcript,
    control: Option<Arc<dyn ShellControl>>,
    lost_task: JoinHandle<()>,
}

impl Teardown {
    async fn run(self, notice: DisconnectNotice) {
        info!(
            "Tearing down session (clean: {}): {}",
            notice.clean, notice.reason
        );
        self.lost_task.abort();
        if let Some(control) = &self.control {
            control.close().await;
        }
        self.forwards.disable_all(self.engine.as_ref()).await;
        self.engine.close().await;

        if !notice.clean {
            self.transcript.push(notice.reason.clone());
        }
        set_state(
            &self.state,
            &self.events,
            SessionState::Disconnected(notice.reason.clone()),
        );
        self.events.emit(SessionEvent::Disconnected {
            clean: notice.clean,
            reason: notice.reason,
        });
    }
}

fn set_state(state: &StateCell, events: &EventEmitter, next: SessionState) {
    if state.transition(next.clone()) {
        events.emit(SessionEvent::StateChanged { state: next });
    }
}

/// SSH transport for one host profile
pub struct SshTransport {
    profile: HostProfile,
    settings: TransportSettings,
    deps: SessionDeps,
    state: Arc<StateCell>,
    events: EventEmitter,
    transcript: Transcript,
    forwards: Arc<PortForwardRegistry>,
    compression: AtomicBool,
    geometry: RwLock<TerminalGeometry>,

    writer: RwLock<Option<Arc<WriteDispatcher>>>,
    control: RwLock<Option<Arc<dyn ShellControl>>>,
    reader: Mutex<Option<ShellReader>>,
    connection: Mutex<Option<Connection>>,
}

impl SshTransport {
    pub fn new(profile: HostProfile, settings: TransportSettings, deps: SessionDeps) -> Self {
        let events = EventEmitter::default();
        let transcript = Transcript::new(events.clone());
        let forwards = Arc::new(PortForwardRegistry::new(settings.clone()));
        let compression = AtomicBool::new(profile.compression);
        Self {
            profile,
            settings,
            deps,
            state: Arc::new(StateCell::default()),
            events,
            transcript,
            forwards,
            compression,
            geometry: RwLock::new(TerminalGeometry::default()),
            writer: RwLock::new(None),
            control: RwLock::new(None),
            reader: Mutex::new(None),
            connection: Mutex::new(None),
        }
    }

    pub fn profile(&self) -> &HostProfile {
        &self.profile
    }

    pub fn state(&self) -> SessionState {
        self.state.get()
    }

    pub fn is_connected(&self) -> bool {
        self.state.get().is_ready()
    }

    /// Whether an interactive shell is attached
    pub fn is_session_open(&self) -> bool {
        self.control.read().is_some()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn transcript(&self) -> Vec<TranscriptLine> {
        self.transcript.lines()
    }

    /// Connect, verify the host, authenticate and start the session.
    ///
    /// Every fatal failure leaves the state at `Failed` with the engine closed.
    pub async fn connect(&self) -> Result<(), SshError> {
        {
            let mut connection = self.connection.lock().await;
            if self.state.get().is_ready() {
                return Err(SshError::ConnectionFailed("Session already connected".into()));
            }
            if let Some(stale) = connection.take() {
                let _ = stale.watcher.await;
            }
        }
        self.writer.write().take();
        self.control.write().take();
        self.reader.lock().await.take();

        let profile = &self.profile;
        let engine = self.deps.engine.clone();
        set_state(&self.state, &self.events, SessionState::Handshaking);

        if let Err(e) = engine.set_compression(self.compression.load(Ordering::SeqCst)) {
            warn!("Could not enable compression: {}", e);
        }

        let gate = Arc::new(HostKeyGate::new(
            self.deps.trust.clone(),
            self.deps.prompts.clone(),
            Arc::new(self.transcript.clone()),
            self.state.clone(),
        ));
        let info = match engine
            .connect(&profile.hostname, profile.port, gate.clone())
            .await
        {
            Ok(info) => info,
            Err(e) => {
                let err = if gate.decision() == Some(HostKeyDecision::Rejected) {
                    SshError::HostKeyRejected(profile.hostname.clone())
                } else {
                    e
                };
                return Err(self.fail(err).await);
            }
        };
        if let Some(server_id) = &info.server_id {
            self.transcript.push(format!("Connected to {}", server_id));
        }
        if info.compression {
            self.transcript.push("Using compression");
        }

        set_state(&self.state, &self.events, SessionState::Authenticating);
        let auth_result = Authenticator::new(
            engine.as_ref(),
            self.deps.prompts.as_ref(),
            self.deps.keys.as_ref(),
            &self.deps.identities,
            &self.transcript,
            &self.settings,
        )
        .run(profile)
        .await;
        if let Err(e) = auth_result {
            return Err(self.fail(e).await);
        }

        let (disconnect, notices) = DisconnectSignal::new();
        self.attach_forwards().await;

        let control = if profile.want_session {
            match self.open_shell(&disconnect).await {
                Ok(control) => Some(control),
                Err(e) => return Err(self.fail(e).await),
            }
        } else {
            self.transcript
                .push("Session will not be started due to host preference.");
            None
        };

        let watcher = self.spawn_watcher(disconnect.clone(), notices, control);
        *self.connection.lock().await = Some(Connection {
            disconnect,
            watcher,
        });

        set_state(&self.state, &self.events, SessionState::SessionReady);
        self.events.emit(SessionEvent::Connected);
        info!("Session ready for {}", profile);
        Ok(())
    }

    async fn fail(&self, err: SshError) -> SshError {
        warn!("Connection to {} failed: {}", self.profile, err);
        self.transcript.push(err.to_string());
        self.forwards.disable_all(self.deps.engine.as_ref()).await;
        self.deps.engine.close().await;
        set_state(
            &self.state,
            &self.events,
            SessionState::Failed(err.to_string()),
        );
        err
    }

    async fn attach_forwards(&self) {
        for spec in self.forwards.specs().await {
            match self.forwards.enable(&self.deps.engine, &spec.id).await {
                Ok(true) => self
                    .transcript
                    .push(format!("Enabled port forward: {}", spec.description())),
                Ok(false) => debug!("Port forward {} not enabled", spec.id),
                Err(e) => {
                    warn!("Error setting up port forward during connect: {}", e);
                    self.transcript.push(format!(
                        "Could not enable port forward: {} ({})",
                        spec.description(),
                        e
                    ));
                }
            }
        }
    }

    async fn open_shell(
        &self,
        disconnect: &DisconnectSignal,
    ) -> Result<Arc<dyn ShellControl>, SshError> {
        let mut channel = self.deps.engine.open_session().await?;

        if self.profile.agent_forwarding.is_enabled() {
            let bridge = Arc::new(AgentBridge::new(
                self.deps.identities.clone(),
                self.deps.prompts.clone(),
                self.profile.agent_forwarding == AgentForwarding::Confirm,
            ));
            let handler: AgentChannelHandler = Arc::new(move |stream| {
                let bridge = bridge.clone();
                tokio::spawn(async move {
                    bridge.run(stream).await;
                });
            });
            channel.request_agent_forwarding(handler).await?;
        }

        let geometry = *self.geometry.read();
        channel.request_pty(&self.profile.term, geometry).await?;
        channel.start_shell().await?;

        let ShellIo {
            input,
            events,
            control,
        } = channel.into_io();
        *self.writer.write() = Some(Arc::new(WriteDispatcher::spawn(input, disconnect.clone())));
        *self.control.write() = Some(control.clone());
        *self.reader.lock().await = Some(ShellReader {
            events,
            pending: BytesMut::new(),
            disconnect: disconnect.clone(),
        });
        Ok(control)
    }

    fn spawn_watcher(
        &self,
        disconnect: DisconnectSignal,
        mut notices: mpsc::UnboundedReceiver<DisconnectNotice>,
        control: Option<Arc<dyn ShellControl>>,
    ) -> JoinHandle<()> {
        let mut lost_rx = self.deps.engine.subscribe_connection_lost();
        let lost_signal = disconnect.clone();
        let lost_task = tokio::spawn(async move {
            if let Ok(reason) = lost_rx.recv().await {
                lost_signal.fire(false, reason);
            }
        });

        let teardown = Teardown {
            engine: self.deps.engine.clone(),
            forwards: self.forwards.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
            transcript: self.transcript.clone(),
            control,
            lost_task,
        };

        tokio::spawn(async move {
            let notice = notices.recv().await.unwrap_or(DisconnectNotice {
                clean: true,
                reason: "Session closed".into(),
            });
            drop(disconnect);
            teardown.run(notice).await;
        })
    }

    /// Close the session; queued writes are sent before the channel closes
    pub async fn close(&self) {
        let connection = self.connection.lock().await.take();
        let writer = self.writer.write().take();
        self.control.write().take();

        if let Some(writer) = writer {
            let _ = writer.close();
            if tokio::time::timeout(WRITE_DRAIN_TIMEOUT, writer.join())
                .await
                .is_err()
            {
                warn!("Queued shell writes did not drain, closing anyway");
            }
        }

        match connection {
            Some(connection) => {
                connection.disconnect.fire(true, "Session closed");
                if let Err(e) = connection.watcher.await {
                    warn!("Disconnect watcher ended abnormally: {}", e);
                }
            }
            // Nothing established yet; abort whatever handshake is in flight
            None => self.deps.engine.close().await,
        }
    }

    /// Next chunk of shell output with its stream.
    ///
    /// EOF from the server disconnects the session and returns
    /// [`SshError::StreamClosed`].
    pub async fn read_output(&self) -> Result<ShellOutput, SshError> {
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(SshError::NotConnected)?;
        reader.next_output().await
    }

    /// Copy shell output into `buf`; stdout and stderr are both delivered
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, SshError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(SshError::NotConnected)?;
        if reader.pending.is_empty() {
            match reader.next_output().await? {
                ShellOutput::Stdout(data) | ShellOutput::Stderr(data) => {
                    reader.pending.extend_from_slice(&data)
                }
            }
        }
        let n = buf.len().min(reader.pending.len());
        buf[..n].copy_from_slice(&reader.pending[..n]);
        reader.pending.advance(n);
        Ok(n)
    }

    fn writer(&self) -> Result<Arc<WriteDispatcher>, SshError> {
        self.writer.read().clone().ok_or(SshError::NotConnected)
    }

    /// Queue bytes for the shell; never waits on the network
    pub fn write(&self, data: &[u8]) -> Result<(), SshError> {
        self.writer()?.write(data)
    }

    pub fn write_byte(&self, byte: u8) -> Result<(), SshError> {
        self.writer()?.write_byte(byte)
    }

    pub fn flush(&self) -> Result<(), SshError> {
        self.writer()?.flush()
    }

    /// Remember the terminal size and, if a shell is open, resize it.
    /// A refused resize is logged and otherwise ignored.
    pub async fn set_dimensions(&self, cols: u32, rows: u32, width_px: u32, height_px: u32) {
        let geometry = TerminalGeometry {
            cols,
            rows,
            width_px,
            height_px,
        };
        *self.geometry.write() = geometry;

        let control = self.control.read().clone();
        if let Some(control) = control {
            if let Err(e) = control.resize(geometry).await {
                warn!("Couldn't send resize PTY packet: {}", e);
            }
        }
    }

    pub fn dimensions(&self) -> TerminalGeometry {
        *self.geometry.read()
    }

    pub async fn add_port_forward(&self, spec: PortForwardSpec) -> bool {
        self.forwards.add(spec).await
    }

    /// `Ok(false)` if the forward is unknown or the session is not authenticated
    pub async fn enable_port_forward(&self, id: &str) -> Result<bool, SshError> {
        self.forwards.enable(&self.deps.engine, id).await
    }

    pub async fn disable_port_forward(&self, id: &str) -> Result<bool, SshError> {
        self.forwards
            .disable(self.deps.engine.as_ref(), id)
            .await
    }

    /// Remove a forward, disabling it first if it is live
    pub async fn remove_port_forward(&self, id: &str) -> Result<bool, SshError> {
        self.forwards.remove(self.deps.engine.as_ref(), id).await
    }

    pub async fn get_port_forwards(&self) -> Vec<PortForwardView> {
        self.forwards.list().await
    }

    pub fn options(&self) -> HashMap<String, String> {
        let mut options = HashMap::new();
        options.insert(
            OPTION_COMPRESSION.to_string(),
            self.compression.load(Ordering::SeqCst).to_string(),
        );
        options
    }

    /// Apply options; they take effect on the next `connect()`
    pub fn set_options(&self, options: &HashMap<String, String>) {
        for (key, value) in options {
            match key.as_str() {
                OPTION_COMPRESSION => {
                    let enabled = matches!(value.as_str(), "true" | "1" | "yes");
                    self.compression.store(enabled, Ordering::SeqCst);
                }
                other => debug!("Ignoring unknown transport option {}", other),
            }
        }
    }
}
