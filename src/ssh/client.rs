//! SSH client implementation using russh
//!
//! [`RusshEngine`] adapts russh to the [`WireEngine`] seam. The connected
//! `Handle` lives in a handle owner task; every call goes through its
//! [`HandleController`].

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use russh::client::{self, AuthResult, KeyboardInteractiveAuthResponse};
use russh::keys::{PrivateKey, PublicKey, PublicKeyBase64};
use russh::{Channel, MethodKind, Preferred};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::channel::{AgentSlot, RusshSessionChannel};
use super::engine::{
    AuthMethodKind, BoxedStream, ConnectionInfo, ForwardedChannelHandler, InteractivePrompt,
    InteractiveResponder, ServerKey, ServerKeyVerifier, SessionChannel, WireEngine,
};
use super::error::SshError;
use super::handle_owner::{spawn_handle_owner_task, HandleController};
use crate::config::TransportSettings;

/// Remote forwards by bound port
type RemoteListeners = Arc<RwLock<HashMap<u32, ForwardedChannelHandler>>>;

/// Client handler for russh callbacks
///
/// This handler processes server-initiated events, including:
/// - Host key verification through the session's verifier
/// - Remote port forwarding (forwarded-tcpip channels)
/// - Agent channels after agent forwarding was granted
pub struct ClientHandler {
    host: String,
    port: u16,
    verifier: Arc<dyn ServerKeyVerifier>,
    remote_listeners: RemoteListeners,
    agent_slot: AgentSlot,
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let key = ServerKey::new(
            server_public_key.algorithm().as_str(),
            server_public_key.public_key_bytes(),
        );
        Ok(self
            .verifier
            .verify_server_key(&self.host, self.port, &key)
            .await)
    }

    /// Called when someone connects to a remote forwarded port on the server
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let listener = {
            let listeners = self.remote_listeners.read();
            listeners
                .get(&connected_port)
                .or_else(|| listeners.get(&0))
                .cloned()
        };
        match listener {
            Some(on_channel) => on_channel(
                Box::new(channel.into_stream()),
                originator_address.to_string(),
                originator_port as u16,
            ),
            None => {
                warn!(
                    "No remote forward registered for {}:{}, closing channel",
                    connected_address, connected_port
                );
                let _ = channel.close().await;
            }
        }
        Ok(())
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: Channel<client::Msg>,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        let handler = self.agent_slot.read().clone();
        match handler {
            Some(handler) => handler(Box::new(channel.into_stream())),
            None => {
                warn!("Server opened an agent channel without agent forwarding, closing it");
                let _ = channel.close().await;
            }
        }
        Ok(())
    }
}

fn method_kind(kind: &MethodKind) -> Option<AuthMethodKind> {
    match kind {
        MethodKind::None => Some(AuthMethodKind::None),
        MethodKind::PublicKey => Some(AuthMethodKind::PublicKey),
        MethodKind::KeyboardInteractive => Some(AuthMethodKind::KeyboardInteractive),
        MethodKind::Password => Some(AuthMethodKind::Password),
        _ => None,
    }
}

/// [`WireEngine`] backed by russh
pub struct RusshEngine {
    settings: TransportSettings,
    compression: AtomicBool,
    controller: RwLock<Option<HandleController>>,
    label: RwLock<String>,
    remote_listeners: RemoteListeners,
    agent_slot: AgentSlot,
    /// Methods the server last said may continue; `None` until the first failure
    methods: Mutex<Option<Vec<AuthMethodKind>>>,
    authenticated: AtomicBool,
    lost_tx: broadcast::Sender<String>,
}

impl RusshEngine {
    pub fn new(settings: TransportSettings) -> Self {
        let (lost_tx, _) = broadcast::channel(4);
        Self {
            settings,
            compression: AtomicBool::new(false),
            controller: RwLock::new(None),
            label: RwLock::new(String::new()),
            remote_listeners: Arc::new(RwLock::new(HashMap::new())),
            agent_slot: Arc::new(RwLock::new(None)),
            methods: Mutex::new(None),
            authenticated: AtomicBool::new(false),
            lost_tx,
        }
    }

    fn controller(&self) -> Result<HandleController, SshError> {
        self.controller
            .read()
            .clone()
            .ok_or(SshError::NotConnected)
    }

    fn client_config(&self) -> client::Config {
        let mut preferred = Preferred::default();
        if self.compression.load(Ordering::Relaxed) {
            preferred.compression = Cow::Borrowed(&[
                russh::compression::ZLIB,
                russh::compression::ZLIB_LEGACY,
                russh::compression::NONE,
            ]);
        }

        client::Config {
            inactivity_timeout: None,
            keepalive_interval: self.settings.keepalive_interval(),
            keepalive_max: 3,
            preferred,
            ..Default::default()
        }
    }

    /// Record the outcome of one authentication request
    fn auth_outcome(&self, result: AuthResult) -> bool {
        match result {
            AuthResult::Success => {
                self.authenticated.store(true, Ordering::SeqCst);
                true
            }
            AuthResult::Failure {
                remaining_methods, ..
            } => {
                let methods: Vec<AuthMethodKind> =
                    remaining_methods.iter().filter_map(method_kind).collect();
                debug!("Server allows further methods: {:?}", methods);
                *self.methods.lock() = Some(methods);
                false
            }
        }
    }
}

#[async_trait]
impl WireEngine for RusshEngine {
    fn set_compression(&self, enabled: bool) -> Result<(), SshError> {
        if self.controller.read().is_some() {
            return Err(SshError::Config(
                "compression must be chosen before connecting".into(),
            ));
        }
        self.compression.store(enabled, Ordering::Relaxed);
        Ok(())
    }

    async fn connect(
        &self,
        host: &str,
        port: u16,
        verifier: Arc<dyn ServerKeyVerifier>,
    ) -> Result<ConnectionInfo, SshError> {
        info!("Connecting to SSH server at {}:{}", host, port);
        self.authenticated.store(false, Ordering::SeqCst);
        *self.methods.lock() = None;

        let handler = ClientHandler {
            host: host.to_string(),
            port,
            verifier,
            remote_listeners: self.remote_listeners.clone(),
            agent_slot: self.agent_slot.clone(),
        };

        let handle = tokio::time::timeout(
            self.settings.connect_timeout(),
            client::connect(Arc::new(self.client_config()), (host, port), handler),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Connection to {}:{} timed out", host, port)))?
        .map_err(|e| SshError::Handshake(e.to_string()))?;

        debug!("SSH handshake completed");

        let label = format!("{}:{}", host, port);
        *self.label.write() = label.clone();
        *self.controller.write() = Some(spawn_handle_owner_task(
            handle,
            self.lost_tx.clone(),
            label,
        ));

        Ok(ConnectionInfo {
            server_id: None,
            compression: self.compression.load(Ordering::Relaxed),
        })
    }

    async fn authenticate_none(&self, user: &str) -> Result<bool, SshError> {
        let result = self.controller()?.authenticate_none(user).await?;
        Ok(self.auth_outcome(result))
    }

    async fn authenticate_password(&self, user: &str, password: &str) -> Result<bool, SshError> {
        let result = self
            .controller()?
            .authenticate_password(user, password)
            .await?;
        Ok(self.auth_outcome(result))
    }

    async fn authenticate_publickey(
        &self,
        user: &str,
        key: Arc<PrivateKey>,
    ) -> Result<bool, SshError> {
        let result = self.controller()?.authenticate_publickey(user, key).await?;
        Ok(self.auth_outcome(result))
    }

    async fn authenticate_keyboard_interactive(
        &self,
        user: &str,
        responder: &mut dyn InteractiveResponder,
    ) -> Result<bool, SshError> {
        let controller = self.controller()?;
        let mut response = controller.kbi_start(user).await?;

        loop {
            match response {
                KeyboardInteractiveAuthResponse::Success => {
                    self.authenticated.store(true, Ordering::SeqCst);
                    return Ok(true);
                }
                KeyboardInteractiveAuthResponse::Failure {
                    remaining_methods, ..
                } => {
                    *self.methods.lock() =
                        Some(remaining_methods.iter().filter_map(method_kind).collect());
                    return Ok(false);
                }
                KeyboardInteractiveAuthResponse::InfoRequest {
                    name,
                    instructions,
                    prompts,
                } => {
                    debug!("Keyboard-interactive round with {} prompts", prompts.len());
                    let prompts: Vec<InteractivePrompt> = prompts
                        .into_iter()
                        .map(|p| InteractivePrompt {
                            prompt: p.prompt,
                            echo: p.echo,
                        })
                        .collect();

                    let Some(responses) = responder.respond(&name, &instructions, &prompts).await
                    else {
                        debug!("Keyboard-interactive prompts cancelled");
                        return Ok(false);
                    };
                    response = controller.kbi_respond(responses).await?;
                }
            }
        }
    }

    async fn is_auth_method_available(
        &self,
        _user: &str,
        method: AuthMethodKind,
    ) -> Result<bool, SshError> {
        Ok(self
            .methods
            .lock()
            .as_ref()
            .map_or(true, |methods| methods.contains(&method)))
    }

    fn is_authentication_complete(&self) -> bool {
        self.authenticated.load(Ordering::SeqCst)
    }

    async fn open_session(&self) -> Result<Box<dyn SessionChannel>, SshError> {
        let channel = self.controller()?.open_session_channel().await?;
        Ok(Box::new(RusshSessionChannel::new(
            channel,
            self.agent_slot.clone(),
            self.label.read().clone(),
        )))
    }

    async fn open_direct_tcpip(
        &self,
        dest_host: &str,
        dest_port: u16,
        origin_host: &str,
        origin_port: u16,
    ) -> Result<BoxedStream, SshError> {
        let channel = tokio::time::timeout(
            self.settings.channel_open_timeout(),
            self.controller()?.open_direct_tcpip(
                dest_host,
                dest_port as u32,
                origin_host,
                origin_port as u32,
            ),
        )
        .await
        .map_err(|_| SshError::Timeout(format!("Opening channel to {}:{}", dest_host, dest_port)))??;

        Ok(Box::new(channel.into_stream()))
    }

    async fn request_remote_port_forwarding(
        &self,
        bind_address: &str,
        bind_port: u16,
        on_channel: ForwardedChannelHandler,
    ) -> Result<u16, SshError> {
        let controller = self.controller()?;
        // Registered before the request so a channel racing the reply still
        // finds it; port 0 entries are looked up as a fallback.
        self.remote_listeners
            .write()
            .insert(bind_port as u32, on_channel);

        let assigned = match controller.tcpip_forward(bind_address, bind_port as u32).await {
            Ok(assigned) => assigned,
            Err(e) => {
                self.remote_listeners.write().remove(&(bind_port as u32));
                return Err(SshError::Forward(format!(
                    "Server refused to listen on {}:{}: {}",
                    bind_address, bind_port, e
                )));
            }
        };

        let bound = match u16::try_from(assigned) {
            Ok(0) | Err(_) => bind_port,
            Ok(port) => port,
        };
        if bound != bind_port {
            let mut listeners = self.remote_listeners.write();
            if let Some(handler) = listeners.remove(&(bind_port as u32)) {
                listeners.insert(bound as u32, handler);
            }
            info!(
                "Server assigned port {} for remote forward on {}",
                bound, bind_address
            );
        }
        Ok(bound)
    }

    async fn cancel_remote_port_forwarding(
        &self,
        bind_address: &str,
        bind_port: u16,
    ) -> Result<(), SshError> {
        self.remote_listeners.write().remove(&(bind_port as u32));
        self.controller()?
            .cancel_tcpip_forward(bind_address, bind_port as u32)
            .await
    }

    fn subscribe_connection_lost(&self) -> broadcast::Receiver<String> {
        self.lost_tx.subscribe()
    }

    async fn close(&self) {
        let controller = self.controller.write().take();
        if let Some(controller) = controller {
            controller.disconnect().await;
        }
        self.remote_listeners.write().clear();
        *self.agent_slot.write() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_mapping() {
        assert_eq!(
            method_kind(&MethodKind::KeyboardInteractive),
            Some(AuthMethodKind::KeyboardInteractive)
        );
        assert_eq!(method_kind(&MethodKind::HostBased), None);
    }

    #[tokio::test]
    async fn test_not_connected() {
        let engine = RusshEngine::new(TransportSettings::default());
        assert!(engine
            .is_auth_method_available("u", AuthMethodKind::Password)
            .await
            .unwrap());
        assert!(!engine.is_authentication_complete());
        assert!(matches!(
            engine.authenticate_none("u").await,
            Err(SshError::NotConnected)
        ));
        assert!(matches!(
            engine.open_direct_tcpip("example.org", 80, "127.0.0.1", 1).await,
            Err(SshError::NotConnected)
        ));
        engine.set_compression(true).unwrap();
        assert!(engine.client_config().preferred.compression.len() == 3);
    }
}
