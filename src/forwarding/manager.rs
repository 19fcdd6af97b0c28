//! Port Forwarding Registry
//!
//! Tracks the forwards configured for one host and the live handle attached
//! to each. Specs may be authored while disconnected; handles exist only
//! while the session is authenticated.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::dynamic::{start_dynamic_forward, DynamicForward};
use super::local::{start_local_forward, ListenerHandle, LocalForward};
use super::remote::{start_remote_forward, RemoteForward, RemoteForwardHandle};
use super::stream::ForwardStats;
use crate::config::TransportSettings;
use crate::ssh::{SshError, WireEngine};

/// Bind address requested for remote listeners; empty lets the server decide
const REMOTE_BIND_ADDRESS: &str = "";

/// What a forward does, with the fields meaningful for that kind
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ForwardKind {
    /// Local port forwarding (-L)
    Local {
        source_port: u16,
        dest_host: String,
        dest_port: u16,
    },
    /// Remote port forwarding (-R)
    Remote {
        source_port: u16,
        dest_host: String,
        dest_port: u16,
    },
    /// Dynamic SOCKS proxy (-D)
    Dynamic { source_port: u16 },
}

impl ForwardKind {
    pub fn source_port(&self) -> u16 {
        match self {
            ForwardKind::Local { source_port, .. }
            | ForwardKind::Remote { source_port, .. }
            | ForwardKind::Dynamic { source_port } => *source_port,
        }
    }
}

/// A configured port forward
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortForwardSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    pub kind: ForwardKind,
}

impl PortForwardSpec {
    pub fn new(kind: ForwardKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            nickname: None,
            kind,
        }
    }

    pub fn local(source_port: u16, dest_host: impl Into<String>, dest_port: u16) -> Self {
        Self::new(ForwardKind::Local {
            source_port,
            dest_host: dest_host.into(),
            dest_port,
        })
    }

    pub fn remote(source_port: u16, dest_host: impl Into<String>, dest_port: u16) -> Self {
        Self::new(ForwardKind::Remote {
            source_port,
            dest_host: dest_host.into(),
            dest_port,
        })
    }

    pub fn dynamic(source_port: u16) -> Self {
        Self::new(ForwardKind::Dynamic { source_port })
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Human-readable summary used in the transcript
    pub fn description(&self) -> String {
        match &self.kind {
            ForwardKind::Local {
                source_port,
                dest_host,
                dest_port,
            } => format!("Local port {} to {}:{}", source_port, dest_host, dest_port),
            ForwardKind::Remote {
                source_port,
                dest_host,
                dest_port,
            } => format!("Remote port {} to {}:{}", source_port, dest_host, dest_port),
            ForwardKind::Dynamic { source_port } => {
                format!("Dynamic port {} (SOCKS)", source_port)
            }
        }
    }
}

/// Snapshot of one forward for display
#[derive(Debug, Clone, Serialize)]
pub struct PortForwardView {
    pub spec: PortForwardSpec,
    pub description: String,
    pub enabled: bool,
    /// Local socket actually bound, for Local and Dynamic forwards
    pub bound_addr: Option<SocketAddr>,
    /// Port the server listens on, for Remote forwards
    pub remote_bound_port: Option<u16>,
    pub stats: ForwardStats,
}

/// Runtime attachment of a spec; never persisted
enum ForwardHandle {
    Listener(ListenerHandle),
    Remote(RemoteForwardHandle),
}

impl ForwardHandle {
    fn is_alive(&self) -> bool {
        match self {
            ForwardHandle::Listener(handle) => handle.is_running(),
            ForwardHandle::Remote(_) => true,
        }
    }

    fn bound_addr(&self) -> Option<SocketAddr> {
        match self {
            ForwardHandle::Listener(handle) => Some(handle.bound_addr),
            ForwardHandle::Remote(_) => None,
        }
    }

    fn remote_bound_port(&self) -> Option<u16> {
        match self {
            ForwardHandle::Listener(_) => None,
            ForwardHandle::Remote(handle) => Some(handle.bound_port),
        }
    }

    fn stats(&self) -> ForwardStats {
        match self {
            ForwardHandle::Listener(handle) => handle.stats(),
            ForwardHandle::Remote(handle) => handle.stats(),
        }
    }

    async fn close(self, engine: &dyn WireEngine) -> Result<(), SshError> {
        match self {
            ForwardHandle::Listener(handle) => {
                handle.stop().await;
                Ok(())
            }
            ForwardHandle::Remote(handle) => handle.stop(engine).await,
        }
    }
}

#[derive(Default)]
struct RegistryInner {
    /// Registration order is preserved for listing and re-attach
    specs: Vec<PortForwardSpec>,
    handles: HashMap<String, ForwardHandle>,
}

/// Configured forwards for one host plus their live handles
pub struct PortForwardRegistry {
    settings: TransportSettings,
    inner: Mutex<RegistryInner>,
}

impl PortForwardRegistry {
    pub fn new(settings: TransportSettings) -> Self {
        Self {
            settings,
            inner: Mutex::new(RegistryInner::default()),
        }
    }

    /// Register a spec. Returns false if the id is already present.
    pub async fn add(&self, spec: PortForwardSpec) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.specs.iter().any(|s| s.id == spec.id) {
            return false;
        }
        info!("Added port forward {}: {}", spec.id, spec.description());
        inner.specs.push(spec);
        true
    }

    /// Attach a live handle to the spec.
    ///
    /// `Ok(false)` when the spec is unknown or the session is not
    /// authenticated; a bind or registration failure is an error for this
    /// forward only.
    pub async fn enable(&self, engine: &Arc<dyn WireEngine>, id: &str) -> Result<bool, SshError> {
        let mut inner = self.inner.lock().await;
        let Some(spec) = inner.specs.iter().find(|s| s.id == id).cloned() else {
            warn!("Attempt to enable port forward not in list: {}", id);
            return Ok(false);
        };
        if !engine.is_authentication_complete() {
            return Ok(false);
        }

        if let Some(existing) = inner.handles.get(id) {
            if existing.is_alive() {
                return Ok(true);
            }
            if let Some(stale) = inner.handles.remove(id) {
                let _ = stale.close(engine.as_ref()).await;
            }
        }

        let handle = self.start(engine, &spec.kind).await?;
        info!("Enabled port forward: {}", spec.description());
        inner.handles.insert(spec.id, handle);
        Ok(true)
    }

    async fn start(
        &self,
        engine: &Arc<dyn WireEngine>,
        kind: &ForwardKind,
    ) -> Result<ForwardHandle, SshError> {
        let buffer_size = self.settings.forward_buffer_size;
        let handle = match kind {
            ForwardKind::Local {
                source_port,
                dest_host,
                dest_port,
            } => ForwardHandle::Listener(
                start_local_forward(
                    engine.clone(),
                    LocalForward {
                        local_addr: self.bind_addr(*source_port),
                        dest_host: dest_host.clone(),
                        dest_port: *dest_port,
                        buffer_size,
                    },
                )
                .await?,
            ),
            ForwardKind::Remote {
                source_port,
                dest_host,
                dest_port,
            } => ForwardHandle::Remote(
                start_remote_forward(
                    engine.as_ref(),
                    RemoteForward {
                        remote_addr: REMOTE_BIND_ADDRESS.to_string(),
                        remote_port: *source_port,
                        local_host: dest_host.clone(),
                        local_port: *dest_port,
                        buffer_size,
                        connect_timeout: self.settings.connect_timeout(),
                    },
                )
                .await?,
            ),
            ForwardKind::Dynamic { source_port } => ForwardHandle::Listener(
                start_dynamic_forward(
                    engine.clone(),
                    DynamicForward {
                        local_addr: self.bind_addr(*source_port),
                        buffer_size,
                    },
                )
                .await?,
            ),
        };
        Ok(handle)
    }

    fn bind_addr(&self, port: u16) -> String {
        let host = &self.settings.forward_bind_address;
        if host.contains(':') {
            format!("[{}]:{}", host, port)
        } else {
            format!("{}:{}", host, port)
        }
    }

    /// Detach the live handle. `Ok(false)` when there was none.
    pub async fn disable(&self, engine: &dyn WireEngine, id: &str) -> Result<bool, SshError> {
        let handle = self.inner.lock().await.handles.remove(id);
        match handle {
            Some(handle) => {
                handle.close(engine).await?;
                info!("Disabled port forward {}", id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete a spec, disabling it first if it is live
    pub async fn remove(&self, engine: &dyn WireEngine, id: &str) -> Result<bool, SshError> {
        if let Err(e) = self.disable(engine, id).await {
            warn!("Failed to disable port forward {} before removal: {}", id, e);
        }
        let mut inner = self.inner.lock().await;
        let before = inner.specs.len();
        inner.specs.retain(|s| s.id != id);
        Ok(inner.specs.len() != before)
    }

    /// Detach every live handle, keeping the specs
    pub async fn disable_all(&self, engine: &dyn WireEngine) {
        let handles: Vec<(String, ForwardHandle)> =
            self.inner.lock().await.handles.drain().collect();
        for (id, handle) in handles {
            if let Err(e) = handle.close(engine).await {
                warn!("Failed to close port forward {}: {}", id, e);
            }
        }
    }

    pub async fn specs(&self) -> Vec<PortForwardSpec> {
        self.inner.lock().await.specs.clone()
    }

    pub async fn list(&self) -> Vec<PortForwardView> {
        let inner = self.inner.lock().await;
        inner
            .specs
            .iter()
            .map(|spec| {
                let handle = inner.handles.get(&spec.id);
                PortForwardView {
                    spec: spec.clone(),
                    description: spec.description(),
                    enabled: handle.is_some(),
                    bound_addr: handle.and_then(|h| h.bound_addr()),
                    remote_bound_port: handle.and_then(|h| h.remote_bound_port()),
                    stats: handle.map(|h| h.stats()).unwrap_or_default(),
                }
            })
            .collect()
    }

    pub async fn is_enabled(&self, id: &str) -> bool {
        self.inner.lock().await.handles.contains_key(id)
    }
}
