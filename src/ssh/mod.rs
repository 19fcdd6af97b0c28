//! SSH module - connection primitives and everything around them
//!
//! # Features
//! - [`WireEngine`] seam with the russh-backed [`RusshEngine`]
//! - Multi-method authentication loop with narration
//! - Host key trust in OpenSSH `known_hosts` format
//! - Credential prompts and pinned key storage

mod auth;
mod channel;
mod client;
mod config;
pub mod engine;
mod error;
mod handle_owner;
pub mod keys;
pub mod known_hosts;
pub mod prompt;

pub use auth::{Authenticator, Narrator};
pub use client::{ClientHandler, RusshEngine};
pub use config::{AgentForwarding, HostProfile, KeyPolicy};
pub use engine::{
    AuthMethodKind, BoxedStream, ConnectionInfo, ServerKey, ServerKeyVerifier, ShellEvent,
    TerminalGeometry, WireEngine,
};
pub use error::{OpenFailure, SshError};
pub use handle_owner::{spawn_handle_owner_task, HandleCommand, HandleController};
pub use keys::{FileKeyStore, KeyError, KeyStore, StoredKey};
pub use known_hosts::{KnownHostsStore, TrustStore, TrustVerdict};
pub use prompt::{CredentialSource, PromptBroker, PromptKind, PromptRequest};
