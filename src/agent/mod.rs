//! SSH agent forwarding
//!
//! When a session forwards the agent, the server opens an
//! `auth-agent@openssh.com` channel for every agent request made on the
//! remote side. Each channel gets its own [`AgentBridge`] task serving the
//! process-wide [`IdentityRegistry`].
//!
//! # Module layout
//!
//! - `protocol`: record framing and the closed set of requests/responses
//! - `keys`: identity decoding and signing
//! - `registry`: shared identities, lifetimes and the lock passphrase
//! - `bridge`: the per-channel request loop

pub mod bridge;
pub mod keys;
pub mod protocol;
pub mod registry;

pub use bridge::AgentBridge;
pub use protocol::{AgentError, AgentRequest, AgentResponse};
pub use registry::{AgentIdentity, IdentityRegistry};
