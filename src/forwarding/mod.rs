//! Port Forwarding Module
//!
//! Provides SSH port forwarding functionality:
//! - Local port forwarding (-L): Forward local port to remote host
//! - Remote port forwarding (-R): Forward remote port to local host
//! - Dynamic port forwarding (-D): SOCKS4/5 proxy

pub mod dynamic;
pub mod local;
pub mod manager;
pub mod remote;
pub mod socks;
pub mod stream;

pub use local::ListenerHandle;
pub use manager::{ForwardKind, PortForwardRegistry, PortForwardSpec, PortForwardView};
pub use stream::{ForwardStats, StreamForwarder};
