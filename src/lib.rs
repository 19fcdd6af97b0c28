//! OxideTerm session core
//!
//! SSH session orchestration: connection handshake with host key trust,
//! multi-method authentication, interactive shell I/O, port forwarding
//! (local, remote and SOCKS) and SSH agent forwarding.
//!
//! The wire protocol sits behind [`ssh::WireEngine`]; [`ssh::RusshEngine`]
//! is the russh-backed implementation and [`session::SshTransport`] drives
//! one host connection from handshake to teardown.

pub mod agent;
pub mod config;
pub mod forwarding;
pub mod session;
pub mod ssh;

#[cfg(test)]
pub(crate) mod testing;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install the process-wide tracing subscriber.
///
/// `RUST_LOG` overrides the default `info` filter. Logs go to stderr so
/// they never interleave with relayed shell output.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init();
}
