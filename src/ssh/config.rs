//! SSH host profile
//!
//! A `HostProfile` is the immutable snapshot handed to the session
//! orchestrator on connect. Nothing in the core mutates it.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use super::error::SshError;

/// Which keys the public-key method may try
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KeyPolicy {
    /// Try every identity currently held in the identity registry
    Any,
    /// Never use public-key authentication for this host
    None,
    /// Use exactly one stored key
    Specific { id: i64 },
}

/// Agent forwarding mode for the session channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentForwarding {
    Off,
    On,
    /// Forward, but ask before every signature
    Confirm,
}

impl AgentForwarding {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, AgentForwarding::Off)
    }
}

/// SSH connection profile
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostProfile {
    /// Always "ssh" for this transport
    #[serde(default = "default_protocol")]
    pub protocol: String,

    /// Display name
    #[serde(default)]
    pub nickname: String,

    /// Remote host address
    pub hostname: String,

    /// SSH port (default: 22)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username for authentication
    pub username: String,

    #[serde(default = "default_key_policy")]
    pub key_policy: KeyPolicy,

    #[serde(default = "default_agent_forwarding")]
    pub agent_forwarding: AgentForwarding,

    #[serde(default)]
    pub compression: bool,

    /// Open an interactive shell after authentication.
    /// When false the connection only carries forwards.
    #[serde(default = "default_want_session")]
    pub want_session: bool,

    /// Terminal type sent with the PTY request
    #[serde(default = "default_term")]
    pub term: String,
}

fn default_protocol() -> String {
    "ssh".to_string()
}

fn default_port() -> u16 {
    22
}

fn default_key_policy() -> KeyPolicy {
    KeyPolicy::Any
}

fn default_agent_forwarding() -> AgentForwarding {
    AgentForwarding::Off
}

fn default_want_session() -> bool {
    true
}

fn default_term() -> String {
    "xterm-256color".to_string()
}

impl Default for HostProfile {
    fn default() -> Self {
        Self {
            protocol: default_protocol(),
            nickname: String::new(),
            hostname: String::new(),
            port: default_port(),
            username: String::new(),
            key_policy: default_key_policy(),
            agent_forwarding: default_agent_forwarding(),
            compression: false,
            want_session: default_want_session(),
            term: default_term(),
        }
    }
}

fn host_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:ssh://)?([^@/\s]+)@(\[[0-9A-Fa-f:.]+\]|[^:/#\[\]\s]+)(?::(\d{1,5}))?/?(?:#(.*))?$")
            .expect("host pattern is valid")
    })
}

impl HostProfile {
    pub fn new(username: impl Into<String>, hostname: impl Into<String>, port: u16) -> Self {
        let username = username.into();
        let hostname = hostname.into();
        Self {
            nickname: format!("{}@{}", username, hostname),
            username,
            hostname,
            port,
            ..Default::default()
        }
    }

    /// Parse `ssh://user@host:port/#nickname` or the `user@host[:port]` shorthand.
    ///
    /// IPv6 literals must be bracketed: `user@[::1]:2222`.
    pub fn from_uri(input: &str) -> Result<Self, SshError> {
        let caps = host_pattern()
            .captures(input.trim())
            .ok_or_else(|| SshError::Config(format!("Not a valid ssh address: {}", input)))?;

        let username = caps[1].to_string();
        let hostname = caps[2]
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = match caps.get(3) {
            Some(p) => p
                .as_str()
                .parse::<u16>()
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| SshError::Config(format!("Invalid port: {}", p.as_str())))?,
            None => default_port(),
        };

        let mut profile = Self::new(username, hostname, port);
        if let Some(nick) = caps.get(4).filter(|n| !n.as_str().is_empty()) {
            profile.nickname = nick.as_str().to_string();
        }
        Ok(profile)
    }

    /// Canonical `ssh://` form of this profile
    pub fn to_uri(&self) -> String {
        let host = if self.hostname.contains(':') {
            format!("[{}]", self.hostname)
        } else {
            self.hostname.clone()
        };
        format!("ssh://{}@{}:{}/#{}", self.username, host, self.port, self.nickname)
    }
}

impl fmt::Display for HostProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == 22 {
            write!(f, "{}@{}", self.username, self.hostname)
        } else {
            write!(f, "{}@{}:{}", self.username, self.hostname, self.port)
        }
    }
}
