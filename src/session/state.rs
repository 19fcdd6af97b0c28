//! Session lifecycle state machine
//!
//! ```text
//! Idle ─▶ Handshaking ─▶ HostKeyPending ─▶ Authenticating ─▶ SessionReady
//!              │                │                 │                │
//!              └────────────────┴──────▶ Failed ◀─┘                ▼
//!                                                            Disconnected
//! ```
//!
//! `Failed` and `Disconnected` are terminal for one connection attempt;
//! a new `connect()` starts over from `Handshaking`.

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Handshaking,
    /// Waiting for the user to accept or reject a host key
    HostKeyPending,
    Authenticating,
    SessionReady,
    Disconnected(String),
    Failed(String),
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected(_) | SessionState::Failed(_))
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::SessionReady)
    }

    /// Whether `self -> next` is a legal transition
    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Idle | Disconnected(_) | Failed(_), Handshaking) => true,
            (Handshaking, HostKeyPending | Authenticating) => true,
            (HostKeyPending, Handshaking | Authenticating) => true,
            (Authenticating, SessionReady) => true,
            (Handshaking | HostKeyPending | Authenticating, Failed(_)) => true,
            (Handshaking | HostKeyPending | Authenticating | SessionReady, Disconnected(_)) => {
                true
            }
            _ => false,
        }
    }
}

/// Shared, validated holder of the current [`SessionState`]
#[derive(Debug)]
pub struct StateCell {
    state: RwLock<SessionState>,
}

impl Default for StateCell {
    fn default() -> Self {
        Self {
            state: RwLock::new(SessionState::Idle),
        }
    }
}

impl StateCell {
    pub fn get(&self) -> SessionState {
        self.state.read().clone()
    }

    /// Move to `next` if legal; returns whether the state changed
    pub fn transition(&self, next: SessionState) -> bool {
        let mut state = self.state.write();
        if !state.can_transition_to(&next) {
            warn!("Ignoring session transition {:?} -> {:?}", *state, next);
            return false;
        }
        debug!("Session state {:?} -> {:?}", *state, next);
        *state = next;
        true
    }
}
