//! Session Management Module
//!
//! Provides the per-host session lifecycle with:
//! - State machine for session lifecycle
//! - Host key trust-on-first-use gate
//! - Ordered, non-blocking shell writes
//! - Once-only disconnect dispatch and event emission for frontend state sync

pub mod events;
pub mod host_key;
mod orchestrator;
pub mod state;
mod writer;

pub use events::{DisconnectNotice, DisconnectSignal, EventEmitter, SessionEvent, Transcript, TranscriptLine};
pub use host_key::{HostKeyDecision, HostKeyGate};
pub use orchestrator::{SessionDeps, ShellOutput, SshTransport};
pub use state::{SessionState, StateCell};
pub use writer::WriteDispatcher;
