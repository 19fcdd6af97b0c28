//! Session events and the user-visible transcript
//!
//! Logging goes through `tracing`. What the user should see (which key was
//! tried, what the host key looked like) goes to the [`Transcript`], an
//! append-only list that is also published as [`SessionEvent::Transcript`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info};

use super::state::SessionState;
use crate::ssh::Narrator;

/// Event channel capacity; slow subscribers lag rather than block the session
const EVENT_CAPACITY: usize = 256;

/// One transcript line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TranscriptLine {
    pub at: DateTime<Utc>,
    pub text: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum SessionEvent {
    StateChanged { state: SessionState },
    Transcript { line: TranscriptLine },
    Connected,
    Disconnected { clean: bool, reason: String },
}

/// Fan-out of session events to any number of subscribers
#[derive(Clone)]
pub struct EventEmitter {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventEmitter {
    fn default() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }
}

impl EventEmitter {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

/// Append-only, timestamped narration of one session
#[derive(Clone)]
pub struct Transcript {
    lines: Arc<RwLock<Vec<TranscriptLine>>>,
    events: EventEmitter,
}

impl Transcript {
    pub fn new(events: EventEmitter) -> Self {
        Self {
            lines: Arc::new(RwLock::new(Vec::new())),
            events,
        }
    }

    pub fn push(&self, text: impl Into<String>) {
        let line = TranscriptLine {
            at: Utc::now(),
            text: text.into(),
        };
        debug!("transcript: {}", line.text);
        self.lines.write().push(line.clone());
        self.events.emit(SessionEvent::Transcript { line });
    }

    pub fn lines(&self) -> Vec<TranscriptLine> {
        self.lines.read().clone()
    }

    /// Line texts only
    pub fn texts(&self) -> Vec<String> {
        self.lines.read().iter().map(|l| l.text.clone()).collect()
    }
}

impl Narrator for Transcript {
    fn narrate(&self, line: &str) {
        self.push(line);
    }
}

/// Why the session is going away
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectNotice {
    pub clean: bool,
    pub reason: String,
}

/// Once-only disconnect notification.
///
/// Read EOF, the write dispatcher, the connection-lost watcher and
/// `close()` all race to fire it; only the first one is delivered.
#[derive(Clone)]
pub struct DisconnectSignal {
    fired: Arc<AtomicBool>,
    tx: mpsc::UnboundedSender<DisconnectNotice>,
}

impl DisconnectSignal {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DisconnectNotice>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                fired: Arc::new(AtomicBool::new(false)),
                tx,
            },
            rx,
        )
    }

    /// Returns true only for the call that actually fired
    pub fn fire(&self, clean: bool, reason: impl Into<String>) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }
        let notice = DisconnectNotice {
            clean,
            reason: reason.into(),
        };
        info!("Disconnect requested (clean: {}): {}", notice.clean, notice.reason);
        let _ = self.tx.send(notice);
        true
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}
