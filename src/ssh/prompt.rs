//! Credential prompts
//!
//! The session core asks the user questions through [`CredentialSource`].
//! [`PromptBroker`] is the channel-backed implementation used by front ends:
//! each question becomes a [`PromptRequest`] carrying a one-shot reply.
//!
//! ```text
//! session task                         front end
//!    │                                     │
//!    │──── PromptRequest (mpsc) ──────────▶│ render prompt
//!    │                                     │
//!    │◀─── answer_* / cancel (oneshot) ────│ user input
//! ```
//!
//! Dropping a request without answering is a cancellation, as is the
//! optional timeout elapsing.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Blocking-style yes/no and text questions.
///
/// `None` means the prompt was cancelled (no answer).
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn request_boolean(&self, title: Option<&str>, message: &str) -> Option<bool>;

    async fn request_string(
        &self,
        title: Option<&str>,
        message: &str,
        secret: bool,
    ) -> Option<String>;
}

/// What kind of answer a prompt expects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Boolean,
    Text { secret: bool },
}

#[derive(Debug)]
enum PromptAnswer {
    Boolean(bool),
    Text(String),
}

/// A question waiting for the front end
#[derive(Debug)]
pub struct PromptRequest {
    pub id: String,
    pub title: Option<String>,
    pub message: String,
    pub kind: PromptKind,
    reply: oneshot::Sender<PromptAnswer>,
}

impl PromptRequest {
    pub fn answer_boolean(self, value: bool) {
        if self.reply.send(PromptAnswer::Boolean(value)).is_err() {
            debug!("Prompt {} answered after the asker went away", self.id);
        }
    }

    pub fn answer_text(self, value: impl Into<String>) {
        if self.reply.send(PromptAnswer::Text(value.into())).is_err() {
            debug!("Prompt {} answered after the asker went away", self.id);
        }
    }

    pub fn cancel(self) {}
}

/// Channel-backed [`CredentialSource`]
#[derive(Clone)]
pub struct PromptBroker {
    tx: mpsc::UnboundedSender<PromptRequest>,
    timeout: Option<Duration>,
}

impl PromptBroker {
    /// Create a broker and the receiver the front end drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PromptRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx, timeout: None }, rx)
    }

    /// Treat prompts unanswered after `timeout` as cancelled
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn ask(&self, title: Option<&str>, message: &str, kind: PromptKind) -> Option<PromptAnswer> {
        let (reply, reply_rx) = oneshot::channel();
        let request = PromptRequest {
            id: uuid::Uuid::new_v4().to_string(),
            title: title.map(str::to_string),
            message: message.to_string(),
            kind,
            reply,
        };

        if self.tx.send(request).is_err() {
            warn!("No prompt listener, treating \"{}\" as cancelled", message);
            return None;
        }

        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(answer) => answer.ok(),
                Err(_) => {
                    warn!("Prompt timed out after {:?}: {}", limit, message);
                    None
                }
            },
            None => reply_rx.await.ok(),
        }
    }
}

#[async_trait]
impl CredentialSource for PromptBroker {
    async fn request_boolean(&self, title: Option<&str>, message: &str) -> Option<bool> {
        match self.ask(title, message, PromptKind::Boolean).await? {
            PromptAnswer::Boolean(value) => Some(value),
            PromptAnswer::Text(text) => {
                let text = text.trim().to_ascii_lowercase();
                Some(text == "y" || text == "yes")
            }
        }
    }

    async fn request_string(
        &self,
        title: Option<&str>,
        message: &str,
        secret: bool,
    ) -> Option<String> {
        match self.ask(title, message, PromptKind::Text { secret }).await? {
            PromptAnswer::Text(text) => Some(text),
            PromptAnswer::Boolean(_) => None,
        }
    }
}
