//! Host key trust-on-first-use gate
//!
//! Runs inside the engine's handshake. Known keys pass silently (apart
//! from a transcript line); new and changed keys need an explicit "yes",
//! and only that "yes" writes a trust record.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{info, warn};

use super::state::{SessionState, StateCell};
use crate::ssh::{CredentialSource, Narrator, ServerKey, ServerKeyVerifier, TrustStore, TrustVerdict};

const CONTINUE_PROMPT: &str = "Are you sure you want to continue connecting?";
const CHANGED_HEADER: &str = "WARNING: REMOTE HOST IDENTIFICATION HAS CHANGED!";
const CHANGED_WARNING: &str = "IT IS POSSIBLE THAT SOMEONE IS DOING SOMETHING NASTY! \
Someone could be eavesdropping on you right now (man-in-the-middle attack). \
It is also possible that the host key has just been changed.";

/// What happened to the last presented key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyDecision {
    /// Matched the trust store
    Trusted,
    /// New or changed, accepted by the user and saved
    Accepted,
    /// Rejected or the prompt was cancelled
    Rejected,
}

/// Short display name for a host key algorithm
fn algorithm_name(algorithm: &str) -> &str {
    match algorithm {
        "ssh-rsa" | "rsa-sha2-256" | "rsa-sha2-512" => "RSA",
        "ssh-dss" => "DSA",
        "ssh-ed25519" => "Ed25519",
        a if a.starts_with("ecdsa-") => "EC",
        other => other,
    }
}

/// Verifies server keys against a [`TrustStore`], asking the user when needed
pub struct HostKeyGate {
    trust: Arc<dyn TrustStore>,
    prompts: Arc<dyn CredentialSource>,
    narrator: Arc<dyn Narrator>,
    state: Arc<StateCell>,
    decision: Mutex<Option<HostKeyDecision>>,
}

impl HostKeyGate {
    pub fn new(
        trust: Arc<dyn TrustStore>,
        prompts: Arc<dyn CredentialSource>,
        narrator: Arc<dyn Narrator>,
        state: Arc<StateCell>,
    ) -> Self {
        Self {
            trust,
            prompts,
            narrator,
            state,
            decision: Mutex::new(None),
        }
    }

    /// Decision for the most recent handshake, if the key was ever presented
    pub fn decision(&self) -> Option<HostKeyDecision> {
        *self.decision.lock()
    }

    fn decide(&self, decision: HostKeyDecision) -> bool {
        *self.decision.lock() = Some(decision);
        decision != HostKeyDecision::Rejected
    }

    /// Prompt, and on "yes" persist the key
    async fn ask_and_save(&self, host: &str, port: u16, key: &ServerKey) -> bool {
        self.state.transition(SessionState::HostKeyPending);
        let answer = self.prompts.request_boolean(None, CONTINUE_PROMPT).await;

        if answer != Some(true) {
            info!("Host key for {}:{} rejected ({:?})", host, port, answer);
            return self.decide(HostKeyDecision::Rejected);
        }

        if let Err(e) = self.trust.save(host, port, key) {
            warn!("Failed to save host key for {}:{}: {}", host, port, e);
            self.narrator
                .narrate(&format!("Could not remember host key: {}", e));
        }
        self.state.transition(SessionState::Handshaking);
        self.decide(HostKeyDecision::Accepted)
    }
}

#[async_trait]
impl ServerKeyVerifier for HostKeyGate {
    async fn verify_server_key(&self, host: &str, port: u16, key: &ServerKey) -> bool {
        let algorithm = algorithm_name(&key.algorithm);
        let fingerprint = key.fingerprint();

        match self.trust.verify(host, port, key) {
            TrustVerdict::Ok => {
                self.narrator.narrate(&format!(
                    "Host key verified ({}): {}",
                    algorithm, fingerprint
                ));
                self.decide(HostKeyDecision::Trusted)
            }
            TrustVerdict::New => {
                self.narrator.narrate(&format!(
                    "The authenticity of host '{}' can't be established.",
                    host
                ));
                self.narrator.narrate(&format!(
                    "Host {} key fingerprint is {}",
                    algorithm, fingerprint
                ));
                self.ask_and_save(host, port, key).await
            }
            TrustVerdict::Changed {
                expected_fingerprint,
            } => {
                warn!(
                    "Host key for {}:{} changed, expected {}",
                    host, port, expected_fingerprint
                );
                let header = format!("@   {}   @", CHANGED_HEADER);
                let border = "@".repeat(header.len());
                self.narrator.narrate(&border);
                self.narrator.narrate(&header);
                self.narrator.narrate(&border);
                self.narrator.narrate(CHANGED_WARNING);
                self.narrator.narrate(&format!(
                    "Host {} key fingerprint is {}",
                    algorithm, fingerprint
                ));
                self.ask_and_save(host, port, key).await
            }
        }
    }
}
