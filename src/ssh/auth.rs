//! Authentication loop
//!
//! Drives the server through up to `auth_tries` paced iterations. Each
//! iteration tries one method, in priority order:
//!
//! 1. `none` (first iteration only)
//! 2. `publickey`: the pinned key, or every registry identity in order
//! 3. `keyboard-interactive`: one exchange, all prompts answered together
//! 4. `password`: one prompt, one attempt
//!
//! A method that cannot succeed again is marked exhausted and skipped.
//! Every milestone is narrated so the credential path stays auditable.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::config::{HostProfile, KeyPolicy};
use super::engine::{AuthMethodKind, InteractivePrompt, InteractiveResponder, WireEngine};
use super::error::SshError;
use super::keys::{KeyError, KeyStore};
use super::prompt::CredentialSource;
use crate::agent::{AgentIdentity, IdentityRegistry};
use crate::config::TransportSettings;

/// Receives user-visible progress lines
pub trait Narrator: Send + Sync {
    fn narrate(&self, line: &str);
}

/// Keyboard-interactive availability across iterations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InteractiveState {
    Ready,
    /// Prompts were answered but the round failed: let other methods run once
    Yielded,
    /// The server never asked anything; it will not start to
    Exhausted,
}

/// Answers server prompts through the credential source
struct PromptResponder<'a> {
    prompts: &'a dyn CredentialSource,
    presented: bool,
}

#[async_trait]
impl InteractiveResponder for PromptResponder<'_> {
    async fn respond(
        &mut self,
        name: &str,
        instructions: &str,
        prompts: &[InteractivePrompt],
    ) -> Option<Vec<String>> {
        if prompts.is_empty() {
            return Some(Vec::new());
        }
        self.presented = true;

        let title = [name, instructions]
            .into_iter()
            .find(|s| !s.is_empty());

        let mut answers = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let answer = self
                .prompts
                .request_string(title, &prompt.prompt, !prompt.echo)
                .await?;
            answers.push(answer);
        }
        Some(answers)
    }
}

/// One connection's authentication attempt
pub struct Authenticator<'a> {
    engine: &'a dyn WireEngine,
    prompts: &'a dyn CredentialSource,
    keys: &'a dyn KeyStore,
    identities: &'a Arc<IdentityRegistry>,
    narrator: &'a dyn Narrator,
    max_tries: u32,
    pacing: Duration,

    none_tried: bool,
    pubkeys_exhausted: bool,
    /// Registry generation when public keys were last exhausted
    pubkey_generation: u64,
    interactive: InteractiveState,
}

impl<'a> Authenticator<'a> {
    pub fn new(
        engine: &'a dyn WireEngine,
        prompts: &'a dyn CredentialSource,
        keys: &'a dyn KeyStore,
        identities: &'a Arc<IdentityRegistry>,
        narrator: &'a dyn Narrator,
        settings: &TransportSettings,
    ) -> Self {
        Self {
            engine,
            prompts,
            keys,
            identities,
            narrator,
            max_tries: settings.auth_tries,
            pacing: settings.auth_pacing(),
            none_tried: false,
            pubkeys_exhausted: false,
            pubkey_generation: 0,
            interactive: InteractiveState::Ready,
        }
    }

    /// Run until authenticated or out of tries
    pub async fn run(&mut self, profile: &HostProfile) -> Result<(), SshError> {
        let mut tries = 0;
        while !self.engine.is_authentication_complete() && tries < self.max_tries {
            if tries > 0 {
                tokio::time::sleep(self.pacing).await;
            }
            tries += 1;
            debug!("Authentication iteration {} for {}", tries, profile.username);

            if self.iteration(profile).await? {
                info!("Authenticated {}@{}", profile.username, profile.hostname);
                return Ok(());
            }
        }

        if self.engine.is_authentication_complete() {
            return Ok(());
        }
        warn!("Authentication exhausted after {} tries", tries);
        Err(SshError::AuthExhausted(tries))
    }

    async fn iteration(&mut self, profile: &HostProfile) -> Result<bool, SshError> {
        let user = profile.username.as_str();

        if !self.none_tried {
            self.none_tried = true;
            match self.engine.authenticate_none(user).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => debug!("Host does not support 'none' authentication: {}", e),
            }
        }

        self.narrator.narrate("Authenticating...");

        if self.pubkeys_exhausted
            && profile.key_policy == KeyPolicy::Any
            && self.identities.generation() != self.pubkey_generation
        {
            debug!("New identities registered, public keys may be retried");
            self.pubkeys_exhausted = false;
        }

        let interactive_ready = self.interactive == InteractiveState::Ready;
        if self.interactive == InteractiveState::Yielded {
            self.interactive = InteractiveState::Ready;
        }

        if !self.pubkeys_exhausted
            && profile.key_policy != KeyPolicy::None
            && self.available(user, AuthMethodKind::PublicKey).await?
        {
            let ok = match profile.key_policy {
                KeyPolicy::Specific { id } => self.try_pinned_key(user, id).await?,
                _ => self.try_registry_keys(user).await?,
            };
            self.pubkeys_exhausted = true;
            self.pubkey_generation = self.identities.generation();
            Ok(ok)
        } else if interactive_ready
            && self
                .available(user, AuthMethodKind::KeyboardInteractive)
                .await?
        {
            self.narrator
                .narrate("Attempting 'keyboard-interactive' authentication");
            let mut responder = PromptResponder {
                prompts: self.prompts,
                presented: false,
            };
            let outcome = self
                .engine
                .authenticate_keyboard_interactive(user, &mut responder)
                .await;
            if attempt_outcome("keyboard-interactive", outcome)? {
                return Ok(true);
            }
            self.interactive = if responder.presented {
                InteractiveState::Yielded
            } else {
                InteractiveState::Exhausted
            };
            self.narrator
                .narrate("'keyboard-interactive' authentication failed");
            Ok(false)
        } else if self.available(user, AuthMethodKind::Password).await? {
            self.narrator.narrate("Attempting 'password' authentication");
            let password = self
                .prompts
                .request_string(None, "Password", true)
                .await;
            if let Some(password) = password {
                let outcome = self.engine.authenticate_password(user, &password).await;
                if attempt_outcome("password", outcome)? {
                    return Ok(true);
                }
            }
            self.narrator.narrate("'password' authentication failed");
            Ok(false)
        } else {
            self.narrator
                .narrate("No supported authentication methods available");
            Ok(false)
        }
    }

    /// Try every registered identity in registration order
    async fn try_registry_keys(&self, user: &str) -> Result<bool, SshError> {
        self.narrator
            .narrate("Attempting 'publickey' authentication with any in-memory public keys");

        for identity in self.identities.snapshot() {
            if identity.confirm && !self.confirm_use(&identity.comment).await {
                continue;
            }
            if self.try_key(user, &identity).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Try the key pinned for this host, decrypting and caching it as needed
    async fn try_pinned_key(&self, user: &str, id: i64) -> Result<bool, SshError> {
        self.narrator
            .narrate("Attempting 'publickey' authentication with a specific public key");

        let Some(stored) = self.keys.get(id) else {
            self.narrator
                .narrate("Selected public key is invalid, try reselecting key in host editor");
            return Ok(false);
        };

        if let Some(identity) = self.identities.find_by_comment(&stored.nickname) {
            debug!("Found unlocked key '{}' already in memory", stored.nickname);
            if identity.confirm && !self.confirm_use(&identity.comment).await {
                return Ok(false);
            }
            return self.try_key(user, &identity).await;
        }

        let passphrase = if stored.encrypted {
            let message = format!("Passphrase for key '{}'", stored.nickname);
            match self.prompts.request_string(None, &message, true).await {
                Some(passphrase) => Some(zeroize::Zeroizing::new(passphrase)),
                None => return Ok(false),
            }
        } else {
            None
        };

        let key = match stored.decode(passphrase.as_ref().map(|p| p.as_str())) {
            Ok(key) => key,
            Err(KeyError::InvalidPassphrase(name)) => {
                self.narrator.narrate(&format!(
                    "Bad passphrase for key '{}'. Authentication failed.",
                    name
                ));
                return Ok(false);
            }
            Err(e) => {
                warn!("Pinned key {} unusable: {}", id, e);
                self.narrator
                    .narrate("Selected public key is invalid, try reselecting key in host editor");
                return Ok(false);
            }
        };

        info!("Unlocked key '{}'", stored.nickname);
        let identity =
            AgentIdentity::new(key, stored.nickname.clone()).with_confirm(stored.confirm_use);
        self.identities.add(identity.clone());

        if identity.confirm && !self.confirm_use(&identity.comment).await {
            return Ok(false);
        }
        self.try_key(user, &identity).await
    }

    async fn try_key(&self, user: &str, identity: &AgentIdentity) -> Result<bool, SshError> {
        let outcome = self
            .engine
            .authenticate_publickey(user, identity.key.clone())
            .await;
        let ok = attempt_outcome("publickey", outcome)?;
        if !ok {
            self.narrator.narrate(&format!(
                "Authentication method 'publickey' with key '{}' failed",
                identity.comment
            ));
        }
        Ok(ok)
    }

    /// Method query; an error other than a lost connection means "not available"
    async fn available(&self, user: &str, method: AuthMethodKind) -> Result<bool, SshError> {
        match self.engine.is_auth_method_available(user, method).await {
            Ok(available) => Ok(available),
            Err(e) if e.is_connection_lost() => Err(e),
            Err(e) => {
                debug!("Could not query {:?} availability: {}", method, e);
                Ok(false)
            }
        }
    }

    async fn confirm_use(&self, comment: &str) -> bool {
        let message = format!("Use key '{}' for authentication?", comment);
        self.prompts.request_boolean(None, &message).await == Some(true)
    }
}

/// An engine error fails the single attempt unless the connection itself is gone
fn attempt_outcome(method: &str, outcome: Result<bool, SshError>) -> Result<bool, SshError> {
    match outcome {
        Ok(ok) => Ok(ok),
        Err(e) if e.is_connection_lost() => Err(e),
        Err(e) => {
            warn!("'{}' authentication attempt errored: {}", method, e);
            Ok(false)
        }
    }
}
