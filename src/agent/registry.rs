//! Identity Registry: the keys this process can sign with.
//!
//! Shared by authentication (policy "any") and by every agent bridge, so
//! all access goes through one mutex. A lock passphrase hides the
//! identities from agent requests until it is unlocked again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use russh::keys::PrivateKey;
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use zeroize::Zeroizing;

use super::keys::public_blob;

/// One signing identity
#[derive(Clone)]
pub struct AgentIdentity {
    pub key: Arc<PrivateKey>,
    pub public_blob: Vec<u8>,
    pub comment: String,
    /// Ask the user before every signature
    pub confirm: bool,
    pub lifetime: Option<Duration>,
    added_at: Instant,
}

impl AgentIdentity {
    pub fn new(key: PrivateKey, comment: impl Into<String>) -> Self {
        let public_blob = public_blob(&key);
        Self {
            key: Arc::new(key),
            public_blob,
            comment: comment.into(),
            confirm: false,
            lifetime: None,
            added_at: Instant::now(),
        }
    }

    pub fn with_confirm(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_lifetime(mut self, lifetime: Option<Duration>) -> Self {
        self.lifetime = lifetime;
        self
    }

    fn expired(&self, now: Instant) -> bool {
        self.lifetime
            .is_some_and(|lifetime| now.duration_since(self.added_at) >= lifetime)
    }
}

impl std::fmt::Debug for AgentIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentIdentity")
            .field("comment", &self.comment)
            .field("confirm", &self.confirm)
            .field("lifetime", &self.lifetime)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
struct RegistryInner {
    identities: Vec<AgentIdentity>,
    lock: Option<Zeroizing<Vec<u8>>>,
    /// Bumped on add, remove and unlock
    generation: u64,
}

impl RegistryInner {
    fn purge_expired(&mut self) {
        let now = Instant::now();
        let before = self.identities.len();
        self.identities.retain(|id| !id.expired(now));
        let purged = before - self.identities.len();
        if purged > 0 {
            info!("Removed {} expired agent identities", purged);
        }
    }
}

/// Process-wide identity registry
#[derive(Default)]
pub struct IdentityRegistry {
    inner: Mutex<RegistryInner>,
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace (same public key) an identity
    pub fn add(&self, identity: AgentIdentity) {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        debug!("Adding agent identity '{}'", identity.comment);
        match inner
            .identities
            .iter_mut()
            .find(|existing| existing.public_blob == identity.public_blob)
        {
            Some(existing) => *existing = identity,
            None => inner.identities.push(identity),
        }
        inner.generation += 1;
    }

    /// Remove one identity by public key; false if absent
    pub fn remove(&self, public_blob: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.identities.len();
        inner.identities.retain(|id| id.public_blob != public_blob);
        let removed = inner.identities.len() != before;
        if removed {
            inner.generation += 1;
        }
        removed
    }

    pub fn remove_all(&self) {
        let mut inner = self.inner.lock();
        info!("Removing all {} agent identities", inner.identities.len());
        inner.identities.clear();
        inner.generation += 1;
    }

    /// Identities in registration order, whether locked or not
    pub fn snapshot(&self) -> Vec<AgentIdentity> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        inner.identities.clone()
    }

    /// Public keys and comments; empty while locked
    pub fn public_identities(&self) -> Vec<(Vec<u8>, String)> {
        let mut inner = self.inner.lock();
        if inner.lock.is_some() {
            return Vec::new();
        }
        inner.purge_expired();
        inner
            .identities
            .iter()
            .map(|id| (id.public_blob.clone(), id.comment.clone()))
            .collect()
    }

    pub fn find(&self, public_blob: &[u8]) -> Option<AgentIdentity> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        inner
            .identities
            .iter()
            .find(|id| id.public_blob == public_blob)
            .cloned()
    }

    pub fn find_by_comment(&self, comment: &str) -> Option<AgentIdentity> {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        inner
            .identities
            .iter()
            .find(|id| id.comment == comment)
            .cloned()
    }

    pub fn is_locked(&self) -> bool {
        self.inner.lock().lock.is_some()
    }

    /// Lock with a passphrase; false if already locked
    pub fn lock(&self, passphrase: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        if inner.lock.is_some() {
            return false;
        }
        inner.lock = Some(Zeroizing::new(passphrase.to_vec()));
        info!("Agent identities locked");
        true
    }

    /// Unlock; true only when locked and the passphrase matches
    pub fn unlock(&self, passphrase: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        let matches = match &inner.lock {
            Some(stored) => bool::from(stored.as_slice().ct_eq(passphrase)),
            None => false,
        };
        if matches {
            inner.lock = None;
            inner.generation += 1;
            info!("Agent identities unlocked");
        }
        matches
    }

    /// Changes whenever the usable identity set changes
    pub fn generation(&self) -> u64 {
        self.inner.lock().generation
    }

    pub fn len(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.purge_expired();
        inner.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::keys::tests::test_key;

    #[test]
    fn test_add_replace_remove() {
        let registry = IdentityRegistry::new();
        registry.add(AgentIdentity::new(test_key(1), "one"));
        registry.add(AgentIdentity::new(test_key(2), "two"));
        registry.add(AgentIdentity::new(test_key(1), "one again"));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.snapshot()[0].comment, "one again");

        let blob = public_blob(&test_key(2));
        assert!(registry.remove(&blob));
        assert!(!registry.remove(&blob));
        assert_eq!(registry.len(), 1);

        registry.remove_all();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registration_order() {
        let registry = IdentityRegistry::new();
        for seed in [5, 3, 8] {
            registry.add(AgentIdentity::new(test_key(seed), format!("k{}", seed)));
        }
        let comments: Vec<String> = registry.snapshot().into_iter().map(|i| i.comment).collect();
        assert_eq!(comments, vec!["k5", "k3", "k8"]);
    }

    #[test]
    fn test_lock_hides_identities() {
        let registry = IdentityRegistry::new();
        registry.add(AgentIdentity::new(test_key(1), "one"));

        assert!(registry.lock(b"secret"));
        assert!(!registry.lock(b"again"));
        assert!(registry.public_identities().is_empty());
        assert!(registry.is_locked());

        assert!(!registry.unlock(b"wrong"));
        assert!(registry.is_locked());
        assert!(registry.unlock(b"secret"));
        assert!(!registry.unlock(b"secret"));
        assert_eq!(registry.public_identities().len(), 1);
    }

    #[test]
    fn test_lifetime_expiry() {
        let registry = IdentityRegistry::new();
        registry.add(AgentIdentity::new(test_key(1), "short").with_lifetime(Some(Duration::ZERO)));
        registry.add(AgentIdentity::new(test_key(2), "long").with_lifetime(Some(Duration::from_secs(3600))));
        assert_eq!(registry.len(), 1);
        assert!(registry.find_by_comment("short").is_none());
        assert!(registry.find_by_comment("long").is_some());
    }

    #[test]
    fn test_generation_bumps_on_add() {
        let registry = IdentityRegistry::new();
        let g0 = registry.generation();
        registry.add(AgentIdentity::new(test_key(1), "one"));
        assert!(registry.generation() > g0);
    }

    #[test]
    fn test_generation_bumps_on_remove_and_unlock() {
        let registry = IdentityRegistry::new();
        registry.add(AgentIdentity::new(test_key(1), "one"));
        registry.add(AgentIdentity::new(test_key(2), "two"));

        let g = registry.generation();
        assert!(registry.remove(&public_blob(&test_key(1))));
        let after_remove = registry.generation();
        assert!(after_remove > g);

        // nothing removed, nothing changed
        assert!(!registry.remove(&public_blob(&test_key(1))));
        assert_eq!(registry.generation(), after_remove);

        assert!(registry.lock(b"pw"));
        assert_eq!(registry.generation(), after_remove);
        assert!(!registry.unlock(b"wrong"));
        assert_eq!(registry.generation(), after_remove);
        assert!(registry.unlock(b"pw"));
        let after_unlock = registry.generation();
        assert!(after_unlock > after_remove);

        registry.remove_all();
        assert!(registry.generation() > after_unlock);
    }
}
