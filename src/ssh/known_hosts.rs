//! Known hosts management for SSH host key verification
//!
//! [`TrustStore`] is the seam the session core verifies against;
//! [`KnownHostsStore`] keeps records in OpenSSH `known_hosts` format.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use super::engine::{fingerprint_of, ServerKey};
use super::error::SshError;

/// Outcome of checking a presented host key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustVerdict {
    /// Key matches the stored record
    Ok,
    /// No record for this host and key type
    New,
    /// A different key of the same type is on record (potential MITM)
    Changed { expected_fingerprint: String },
}

/// Persisted host-key trust.
///
/// `save` is only ever called after the user accepted a NEW or CHANGED key.
pub trait TrustStore: Send + Sync {
    fn verify(&self, host: &str, port: u16, key: &ServerKey) -> TrustVerdict;
    fn save(&self, host: &str, port: u16, key: &ServerKey) -> Result<(), SshError>;
}

/// Entry in known_hosts: (key_type, base64_key)
#[derive(Clone, Debug)]
struct HostKeyEntry {
    key_type: String,
    key_data: String,
}

/// File-backed known hosts store
pub struct KnownHostsStore {
    /// Cache of `[host]:port` -> keys (one per key type)
    hosts: RwLock<HashMap<String, Vec<HostKeyEntry>>>,
    /// Path to known_hosts file
    path: PathBuf,
}

impl KnownHostsStore {
    /// Open the user's `~/.ssh/known_hosts`
    pub fn new() -> Self {
        let path = dirs::home_dir()
            .map(|h| h.join(".ssh").join("known_hosts"))
            .unwrap_or_else(|| PathBuf::from("~/.ssh/known_hosts"));
        Self::with_path(path)
    }

    /// Create with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        let store = Self {
            hosts: RwLock::new(HashMap::new()),
            path,
        };

        if let Err(e) = store.load() {
            warn!("Failed to load known_hosts {:?}: {}", store.path, e);
        }

        store
    }

    fn load(&self) -> Result<(), SshError> {
        if !self.path.exists() {
            debug!("Known hosts file {:?} does not exist yet", self.path);
            return Ok(());
        }

        let file = fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut hosts = self.hosts.write();
        let mut entry_count = 0;

        for line in reader.lines() {
            let line = line?;
            let line = line.trim();

            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            // hostname[,alias] keytype base64key [comment]
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                continue;
            }

            let entry = HostKeyEntry {
                key_type: parts[1].to_string(),
                key_data: parts[2].to_string(),
            };

            for hostname in parts[0].split(',') {
                // Hashed hostnames are not matched
                if hostname.starts_with('|') {
                    continue;
                }
                hosts
                    .entry(hostname.to_lowercase())
                    .or_default()
                    .push(entry.clone());
                entry_count += 1;
            }
        }

        info!(
            "Loaded {} known host entries ({} unique hosts)",
            entry_count,
            hosts.len()
        );
        Ok(())
    }

    /// Lookup key for host:port, OpenSSH style
    fn make_key(host: &str, port: u16) -> String {
        let host = host.to_lowercase();
        if port == 22 {
            host
        } else {
            format!("[{}]:{}", host, port)
        }
    }

    fn compute_fingerprint_from_b64(stored_b64: &str) -> String {
        match BASE64.decode(stored_b64) {
            Ok(bytes) => fingerprint_of(&bytes),
            Err(_) => "unknown".to_string(),
        }
    }

    /// Rewrite the file from the in-memory cache
    fn rewrite(&self, hosts: &HashMap<String, Vec<HostKeyEntry>>) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut names: Vec<&String> = hosts.keys().collect();
        names.sort();

        let mut content = String::new();
        for name in names {
            for entry in &hosts[name] {
                content.push_str(&format!("{} {} {}\n", name, entry.key_type, entry.key_data));
            }
        }

        fs::write(&self.path, content)?;
        Ok(())
    }

    fn append_to_file(&self, host: &str, key_type: &str, key_b64: &str) -> Result<(), SshError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;

        writeln!(file, "{} {} {}", host, key_type, key_b64)?;
        Ok(())
    }
}

impl Default for KnownHostsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl TrustStore for KnownHostsStore {
    fn verify(&self, host: &str, port: u16, key: &ServerKey) -> TrustVerdict {
        let lookup_key = Self::make_key(host, port);
        let actual_b64 = BASE64.encode(&key.key_bytes);
        let hosts = self.hosts.read();

        let Some(entries) = hosts.get(&lookup_key) else {
            debug!("Unknown host: {}", lookup_key);
            return TrustVerdict::New;
        };

        match entries.iter().find(|e| e.key_type == key.algorithm) {
            Some(entry) if entry.key_data == actual_b64 => {
                debug!("Host key verified for {} (type: {})", lookup_key, key.algorithm);
                TrustVerdict::Ok
            }
            Some(entry) => {
                let expected_fingerprint = Self::compute_fingerprint_from_b64(&entry.key_data);
                warn!(
                    "HOST KEY CHANGED for {} (type: {})! Expected {}, got {}",
                    lookup_key,
                    key.algorithm,
                    expected_fingerprint,
                    key.fingerprint()
                );
                TrustVerdict::Changed {
                    expected_fingerprint,
                }
            }
            None => {
                debug!(
                    "Host {} known but no {} key stored, treating as new",
                    lookup_key, key.algorithm
                );
                TrustVerdict::New
            }
        }
    }

    fn save(&self, host: &str, port: u16, key: &ServerKey) -> Result<(), SshError> {
        let lookup_key = Self::make_key(host, port);
        let key_b64 = BASE64.encode(&key.key_bytes);

        let mut hosts = self.hosts.write();
        let entries = hosts.entry(lookup_key.clone()).or_default();

        let replaced = match entries.iter_mut().find(|e| e.key_type == key.algorithm) {
            Some(existing) => {
                existing.key_data = key_b64.clone();
                true
            }
            None => {
                entries.push(HostKeyEntry {
                    key_type: key.algorithm.clone(),
                    key_data: key_b64.clone(),
                });
                false
            }
        };

        if replaced {
            self.rewrite(&hosts)?;
        } else {
            self.append_to_file(&lookup_key, &key.algorithm, &key_b64)?;
        }

        info!(
            "Saved host key for {} (type: {}) to known_hosts",
            lookup_key, key.algorithm
        );
        Ok(())
    }
}
