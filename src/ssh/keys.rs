//! Stored private keys
//!
//! A [`KeyStore`] hands out key material by id. Decrypting it is the
//! authentication loop's business: a wrong passphrase fails that one key
//! and nothing else.

use std::path::{Path, PathBuf};

use russh::keys::PrivateKey;
use thiserror::Error;
use tracing::debug;
use zeroize::Zeroizing;

/// Errors that can occur during key loading
#[derive(Debug, Error)]
pub enum KeyError {
    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Failed to read key file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse key: {0}")]
    ParseError(String),

    #[error("Encrypted key requires passphrase")]
    PassphraseRequired,

    #[error("Bad passphrase for key '{0}'")]
    InvalidPassphrase(String),
}

/// Private key material as persisted by the host application
#[derive(Clone)]
pub struct StoredKey {
    pub id: i64,
    pub nickname: String,
    /// Material needs a passphrase before use
    pub encrypted: bool,
    /// Ask the user before every use of this key
    pub confirm_use: bool,
    /// OpenSSH or PEM encoded private key
    pub material: Zeroizing<String>,
}

impl std::fmt::Debug for StoredKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredKey")
            .field("id", &self.id)
            .field("nickname", &self.nickname)
            .field("encrypted", &self.encrypted)
            .field("confirm_use", &self.confirm_use)
            .finish_non_exhaustive()
    }
}

impl StoredKey {
    /// Decode the material, decrypting with `passphrase` when encrypted
    pub fn decode(&self, passphrase: Option<&str>) -> Result<PrivateKey, KeyError> {
        if self.encrypted && passphrase.is_none() {
            return Err(KeyError::PassphraseRequired);
        }

        russh::keys::decode_secret_key(&self.material, passphrase).map_err(|e| {
            debug!("Decoding key '{}' failed: {}", self.nickname, e);
            if self.encrypted {
                KeyError::InvalidPassphrase(self.nickname.clone())
            } else {
                KeyError::ParseError(e.to_string())
            }
        })
    }
}

/// Source of pinned keys, looked up by id
pub trait KeyStore: Send + Sync {
    fn get(&self, id: i64) -> Option<StoredKey>;
}

/// Key store over private key files on disk
#[derive(Debug, Default)]
pub struct FileKeyStore {
    entries: Vec<(i64, PathBuf, bool)>,
}

impl FileKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a key file under `id`
    pub fn with_key(mut self, id: i64, path: impl AsRef<Path>, confirm_use: bool) -> Self {
        self.entries
            .push((id, expand_tilde(path.as_ref()), confirm_use));
        self
    }

    fn load(id: i64, path: &Path, confirm_use: bool) -> Result<StoredKey, KeyError> {
        if !path.exists() {
            return Err(KeyError::NotFound(path.display().to_string()));
        }

        let material = Zeroizing::new(std::fs::read_to_string(path)?);
        let encrypted = russh::keys::decode_secret_key(&material, None).is_err();
        let nickname = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(StoredKey {
            id,
            nickname,
            encrypted,
            confirm_use,
            material,
        })
    }
}

impl KeyStore for FileKeyStore {
    fn get(&self, id: i64) -> Option<StoredKey> {
        let (_, path, confirm) = self.entries.iter().find(|(key_id, _, _)| *key_id == id)?;
        match Self::load(id, path, *confirm) {
            Ok(key) => Some(key),
            Err(e) => {
                debug!("Key {} at {:?} unavailable: {}", id, path, e);
                None
            }
        }
    }
}

/// Expand ~ to home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if let Some(stripped) = path_str.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path_str == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }

    path.to_path_buf()
}
