//! Configuration Storage
//!
//! Handles reading/writing transport settings to disk.
//! Config location: ~/.oxideterm on macOS/Linux, %APPDATA%\OxideTerm on Windows

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<StorageError> for crate::ssh::SshError {
    fn from(err: StorageError) -> Self {
        crate::ssh::SshError::Config(err.to_string())
    }
}

/// Tunables shared by every session created by this process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Upper bound on authentication loop iterations
    pub auth_tries: u32,
    /// Pause between authentication iterations
    pub auth_pacing_ms: u64,
    /// TCP connect + handshake timeout
    pub connect_timeout_secs: u64,
    /// Address local and dynamic forwards listen on
    pub forward_bind_address: String,
    /// Per-direction relay buffer
    pub forward_buffer_size: usize,
    /// Timeout for opening a direct-tcpip channel
    pub channel_open_timeout_secs: u64,
    /// SSH keepalive interval; 0 disables keepalives
    pub keepalive_interval_secs: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            auth_tries: 20,
            auth_pacing_ms: 1000,
            connect_timeout_secs: 30,
            forward_bind_address: "127.0.0.1".to_string(),
            forward_buffer_size: 32 * 1024,
            channel_open_timeout_secs: 30,
            keepalive_interval_secs: 30,
        }
    }
}

impl TransportSettings {
    pub fn auth_pacing(&self) -> Duration {
        Duration::from_millis(self.auth_pacing_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn channel_open_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_open_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_secs > 0).then(|| Duration::from_secs(self.keepalive_interval_secs))
    }
}

/// Get the OxideTerm configuration directory
/// Returns %APPDATA%\OxideTerm on Windows, ~/.oxideterm on macOS/Linux
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("OxideTerm"));
        }
        dirs::home_dir()
            .map(|home| home.join(".oxideterm"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".oxideterm"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// Get the transport settings file path
pub fn settings_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("transport.json"))
}

/// Transport settings storage
pub struct SettingsStorage {
    path: PathBuf,
}

impl SettingsStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            path: settings_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load settings from disk.
    /// A missing file yields defaults; a malformed file is an error.
    pub async fn load(&self) -> Result<TransportSettings, StorageError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("No transport settings at {:?}, using defaults", self.path);
                Ok(TransportSettings::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Save settings atomically (write to temp file, then rename)
    pub async fn save(&self, settings: &TransportSettings) -> Result<(), StorageError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let json = serde_json::to_string_pretty(settings)?;
        let temp_path = self.path.with_extension("json.tmp");

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempdir().unwrap();
        let storage = SettingsStorage::with_path(dir.path().join("transport.json"));
        let settings = storage.load().await.unwrap();
        assert_eq!(settings, TransportSettings::default());
        assert_eq!(settings.auth_tries, 20);
        assert_eq!(settings.auth_pacing(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let storage = SettingsStorage::with_path(dir.path().join("nested").join("transport.json"));

        let settings = TransportSettings {
            auth_tries: 3,
            forward_bind_address: "0.0.0.0".into(),
            ..Default::default()
        };
        storage.save(&settings).await.unwrap();

        assert_eq!(storage.load().await.unwrap(), settings);
    }

    #[tokio::test]
    async fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transport.json");
        std::fs::write(&path, r#"{"auth_pacing_ms": 5}"#).unwrap();

        let settings = SettingsStorage::with_path(path).load().await.unwrap();
        assert_eq!(settings.auth_pacing_ms, 5);
        assert_eq!(settings.forward_buffer_size, 32 * 1024);
    }

    #[tokio::test]
    async fn test_malformed_file_is_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("transport.json");
        std::fs::write(&path, "{ nope").unwrap();

        let result = SettingsStorage::with_path(path).load().await;
        assert!(matches!(result, Err(StorageError::Json(_))));
    }

    #[test]
    fn test_keepalive_zero_disables() {
        let settings = TransportSettings {
            keepalive_interval_secs: 0,
            ..Default::default()
        };
        assert!(settings.keepalive_interval().is_none());
    }
}
