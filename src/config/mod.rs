//! Configuration Management Module
//!
//! Transport tunables (authentication pacing, forward buffers, timeouts)
//! persisted as JSON next to the rest of the OxideTerm configuration.
//! Host profiles live in [`crate::ssh::HostProfile`].

pub mod storage;

pub use storage::{config_dir, settings_file, SettingsStorage, StorageError, TransportSettings};
