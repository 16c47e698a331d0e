// SPDX-License-Identifier: Apache-2.0
//! Preference storage for the `driftd` binary.
//!
//! A thin service over a storage port: values are JSON, keyed by logical
//! name, stored under the platform config directory. The binary loads its
//! [`crate::ServerConfig`] through this and writes the defaults back on
//! first run so operators have a file to edit.

use directories::ProjectDirs;
use serde::{de::DeserializeOwned, Serialize};
use std::fs;
use std::path::PathBuf;
use thiserror::Error;

/// Failure while loading or saving preferences.
#[derive(Debug, Error)]
pub enum PrefsError {
    /// Key not present in the store.
    #[error("not found")]
    NotFound,
    /// I/O failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// (De)serialization failure.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Platform config directory could not be resolved.
    #[error("{0}")]
    Other(String),
}

/// Storage port for raw preference blobs.
pub trait PrefsStore {
    /// Loads a raw blob; [`PrefsError::NotFound`] when absent.
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, PrefsError>;
    /// Persists a raw blob.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), PrefsError>;
}

/// Serializes values and delegates storage to a [`PrefsStore`].
pub struct PrefsService<S> {
    store: S,
}

impl<S> PrefsService<S>
where
    S: PrefsStore,
{
    /// Wraps a store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Loads and deserializes `key`; `Ok(None)` when missing.
    pub fn load<T>(&self, key: &str) -> Result<Option<T>, PrefsError>
    where
        T: DeserializeOwned,
    {
        match self.store.load_raw(key) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(PrefsError::NotFound) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Serializes and persists `key`.
    pub fn save<T>(&self, key: &str, value: &T) -> Result<(), PrefsError>
    where
        T: Serialize,
    {
        let data = serde_json::to_vec_pretty(value)?;
        self.store.save_raw(key, &data)
    }
}

/// Preferences as JSON files under the platform config dir
/// (e.g. `~/.config/drift`).
pub struct FsPrefsStore {
    base: PathBuf,
}

impl FsPrefsStore {
    /// Opens the per-user store, creating the directory if needed.
    pub fn new() -> Result<Self, PrefsError> {
        let proj = ProjectDirs::from("dev", "driftlabs", "drift")
            .ok_or_else(|| PrefsError::Other("could not resolve config dir".into()))?;
        let base = proj.config_dir().to_path_buf();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    /// Store rooted at an explicit directory (tests, containers).
    pub fn at(base: impl Into<PathBuf>) -> Result<Self, PrefsError> {
        let base = base.into();
        fs::create_dir_all(&base)?;
        Ok(Self { base })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base.join(format!("{key}.json"))
    }
}

impl PrefsStore for FsPrefsStore {
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, PrefsError> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(PrefsError::NotFound),
            Err(err) => Err(PrefsError::Io(err)),
        }
    }

    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), PrefsError> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ServerConfig;

    #[test]
    fn load_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let service = PrefsService::new(FsPrefsStore::at(dir.path()).unwrap());

        assert!(service.load::<ServerConfig>("server").unwrap().is_none());

        let mut config = ServerConfig::default();
        config.port = 9999;
        service.save("server", &config).unwrap();

        let loaded: ServerConfig = service.load("server").unwrap().expect("present");
        assert_eq!(loaded.port, 9999);
    }
}
