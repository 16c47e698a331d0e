// SPDX-License-Identifier: Apache-2.0
//! Document store port for the Drift hub.
//!
//! The hub checkpoints each document's visible state through [`DocStore`].
//! The store is a checkpoint of this server's authoritative state, not a
//! multi-writer source of truth: optimistic versioning exists to catch
//! driver-level races, and on conflict the server retries with its own
//! state. Two drivers ship here: a filesystem driver (one JSON record per
//! document) and an in-memory driver for tests.

use async_trait::async_trait;
use drift_core::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::Mutex;

/// Monotonic version token per document record.
pub type Version = u64;

/// Failure while talking to the store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `expected_version` did not match the stored record.
    #[error("version conflict: stored {stored}, expected {expected}")]
    VersionConflict {
        /// Version currently in the store.
        stored: Version,
        /// Version the caller expected.
        expected: Version,
    },
    /// Underlying I/O failure.
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    /// Record failed to (de)serialize.
    #[error("store serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Driver-specific failure.
    #[error("store error: {0}")]
    Other(String),
}

/// One persisted document record. `state` never contains private keys; the
/// coordinator strips them before save.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument {
    /// Visible state at save time.
    pub state: Value,
    /// Version token for optimistic concurrency.
    pub version: Version,
    /// Unix milliseconds of the save.
    pub last_saved_at: u64,
}

/// Abstract store contract: `load` by name, `save` with an expected version.
///
/// A successful save returns the new version. A save against a stale
/// `expected_version` fails with [`StoreError::VersionConflict`] and leaves
/// the stored record untouched. `expected_version` 0 means "no record yet".
#[async_trait]
pub trait DocStore: Send + Sync {
    /// Loads the record for `name`, or `None` when the document has never
    /// been saved.
    async fn load(&self, name: &str) -> Result<Option<StoredDocument>, StoreError>;

    /// Persists `state` for `name`, expecting the stored version to still be
    /// `expected_version`.
    async fn save(
        &self,
        name: &str,
        state: &Value,
        expected_version: Version,
    ) -> Result<Version, StoreError>;
}

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

// --- Filesystem driver ----------------------------------------------------

/// Stores one JSON record per document under a root directory. Writes go
/// through a temp file and rename so a crash never leaves a torn record.
pub struct FsDocStore {
    root: PathBuf,
}

impl FsDocStore {
    /// Opens (and creates) the store rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn path_for(&self, name: &str) -> PathBuf {
        self.root.join(format!("{}.json", sanitize(name)))
    }
}

/// Document names are arbitrary; anything outside `[A-Za-z0-9._-]` is
/// percent-encoded so a name can never escape the root directory.
fn sanitize(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'_' | b'-' => out.push(byte as char),
            b'.' if !out.is_empty() => out.push('.'),
            _ => {
                out.push('%');
                out.push_str(&format!("{byte:02x}"));
            }
        }
    }
    out
}

#[async_trait]
impl DocStore for FsDocStore {
    async fn load(&self, name: &str) -> Result<Option<StoredDocument>, StoreError> {
        let path = self.path_for(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    async fn save(
        &self,
        name: &str,
        state: &Value,
        expected_version: Version,
    ) -> Result<Version, StoreError> {
        let stored_version = self.load(name).await?.map_or(0, |record| record.version);
        if stored_version != expected_version {
            return Err(StoreError::VersionConflict {
                stored: stored_version,
                expected: expected_version,
            });
        }

        let record = StoredDocument {
            state: state.clone(),
            version: expected_version + 1,
            last_saved_at: now_unix_ms(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;

        let path = self.path_for(name);
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(record.version)
    }
}

// --- In-memory driver -----------------------------------------------------

/// In-memory store for tests. `fail_saves(n)` makes the next `n` saves
/// return a version conflict without touching the record, which is how the
/// retry path is exercised.
#[derive(Default, Clone)]
pub struct MemoryDocStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Default)]
struct MemoryInner {
    records: HashMap<String, StoredDocument>,
    forced_conflicts: u32,
}

impl MemoryDocStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-seeds a record (version 1), as if a previous run had saved it.
    pub async fn seed(&self, name: &str, state: Value) {
        let mut inner = self.inner.lock().await;
        inner.records.insert(
            name.to_owned(),
            StoredDocument {
                state,
                version: 1,
                last_saved_at: now_unix_ms(),
            },
        );
    }

    /// Forces the next `n` saves to fail with a version conflict.
    pub async fn fail_saves(&self, n: u32) {
        self.inner.lock().await.forced_conflicts = n;
    }

    /// Current record for `name`, if any.
    pub async fn record(&self, name: &str) -> Option<StoredDocument> {
        self.inner.lock().await.records.get(name).cloned()
    }
}

#[async_trait]
impl DocStore for MemoryDocStore {
    async fn load(&self, name: &str) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.inner.lock().await.records.get(name).cloned())
    }

    async fn save(
        &self,
        name: &str,
        state: &Value,
        expected_version: Version,
    ) -> Result<Version, StoreError> {
        let mut inner = self.inner.lock().await;
        let stored_version = inner.records.get(name).map_or(0, |record| record.version);
        if inner.forced_conflicts > 0 {
            inner.forced_conflicts -= 1;
            return Err(StoreError::VersionConflict {
                stored: stored_version,
                expected: expected_version,
            });
        }
        if stored_version != expected_version {
            return Err(StoreError::VersionConflict {
                stored: stored_version,
                expected: expected_version,
            });
        }
        let version = expected_version + 1;
        inner.records.insert(
            name.to_owned(),
            StoredDocument {
                state: state.clone(),
                version,
                last_saved_at: now_unix_ms(),
            },
        );
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counter_state(n: i64) -> Value {
        let mut map = std::collections::BTreeMap::new();
        map.insert("count".to_owned(), Value::Int(n));
        Value::Object(map)
    }

    #[tokio::test]
    async fn fs_store_round_trips_a_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocStore::new(dir.path()).unwrap();

        assert!(store.load("room1").await.unwrap().is_none());
        let v1 = store.save("room1", &counter_state(1), 0).await.unwrap();
        assert_eq!(v1, 1);

        let record = store.load("room1").await.unwrap().unwrap();
        assert_eq!(record.state, counter_state(1));
        assert_eq!(record.version, 1);
    }

    #[tokio::test]
    async fn fs_store_detects_stale_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocStore::new(dir.path()).unwrap();

        store.save("room1", &counter_state(1), 0).await.unwrap();
        let err = store.save("room1", &counter_state(2), 0).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { stored: 1, expected: 0 }));

        // Retrying with the stored version succeeds and bumps it.
        let v2 = store.save("room1", &counter_state(2), 1).await.unwrap();
        assert_eq!(v2, 2);
    }

    #[tokio::test]
    async fn fs_store_sanitizes_hostile_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsDocStore::new(dir.path()).unwrap();

        store.save("../etc/passwd", &counter_state(1), 0).await.unwrap();
        let record = store.load("../etc/passwd").await.unwrap().unwrap();
        assert_eq!(record.state, counter_state(1));
        // Nothing escaped the root: exactly one record file inside it.
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .collect();
        assert_eq!(entries.len(), 1);
    }

    #[tokio::test]
    async fn memory_store_injects_conflicts() {
        let store = MemoryDocStore::new();
        store.fail_saves(1).await;

        let err = store.save("room1", &counter_state(1), 0).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
        assert!(store.record("room1").await.is_none(), "conflict must not write");

        let v = store.save("room1", &counter_state(1), 0).await.unwrap();
        assert_eq!(v, 1);
    }
}
