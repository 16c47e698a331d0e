// SPDX-License-Identifier: Apache-2.0
//! Per-document persistence coordination.
//!
//! Saves are debounced (at most one per `save_min_interval`) and run off
//! the sequencer task so a slow store never stalls the tick. The store is a
//! checkpoint of this server's state: on a version conflict the coordinator
//! adopts the stored version token and retries at the next debounce
//! boundary, so the server's state always wins. Persistence failures are
//! never fatal to the document.

use drift_core::Value;
use drift_store::{DocStore, StoreError, Version};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

/// Outcome of a spawned save, reported back to the sequencer.
pub(crate) type SaveOutcome = Result<Version, StoreError>;

/// Save bookkeeping owned by one document's sequencer.
pub(crate) struct SaveState {
    store: Arc<dyn DocStore>,
    version: Version,
    last_save: Option<Instant>,
    in_flight: bool,
    dirty: bool,
    min_interval: std::time::Duration,
}

impl SaveState {
    pub(crate) fn new(
        store: Arc<dyn DocStore>,
        loaded_version: Version,
        min_interval: std::time::Duration,
    ) -> Self {
        Self {
            store,
            version: loaded_version,
            last_save: None,
            in_flight: false,
            dirty: false,
            min_interval,
        }
    }

    /// Marks the document as needing a save.
    pub(crate) fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// True while a save is pending or unfinished, which blocks eviction.
    pub(crate) fn has_pending_work(&self) -> bool {
        self.dirty || self.in_flight
    }

    /// Spawns a save of `visible_state` when due. The result arrives back
    /// on `results` so the sequencer stays the single writer of this state.
    pub(crate) fn maybe_spawn_save(
        &mut self,
        name: &str,
        visible_state: Value,
        results: UnboundedSender<SaveOutcome>,
    ) {
        if !self.dirty || self.in_flight {
            return;
        }
        if let Some(last) = self.last_save {
            if last.elapsed() < self.min_interval {
                return;
            }
        }

        self.dirty = false;
        self.in_flight = true;
        let store = self.store.clone();
        let expected = self.version;
        let name = name.to_owned();
        tokio::spawn(async move {
            let outcome = store.save(&name, &visible_state, expected).await;
            // The sequencer may already be gone on shutdown; that is fine.
            let _ = results.send(outcome);
        });
    }

    /// Folds a completed save back in.
    pub(crate) fn complete(&mut self, name: &str, outcome: SaveOutcome) {
        self.in_flight = false;
        self.last_save = Some(Instant::now());
        match outcome {
            Ok(version) => {
                debug!(document = name, version, "document saved");
                self.version = version;
            }
            Err(StoreError::VersionConflict { stored, expected }) => {
                // Adopt the stored token so the retry wins.
                warn!(
                    document = name,
                    stored, expected, "save version conflict; will retry with server state"
                );
                self.version = stored;
                self.dirty = true;
            }
            Err(err) => {
                warn!(document = name, ?err, "save failed; will retry");
                self.dirty = true;
            }
        }
    }

    /// One final synchronous save on document close. Failure is logged and
    /// otherwise ignored; shutdown must not block on a broken store.
    pub(crate) async fn final_save(&mut self, name: &str, visible_state: &Value) {
        if !self.dirty && !self.in_flight {
            return;
        }
        match self.store.save(name, visible_state, self.version).await {
            Ok(version) => {
                self.version = version;
                self.dirty = false;
                debug!(document = name, version, "final save complete");
            }
            Err(StoreError::VersionConflict { stored, .. }) => {
                // One immediate retry with the adopted token.
                match self.store.save(name, visible_state, stored).await {
                    Ok(version) => {
                        self.version = version;
                        self.dirty = false;
                    }
                    Err(err) => warn!(document = name, ?err, "final save failed"),
                }
            }
            Err(err) => warn!(document = name, ?err, "final save failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_store::MemoryDocStore;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn counter(n: i64) -> Value {
        let mut map = std::collections::BTreeMap::new();
        map.insert("count".to_owned(), Value::Int(n));
        Value::Object(map)
    }

    #[tokio::test]
    async fn save_runs_once_marked_dirty_and_due() {
        let store = MemoryDocStore::new();
        let mut save = SaveState::new(Arc::new(store.clone()), 0, Duration::ZERO);
        let (tx, mut rx) = mpsc::unbounded_channel();

        save.mark_dirty();
        save.maybe_spawn_save("room1", counter(1), tx);
        let outcome = rx.recv().await.expect("save outcome");
        save.complete("room1", outcome);

        assert_eq!(store.record("room1").await.unwrap().state, counter(1));
        assert!(!save.has_pending_work());
    }

    #[tokio::test]
    async fn conflict_adopts_stored_version_and_retries() {
        let store = MemoryDocStore::new();
        // Another writer left version 1 behind.
        store.seed("room1", counter(0)).await;
        let mut save = SaveState::new(Arc::new(store.clone()), 0, Duration::ZERO);
        let (tx, mut rx) = mpsc::unbounded_channel();

        save.mark_dirty();
        save.maybe_spawn_save("room1", counter(7), tx.clone());
        let outcome = rx.recv().await.expect("first outcome");
        save.complete("room1", outcome);
        assert!(save.has_pending_work(), "conflict leaves the state dirty");

        // Retry at the next boundary succeeds: server state wins.
        save.maybe_spawn_save("room1", counter(7), tx);
        let outcome = rx.recv().await.expect("second outcome");
        save.complete("room1", outcome);

        let record = store.record("room1").await.unwrap();
        assert_eq!(record.state, counter(7));
        assert_eq!(record.version, 2);
        assert!(!save.has_pending_work());
    }

    #[tokio::test]
    async fn debounce_holds_back_rapid_saves() {
        let store = MemoryDocStore::new();
        let mut save = SaveState::new(Arc::new(store.clone()), 0, Duration::from_secs(3600));
        let (tx, mut rx) = mpsc::unbounded_channel();

        save.mark_dirty();
        save.maybe_spawn_save("room1", counter(1), tx.clone());
        save.complete("room1", rx.recv().await.expect("first save"));

        // Dirty again immediately: inside the debounce window, nothing runs.
        save.mark_dirty();
        save.maybe_spawn_save("room1", counter(2), tx);
        assert!(rx.try_recv().is_err());
        assert_eq!(store.record("room1").await.unwrap().state, counter(1));
    }
}
