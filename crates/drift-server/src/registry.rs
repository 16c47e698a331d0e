// SPDX-License-Identifier: Apache-2.0
//! Document registry: lazy name → sequencer map.
//!
//! The registry exclusively owns document handles; sessions keep only
//! `(document name, cursor)` pairs and resolve through here, which is what
//! breaks the session ↔ document reference cycle. Entries whose sequencer
//! has exited (eviction, close) are pruned lazily on access.

use crate::config::ServerConfig;
use crate::doc::{self, DocCommand, DocHandle};
use crate::hooks::Hooks;
use drift_core::Value;
use drift_proto::RejectReason;
use drift_store::DocStore;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

struct Entry {
    handle: DocHandle,
    join: JoinHandle<()>,
}

/// Name → live document map.
pub struct Registry {
    inner: Mutex<HashMap<String, Entry>>,
    hooks: Arc<dyn Hooks>,
    store: Option<Arc<dyn DocStore>>,
    config: Arc<ServerConfig>,
    shutdown: watch::Receiver<bool>,
}

impl Registry {
    pub(crate) fn new(
        hooks: Arc<dyn Hooks>,
        store: Option<Arc<dyn DocStore>>,
        config: Arc<ServerConfig>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(HashMap::new()),
            hooks,
            store,
            config,
            shutdown,
        })
    }

    /// Returns the live document named `name`, creating (and hydrating) it
    /// on first use. Fails only at the document cap.
    pub(crate) fn create_or_get(&self, name: &str) -> Result<DocHandle, RejectReason> {
        if *self.shutdown.borrow() {
            return Err(RejectReason::Draining);
        }
        let mut map = self.lock();
        map.retain(|pruned_name, entry| {
            let live = !entry.handle.is_closed();
            if !live {
                debug!(document = %pruned_name, "pruning closed document");
            }
            live
        });

        if let Some(entry) = map.get(name) {
            return Ok(entry.handle.clone());
        }
        if map.len() >= self.config.max_inflight_documents {
            warn!(document = name, "document cap reached");
            return Err(RejectReason::DocumentLimit);
        }

        let (handle, join) = doc::spawn(
            name,
            self.hooks.clone(),
            self.store.clone(),
            self.config.clone(),
            self.shutdown.clone(),
        );
        map.insert(
            name.to_owned(),
            Entry {
                handle: handle.clone(),
                join,
            },
        );
        Ok(handle)
    }

    /// Live document handle, without creating one.
    pub(crate) fn get(&self, name: &str) -> Option<DocHandle> {
        let map = self.lock();
        map.get(name)
            .filter(|entry| !entry.handle.is_closed())
            .map(|entry| entry.handle.clone())
    }

    /// Live document count.
    pub fn len(&self) -> usize {
        let map = self.lock();
        map.values()
            .filter(|entry| !entry.handle.is_closed())
            .count()
    }

    /// True when no document is live.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every document and waits for the sequencers to drain.
    pub(crate) async fn shutdown(&self) {
        let entries: Vec<Entry> = {
            let mut map = self.lock();
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &entries {
            entry.handle.send(DocCommand::Close);
        }
        for entry in entries {
            let name = entry.handle.name.clone();
            if tokio::time::timeout(std::time::Duration::from_secs(5), entry.join)
                .await
                .is_err()
            {
                warn!(document = %name, "document did not drain in time");
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Mutation router handed to `on_message`.
///
/// Application code cannot touch document state directly from a session's
/// reader task; it schedules closures here and the owning sequencer runs
/// them before its next tick.
pub struct DocRouter {
    registry: Arc<Registry>,
}

impl DocRouter {
    pub(crate) fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Schedules `mutate` onto the sequencer of an existing document. A
    /// mutation for an unknown document is dropped with a debug log: client
    /// messages race document eviction by design.
    pub fn mutate(&self, document: &str, mutate: impl FnOnce(&mut Value) + Send + 'static) {
        match self.registry.get(document) {
            Some(handle) => handle.send(DocCommand::Mutate(Box::new(mutate))),
            None => debug!(document, "mutation for unknown document dropped"),
        }
    }

    /// True when `document` is currently live.
    pub fn exists(&self, document: &str) -> bool {
        self.registry.get(document).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoHooks;

    fn test_registry(max_docs: usize) -> (Arc<Registry>, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let config = Arc::new(ServerConfig {
            max_inflight_documents: max_docs,
            cycle_ms: 20,
            ..ServerConfig::default()
        });
        (
            Registry::new(Arc::new(NoHooks), None, config, rx),
            tx,
        )
    }

    #[tokio::test]
    async fn same_name_returns_same_document() {
        let (registry, _tx) = test_registry(8);
        let a = registry.create_or_get("room1").unwrap();
        let b = registry.create_or_get("room1").unwrap();
        assert_eq!(a.name, b.name);
        assert_eq!(registry.len(), 1);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn cap_rejects_with_document_limit() {
        let (registry, _tx) = test_registry(1);
        registry.create_or_get("a").unwrap();
        let err = registry.create_or_get("b").unwrap_err();
        assert_eq!(err, RejectReason::DocumentLimit);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn draining_registry_rejects_creation() {
        let (registry, tx) = test_registry(8);
        tx.send(true).unwrap();
        let err = registry.create_or_get("a").unwrap_err();
        assert_eq!(err, RejectReason::Draining);
    }

    #[tokio::test]
    async fn shutdown_drains_documents() {
        let (registry, _tx) = test_registry(8);
        registry.create_or_get("a").unwrap();
        registry.create_or_get("b").unwrap();
        registry.shutdown().await;
        assert!(registry.is_empty());
    }
}
