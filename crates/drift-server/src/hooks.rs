// SPDX-License-Identifier: Apache-2.0
//! Application hook surface.
//!
//! A [`Hooks`] implementation is how application code rides the hub. Every
//! method has a default, so implementors override only what they need. The
//! document-shaped hooks (`on_create`, `on_hydrate`, `on_update`) run on
//! that document's sequencer task and are never invoked concurrently for
//! the same document. A hook that returns `Err` is logged and swallowed:
//! the tick completes and the broadcast still happens so subscribers do not
//! diverge silently.

use crate::registry::DocRouter;
use drift_core::Value;
use std::collections::BTreeSet;
use std::time::Duration;

/// Immutable session facts handed to session-shaped hooks.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    /// Server-unique session id.
    pub id: u64,
    /// Auth token from Hello, passed through opaquely.
    pub auth_token: Option<String>,
}

/// Per-tick context handed to `on_update`.
///
/// `property_change` records advisory dirty hints. They are hints only:
/// the diff pass is always a full structural diff, so correctness never
/// depends on them, but a future diff implementation may use them to skip
/// untouched subtrees.
#[derive(Debug, Default)]
pub struct TickContext {
    hints: BTreeSet<(String, String)>,
}

impl TickContext {
    /// Marks `(entity_path, property)` as probably-changed this tick.
    pub fn property_change(&mut self, entity_path: &str, property: &str) {
        self.hints.insert((entity_path.to_owned(), property.to_owned()));
    }

    /// Hints recorded so far this tick.
    pub fn hints(&self) -> &BTreeSet<(String, String)> {
        &self.hints
    }

    pub(crate) fn clear(&mut self) {
        self.hints.clear();
    }
}

/// Application callbacks. All defaults are no-ops; `on_create` defaults to
/// an empty object so a hook-less server still serves documents.
pub trait Hooks: Send + Sync + 'static {
    /// Seed state for a document absent from storage.
    fn on_create(&self, name: &str) -> anyhow::Result<Value> {
        let _ = name;
        Ok(Value::empty_object())
    }

    /// Tick period for `name`; `None` takes the server-wide default. Read
    /// once, at document creation.
    fn document_cycle(&self, name: &str) -> Option<Duration> {
        let _ = name;
        None
    }

    /// Adjust state loaded from storage before the first tick. Called
    /// instead of `on_create` when a stored record exists.
    fn on_hydrate(&self, name: &str, state: &mut Value) -> anyhow::Result<()> {
        let _ = (name, state);
        Ok(())
    }

    /// Per-tick simulation step, before the diff. `dt` is wall time since
    /// the previous tick start, clamped to five cycle periods.
    fn on_update(
        &self,
        name: &str,
        state: &mut Value,
        ctx: &mut TickContext,
        dt: Duration,
    ) -> anyhow::Result<()> {
        let _ = (name, state, ctx, dt);
        Ok(())
    }

    /// A session completed its Hello exchange.
    fn on_connect(&self, session: &SessionInfo) {
        let _ = session;
    }

    /// A session closed (any reason). Its subscriptions are already gone.
    fn on_disconnect(&self, session: &SessionInfo) {
        let _ = session;
    }

    /// An application message arrived. Mutations of document state must go
    /// through `docs`, which routes them onto the owning sequencer; they
    /// are visible to `on_update` from the next tick on.
    fn on_message(&self, session: &SessionInfo, payload: Value, docs: &DocRouter) {
        let _ = (session, payload, docs);
    }

    /// Gate for Hello. Rejecting closes the session with `AuthDenied`.
    fn authorize_hello(&self, auth_token: Option<&str>) -> bool {
        let _ = auth_token;
        true
    }

    /// Gate for Subscribe (and SyncRequest). Rejecting refuses only this
    /// subscription; the session stays open.
    fn authorize_subscribe(&self, session: &SessionInfo, document: &str) -> bool {
        let _ = (session, document);
        true
    }
}

/// Hook set with every default: empty documents, no auth, no simulation.
pub struct NoHooks;

impl Hooks for NoHooks {}
