// SPDX-License-Identifier: Apache-2.0
//! Subscription broker: routes one document's batches into its subscribers'
//! send queues.
//!
//! Cursor discipline: a subscriber's cursor advances speculatively when a
//! batch is enqueued (there are no acks). Incremental batches advance it by
//! exactly one revision; snapshots jump it to the snapshot's revision. A
//! full queue triggers a resync: purge that document's queued batches and
//! enqueue one snapshot of the current state.

use crate::outbound::SendQueue;
use drift_core::{Patch, PatchBatch, Revision, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// One subscriber of one document.
struct Subscriber {
    queue: Arc<SendQueue>,
    cursor: Revision,
    /// False until the subscriber has its baseline snapshot; the next
    /// broadcast pass sends one.
    synced: bool,
}

/// Subscriber table for a single document. Lives inside the document's
/// sequencer, so all access is single-threaded.
#[derive(Default)]
pub(crate) struct Broker {
    subscribers: HashMap<u64, Subscriber>,
}

impl Broker {
    /// Registers a session. With `revision > 0` the baseline snapshot is
    /// sent immediately; a brand-new document (revision 0) leaves the
    /// subscriber unsynced so the first tick's broadcast snapshots it.
    pub(crate) fn subscribe(
        &mut self,
        session_id: u64,
        queue: Arc<SendQueue>,
        document: &str,
        revision: Revision,
        state: &Value,
    ) {
        let mut sub = Subscriber {
            queue,
            cursor: 0,
            synced: false,
        };
        if revision > 0 {
            let snapshot = PatchBatch::snapshot(document, revision, state.visible());
            sub.queue.resync(document, snapshot);
            sub.cursor = revision;
            sub.synced = true;
        }
        self.subscribers.insert(session_id, sub);
    }

    /// Removes a session. No final message is sent.
    pub(crate) fn unsubscribe(&mut self, session_id: u64) {
        self.subscribers.remove(&session_id);
    }

    /// True when nobody is subscribed.
    pub(crate) fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    /// Subscriber count.
    pub(crate) fn len(&self) -> usize {
        self.subscribers.len()
    }

    /// Fans out one completed tick. `revision` is the post-tick revision and
    /// `ops` the diff that produced it (empty when nothing changed).
    pub(crate) fn broadcast(
        &mut self,
        document: &str,
        revision: Revision,
        ops: &[Patch],
        state: &Value,
    ) {
        let mut snapshot: Option<PatchBatch> = None;
        let mut visible: Option<Value> = None;

        for (session_id, sub) in &mut self.subscribers {
            if !sub.synced {
                let batch = snapshot
                    .get_or_insert_with(|| {
                        let state = visible.get_or_insert_with(|| state.visible());
                        PatchBatch::snapshot(document, revision, state.clone())
                    })
                    .clone();
                sub.queue.resync(document, batch);
                sub.cursor = revision;
                sub.synced = true;
                continue;
            }

            if ops.is_empty() {
                continue;
            }

            if sub.cursor + 1 != revision {
                // Cursor drift is an internal inconsistency; recover with a
                // fresh snapshot and leave a loud log.
                warn!(
                    document,
                    session = session_id,
                    cursor = sub.cursor,
                    revision,
                    "cursor out of step; forcing resync"
                );
                Self::force_resync(sub, document, revision, state, &mut snapshot, &mut visible);
                continue;
            }

            let batch = PatchBatch::incremental(document, revision - 1, ops.to_vec());
            match sub.queue.push_patch(batch) {
                Ok(()) => sub.cursor = revision,
                Err(_) => {
                    debug!(
                        document,
                        session = session_id,
                        "send queue full; resyncing subscriber"
                    );
                    Self::force_resync(sub, document, revision, state, &mut snapshot, &mut visible);
                }
            }
        }
    }

    fn force_resync(
        sub: &mut Subscriber,
        document: &str,
        revision: Revision,
        state: &Value,
        snapshot: &mut Option<PatchBatch>,
        visible: &mut Option<Value>,
    ) {
        let batch = snapshot
            .get_or_insert_with(|| {
                let state = visible.get_or_insert_with(|| state.visible());
                PatchBatch::snapshot(document, revision, state.clone())
            })
            .clone();
        sub.queue.resync(document, batch);
        sub.cursor = revision;
        sub.synced = true;
    }

    /// Closes out every subscriber's stream for this document (document
    /// close path). Queues themselves stay open for other documents.
    pub(crate) fn clear(&mut self) {
        self.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outbound::Outbound;
    use drift_core::{BatchKind, PathToken};

    fn state_with(key: &str, n: i64) -> Value {
        let mut map = std::collections::BTreeMap::new();
        map.insert(key.to_owned(), Value::Int(n));
        Value::Object(map)
    }

    fn one_op() -> Vec<Patch> {
        vec![Patch::replace(
            vec![PathToken::Key("count".into())],
            Value::Int(1),
        )]
    }

    #[tokio::test]
    async fn fresh_subscriber_gets_snapshot_on_first_broadcast() {
        let mut broker = Broker::default();
        let queue = SendQueue::new(8);
        broker.subscribe(1, queue.clone(), "doc", 0, &state_with("count", 0));

        broker.broadcast("doc", 1, &one_op(), &state_with("count", 1));

        let Outbound::Patch { batch, .. } = queue.pop().await.unwrap() else {
            panic!("expected patch");
        };
        assert_eq!(batch.kind, BatchKind::Snapshot);
        assert_eq!(batch.new_revision, 1);
    }

    #[tokio::test]
    async fn late_subscriber_gets_immediate_snapshot() {
        let mut broker = Broker::default();
        let queue = SendQueue::new(8);
        broker.subscribe(1, queue.clone(), "doc", 5, &state_with("count", 5));

        let Outbound::Patch { batch, .. } = queue.pop().await.unwrap() else {
            panic!("expected patch");
        };
        assert_eq!(batch.kind, BatchKind::Snapshot);
        assert_eq!(batch.new_revision, 5);
    }

    #[tokio::test]
    async fn synced_subscriber_receives_incrementals_in_revision_order() {
        let mut broker = Broker::default();
        let queue = SendQueue::new(8);
        broker.subscribe(1, queue.clone(), "doc", 1, &state_with("count", 0));
        let _ = queue.pop().await; // baseline snapshot

        broker.broadcast("doc", 2, &one_op(), &state_with("count", 1));
        broker.broadcast("doc", 3, &one_op(), &state_with("count", 2));

        for expected in [2u64, 3] {
            let Outbound::Patch { batch, .. } = queue.pop().await.unwrap() else {
                panic!("expected patch");
            };
            assert_eq!(batch.kind, BatchKind::Incremental);
            assert_eq!(batch.base_revision, expected - 1);
            assert_eq!(batch.new_revision, expected);
        }
    }

    #[tokio::test]
    async fn overflow_turns_into_a_snapshot() {
        let mut broker = Broker::default();
        let queue = SendQueue::new(2);
        broker.subscribe(1, queue.clone(), "doc", 1, &state_with("count", 0));
        let _ = queue.pop().await; // baseline snapshot

        // Two fit, the third overflows and becomes a purge + snapshot.
        for revision in 2..=4 {
            broker.broadcast("doc", revision, &one_op(), &state_with("count", 9));
        }

        let Outbound::Patch { batch, .. } = queue.pop().await.unwrap() else {
            panic!("expected patch");
        };
        assert_eq!(batch.kind, BatchKind::Snapshot);
        assert_eq!(batch.new_revision, 4);
        assert_eq!(queue.patch_len(), 0, "older incrementals were purged");
    }
}
