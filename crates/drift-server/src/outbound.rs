// SPDX-License-Identifier: Apache-2.0
//! Per-session outgoing queue.
//!
//! Multiple producers (document sequencers, via the broker) feed one
//! consumer (the session's writer task). The queue is bounded in patch
//! batches; control frames ride along uncounted so heartbeats and goodbyes
//! still flow under patch backpressure.
//!
//! Resync support: each (session, document) pair carries an epoch. A resync
//! purges that document's queued batches, bumps the epoch, and enqueues one
//! fresh snapshot; the writer drops any batch whose epoch is stale by the
//! time it would hit the transport. That keeps the "next batch after a
//! purge is the snapshot" guarantee even for a batch the writer had already
//! dequeued while the transport was stalled.

use drift_core::PatchBatch;
use drift_proto::Message;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// One queued frame.
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Patch batch for a subscribed document, stamped with the epoch it was
    /// enqueued under.
    Patch {
        /// The batch.
        batch: PatchBatch,
        /// Epoch stamp for staleness filtering.
        epoch: u64,
    },
    /// Any non-patch frame.
    Control(Message),
}

/// The patch queue is full; the producer must resync this subscriber.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct QueueFull;

#[derive(Default)]
struct QueueInner {
    items: VecDeque<Outbound>,
    patch_count: usize,
    epochs: HashMap<String, u64>,
    closed: bool,
}

/// Bounded multi-producer single-consumer frame queue.
pub(crate) struct SendQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    capacity: usize,
}

impl SendQueue {
    pub(crate) fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            capacity: capacity.max(1),
        })
    }

    /// Enqueues a batch under the document's current epoch. Fails without
    /// enqueuing when the patch bound is reached.
    pub(crate) fn push_patch(&self, batch: PatchBatch) -> Result<(), QueueFull> {
        let mut inner = self.lock();
        if inner.closed {
            return Ok(());
        }
        if inner.patch_count >= self.capacity {
            return Err(QueueFull);
        }
        let epoch = inner.epochs.get(&batch.document).copied().unwrap_or(0);
        inner.items.push_back(Outbound::Patch { batch, epoch });
        inner.patch_count += 1;
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Purges every queued batch for `document`, bumps its epoch, and
    /// enqueues `snapshot` as the stream's new baseline.
    pub(crate) fn resync(&self, document: &str, snapshot: PatchBatch) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.items.retain(|item| match item {
            Outbound::Patch { batch, .. } if batch.document == document => false,
            _ => true,
        });
        inner.patch_count = inner
            .items
            .iter()
            .filter(|item| matches!(item, Outbound::Patch { .. }))
            .count();
        let epoch = inner.epochs.entry(document.to_owned()).or_insert(0);
        *epoch += 1;
        let epoch = *epoch;
        inner.items.push_back(Outbound::Patch {
            batch: snapshot,
            epoch,
        });
        inner.patch_count += 1;
        drop(inner);
        self.notify.notify_one();
    }

    /// Enqueues a control frame (uncounted).
    pub(crate) fn push_control(&self, msg: Message) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.items.push_back(Outbound::Control(msg));
        drop(inner);
        self.notify.notify_one();
    }

    /// True when `epoch` is still the current epoch for `document`.
    pub(crate) fn epoch_is_current(&self, document: &str, epoch: u64) -> bool {
        self.lock().epochs.get(document).copied().unwrap_or(0) == epoch
    }

    /// Dequeues the next frame; `None` once the queue is closed and empty.
    pub(crate) async fn pop(&self) -> Option<Outbound> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if let Some(item) = inner.items.pop_front() {
                    if matches!(item, Outbound::Patch { .. }) {
                        inner.patch_count -= 1;
                    }
                    return Some(item);
                }
                if inner.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Closes the queue; the writer drains what is left and stops.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Queued patch batches right now (test/metrics hook).
    pub(crate) fn patch_len(&self) -> usize {
        self.lock().patch_count
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        // Producers never hold the lock across await points, so poisoning
        // only happens on a panicking producer; inherit its view.
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_core::Value;

    fn batch(doc: &str, rev: u64) -> PatchBatch {
        PatchBatch::incremental(doc, rev - 1, vec![])
    }

    #[tokio::test]
    async fn pop_returns_frames_in_order() {
        let q = SendQueue::new(8);
        q.push_patch(batch("a", 1)).unwrap();
        q.push_control(Message::Ping { nonce: 1 });
        match q.pop().await.unwrap() {
            Outbound::Patch { batch, .. } => assert_eq!(batch.new_revision, 1),
            other => panic!("expected patch, got {other:?}"),
        }
        assert!(matches!(q.pop().await.unwrap(), Outbound::Control(_)));
    }

    #[tokio::test]
    async fn overflow_reports_full_without_enqueuing() {
        let q = SendQueue::new(2);
        q.push_patch(batch("a", 1)).unwrap();
        q.push_patch(batch("a", 2)).unwrap();
        assert_eq!(q.push_patch(batch("a", 3)), Err(QueueFull));
        assert_eq!(q.patch_len(), 2);
    }

    #[tokio::test]
    async fn resync_purges_only_that_document() {
        let q = SendQueue::new(8);
        q.push_patch(batch("a", 1)).unwrap();
        q.push_patch(batch("b", 1)).unwrap();
        q.push_patch(batch("a", 2)).unwrap();

        q.resync("a", PatchBatch::snapshot("a", 9, Value::empty_object()));

        // b's batch survives; a's stream is just the snapshot.
        let mut docs = Vec::new();
        for _ in 0..2 {
            if let Outbound::Patch { batch, .. } = q.pop().await.unwrap() {
                docs.push((batch.document.clone(), batch.new_revision));
            }
        }
        assert_eq!(docs, vec![("b".to_owned(), 1), ("a".to_owned(), 9)]);
    }

    #[tokio::test]
    async fn resync_invalidates_previously_stamped_epochs() {
        let q = SendQueue::new(8);
        q.push_patch(batch("a", 1)).unwrap();
        let popped = q.pop().await.unwrap();
        let Outbound::Patch { batch: b, epoch } = popped else {
            panic!("expected patch");
        };
        assert!(q.epoch_is_current(&b.document, epoch));
        q.resync("a", PatchBatch::snapshot("a", 5, Value::empty_object()));
        assert!(!q.epoch_is_current(&b.document, epoch));
    }

    #[tokio::test]
    async fn close_wakes_the_consumer() {
        let q = SendQueue::new(8);
        let q2 = q.clone();
        let popper = tokio::spawn(async move { q2.pop().await });
        tokio::task::yield_now().await;
        q.close();
        let item = tokio::time::timeout(std::time::Duration::from_secs(1), popper)
            .await
            .expect("pop returned")
            .unwrap();
        assert!(item.is_none());
    }
}
