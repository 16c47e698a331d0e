// SPDX-License-Identifier: Apache-2.0
//! Document sequencer.
//!
//! Each document is one tokio task owning its state exclusively. Everything
//! that touches the state — queued mutations, hook callbacks, the diff, the
//! broadcast, snapshot synthesis, persistence marking — runs here, which is
//! the whole single-writer discipline. Other tasks talk to a document only
//! through its command channel.
//!
//! Tick sequence: apply queued work → `on_update(dt)` → full diff against
//! the shadow → bump revision when the diff is non-empty → broadcast →
//! shadow swap → persistence mark. `dt` is clamped to five cycle periods;
//! an overrun tick is followed immediately by at most one catch-up tick.

use crate::broker::Broker;
use crate::config::ServerConfig;
use crate::hooks::{Hooks, TickContext};
use crate::outbound::SendQueue;
use crate::persist::{SaveOutcome, SaveState};
use drift_core::{diff, DiffOptions, PatchBatch, Revision, Value};
use drift_store::DocStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A tick running longer than this many cycle periods earns a warning.
const SLOW_TICK_FACTOR: u32 = 10;
/// `dt` is clamped to this many cycle periods.
const MAX_DT_FACTOR: u32 = 5;

/// Mutation scheduled onto the sequencer from outside (client messages).
pub(crate) type Mutation = Box<dyn FnOnce(&mut Value) + Send>;

/// Commands a sequencer accepts.
pub(crate) enum DocCommand {
    /// Register a subscriber.
    Subscribe {
        /// Session id.
        session_id: u64,
        /// The session's send queue.
        queue: Arc<SendQueue>,
    },
    /// Remove a subscriber.
    Unsubscribe {
        /// Session id.
        session_id: u64,
    },
    /// One-off snapshot read without subscribing (`allow_sync`).
    Sync {
        /// Queue to push the snapshot onto.
        queue: Arc<SendQueue>,
    },
    /// Apply an application mutation before the next tick.
    Mutate(Mutation),
    /// Drain and exit.
    Close,
}

/// Cheap handle to a live sequencer.
#[derive(Clone, Debug)]
pub(crate) struct DocHandle {
    pub(crate) name: Arc<str>,
    cmd_tx: mpsc::UnboundedSender<DocCommand>,
}

impl DocHandle {
    /// Sends a command; quietly drops it when the document is gone (the
    /// registry prunes dead handles on next access).
    pub(crate) fn send(&self, cmd: DocCommand) {
        let _ = self.cmd_tx.send(cmd);
    }

    /// True once the sequencer has exited.
    pub(crate) fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }
}

/// Spawns the sequencer for `name` and returns its handle.
pub(crate) fn spawn(
    name: &str,
    hooks: Arc<dyn Hooks>,
    store: Option<Arc<dyn DocStore>>,
    config: Arc<ServerConfig>,
    shutdown: watch::Receiver<bool>,
) -> (DocHandle, tokio::task::JoinHandle<()>) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let handle = DocHandle {
        name: Arc::from(name),
        cmd_tx,
    };
    let task_name = handle.name.clone();
    let join = tokio::spawn(async move {
        run(task_name, hooks, store, config, cmd_rx, shutdown).await;
    });
    (handle, join)
}

struct DocState {
    name: Arc<str>,
    state: Value,
    shadow: Value,
    revision: Revision,
    broker: Broker,
    ctx: TickContext,
    save: Option<SaveState>,
    /// Guards eviction: a just-created document whose first Subscribe is
    /// still in flight must not be evicted as idle.
    had_subscriber: bool,
}

async fn run(
    name: Arc<str>,
    hooks: Arc<dyn Hooks>,
    store: Option<Arc<dyn DocStore>>,
    config: Arc<ServerConfig>,
    mut cmd_rx: mpsc::UnboundedReceiver<DocCommand>,
    mut shutdown: watch::Receiver<bool>,
) {
    // Loading: hydrate from storage, else seed through on_create. Commands
    // arriving meanwhile sit in the channel until the loop starts.
    let store = if config.allow_save { store } else { None };
    let (state, save) = hydrate(&name, hooks.as_ref(), store, &config).await;

    let mut doc = DocState {
        name: name.clone(),
        state,
        // The shadow starts empty so the first tick always broadcasts the
        // seeded state as revision 1.
        shadow: Value::empty_object(),
        revision: 0,
        broker: Broker::default(),
        ctx: TickContext::default(),
        save,
        had_subscriber: false,
    };

    let cycle = hooks.document_cycle(&name).unwrap_or_else(|| config.cycle());
    let (save_tx, mut save_rx) = mpsc::unbounded_channel::<SaveOutcome>();
    let mut last_tick_at = Instant::now();
    let mut next_tick = last_tick_at + cycle;

    info!(document = %name, cycle_ms = cycle.as_millis() as u64, "document running");

    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                if handle_command(&mut doc, cmd, &config) {
                    break;
                }
            }
            outcome = save_rx.recv() => {
                if let (Some(outcome), Some(save)) = (outcome, doc.save.as_mut()) {
                    save.complete(&doc.name, outcome);
                }
                if evictable(&doc, &config) {
                    debug!(document = %doc.name, "no subscribers after save; evicting");
                    break;
                }
            }
            _ = tokio::time::sleep_until(next_tick) => {
                let tick_start = Instant::now();
                let dt = clamp_dt(tick_start - last_tick_at, cycle);
                last_tick_at = tick_start;

                tick(&mut doc, hooks.as_ref(), dt, &save_tx);

                let took = tick_start.elapsed();
                if took > cycle * SLOW_TICK_FACTOR {
                    warn!(document = %doc.name, took_ms = took.as_millis() as u64, "tick is badly over budget");
                }
                // Overrun: start the next tick immediately, but never queue
                // more than one.
                let now = Instant::now();
                next_tick = if now >= next_tick + cycle { now } else { next_tick + cycle };
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }

    // Draining: one final broadcast attempt so subscribers see the terminal
    // state, then the final save.
    tick(&mut doc, hooks.as_ref(), Duration::ZERO, &save_tx);
    if let Some(save) = doc.save.as_mut() {
        save.final_save(&doc.name, &doc.state.visible()).await;
    }
    doc.broker.clear();
    info!(document = %name, revision = doc.revision, "document closed");
}

/// Handles one command; returns true when the document should drain.
fn handle_command(doc: &mut DocState, cmd: DocCommand, config: &ServerConfig) -> bool {
    match cmd {
        DocCommand::Subscribe { session_id, queue } => {
            doc.had_subscriber = true;
            doc.broker
                .subscribe(session_id, queue, &doc.name, doc.revision, &doc.state);
            debug!(document = %doc.name, session = session_id, subscribers = doc.broker.len(), "subscribed");
        }
        DocCommand::Unsubscribe { session_id } => {
            doc.broker.unsubscribe(session_id);
            debug!(document = %doc.name, session = session_id, subscribers = doc.broker.len(), "unsubscribed");
            if evictable(doc, config) {
                debug!(document = %doc.name, "no subscribers; evicting");
                return true;
            }
        }
        DocCommand::Sync { queue } => {
            let snapshot = PatchBatch::snapshot(&*doc.name, doc.revision, doc.state.visible());
            queue.push_control(drift_proto::Message::Patch(snapshot));
        }
        DocCommand::Mutate(mutation) => {
            mutation(&mut doc.state);
        }
        DocCommand::Close => return true,
    }
    false
}

/// Idle documents (no subscribers, no pending persistence work) are evicted
/// unless `keep_alive` holds them open.
fn evictable(doc: &DocState, config: &ServerConfig) -> bool {
    !config.keep_alive
        && doc.had_subscriber
        && doc.broker.is_empty()
        && !doc.save.as_ref().is_some_and(SaveState::has_pending_work)
}

/// One full tick: hooks, diff, broadcast, shadow swap, persistence mark.
fn tick(
    doc: &mut DocState,
    hooks: &dyn Hooks,
    dt: Duration,
    save_tx: &mpsc::UnboundedSender<SaveOutcome>,
) {
    doc.ctx.clear();
    if let Err(err) = hooks.on_update(&doc.name, &mut doc.state, &mut doc.ctx, dt) {
        // Hook failures are swallowed: the broadcast below still runs so
        // subscribers never diverge silently.
        warn!(document = %doc.name, err = %err, "on_update hook failed");
    }

    let ops = diff(&doc.shadow, &doc.state, &DiffOptions::default());
    if !ops.is_empty() {
        doc.revision += 1;
    }

    doc.broker.broadcast(&doc.name, doc.revision, &ops, &doc.state);

    if !ops.is_empty() {
        doc.shadow = doc.state.clone();
        if let Some(save) = doc.save.as_mut() {
            save.mark_dirty();
        }
    }

    if let Some(save) = doc.save.as_mut() {
        save.maybe_spawn_save(&doc.name, doc.state.visible(), save_tx.clone());
    }
}

fn clamp_dt(raw: Duration, cycle: Duration) -> Duration {
    raw.min(cycle * MAX_DT_FACTOR)
}

async fn hydrate(
    name: &str,
    hooks: &dyn Hooks,
    store: Option<Arc<dyn DocStore>>,
    config: &ServerConfig,
) -> (Value, Option<SaveState>) {
    let Some(store) = store else {
        let state = seed(name, hooks);
        return (state, None);
    };

    match store.load(name).await {
        Ok(Some(record)) => {
            let mut state = record.state;
            if let Err(err) = hooks.on_hydrate(name, &mut state) {
                warn!(document = name, err = %err, "on_hydrate hook failed");
            }
            debug!(document = name, version = record.version, "hydrated from store");
            let save = SaveState::new(store, record.version, config.save_min_interval());
            (state, Some(save))
        }
        Ok(None) => {
            let state = seed(name, hooks);
            let save = SaveState::new(store, 0, config.save_min_interval());
            (state, Some(save))
        }
        Err(err) => {
            // A broken store must not take the document down; run without
            // persistence until the next server restart.
            warn!(document = name, ?err, "store load failed; document will not persist");
            (seed(name, hooks), None)
        }
    }
}

fn seed(name: &str, hooks: &dyn Hooks) -> Value {
    match hooks.on_create(name) {
        Ok(state) => state,
        Err(err) => {
            warn!(document = name, err = %err, "on_create hook failed; seeding empty object");
            Value::empty_object()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NoHooks;
    use crate::outbound::Outbound;
    use drift_core::BatchKind;
    use drift_proto::Message;
    use std::collections::BTreeMap;

    struct CounterHooks;

    impl Hooks for CounterHooks {
        fn on_create(&self, _name: &str) -> anyhow::Result<Value> {
            let mut map = BTreeMap::new();
            map.insert("count".to_owned(), Value::Int(0));
            map.insert("_secret".to_owned(), Value::Str("x".into()));
            Ok(Value::Object(map))
        }

        fn on_update(
            &self,
            _name: &str,
            state: &mut Value,
            _ctx: &mut TickContext,
            _dt: Duration,
        ) -> anyhow::Result<()> {
            if let Some(map) = state.as_object_mut() {
                if let Some(Value::Int(n)) = map.get_mut("count") {
                    *n += 1;
                }
            }
            Ok(())
        }
    }

    fn test_config(cycle_ms: u64) -> Arc<ServerConfig> {
        Arc::new(ServerConfig {
            cycle_ms,
            ..ServerConfig::default()
        })
    }

    #[tokio::test]
    async fn first_tick_snapshots_fresh_subscriber_without_private_keys() {
        let (_tx, shutdown) = watch::channel(false);
        let (handle, join) = spawn(
            "room1",
            Arc::new(CounterHooks),
            None,
            test_config(10),
            shutdown,
        );
        let queue = SendQueue::new(16);
        handle.send(DocCommand::Subscribe {
            session_id: 1,
            queue: queue.clone(),
        });

        let Outbound::Patch { batch, .. } =
            tokio::time::timeout(Duration::from_secs(2), queue.pop())
                .await
                .expect("snapshot in time")
                .expect("queue open")
        else {
            panic!("expected patch")
        };
        assert_eq!(batch.kind, BatchKind::Snapshot);
        assert_eq!(batch.new_revision, 1);
        let drift_core::PatchOp::Replace(root) = &batch.ops[0].op else {
            panic!("expected root replace")
        };
        assert!(!root.has_private_keys());

        handle.send(DocCommand::Close);
        let _ = tokio::time::timeout(Duration::from_secs(2), join).await;
    }

    #[tokio::test]
    async fn incrementals_follow_in_revision_order() {
        let (_tx, shutdown) = watch::channel(false);
        let (handle, join) = spawn(
            "room1",
            Arc::new(CounterHooks),
            None,
            test_config(10),
            shutdown,
        );
        let queue = SendQueue::new(16);
        handle.send(DocCommand::Subscribe {
            session_id: 1,
            queue: queue.clone(),
        });

        let mut last = 0u64;
        for _ in 0..4 {
            let item = tokio::time::timeout(Duration::from_secs(2), queue.pop())
                .await
                .expect("batch in time")
                .expect("queue open");
            let Outbound::Patch { batch, .. } = item else {
                panic!("expected patch")
            };
            match batch.kind {
                BatchKind::Snapshot => last = batch.new_revision,
                BatchKind::Incremental => {
                    assert_eq!(batch.base_revision, last);
                    assert_eq!(batch.new_revision, last + 1);
                    last = batch.new_revision;
                }
            }
        }

        handle.send(DocCommand::Close);
        let _ = tokio::time::timeout(Duration::from_secs(2), join).await;
    }

    #[tokio::test]
    async fn mutations_land_before_the_next_tick() {
        let (_tx, shutdown) = watch::channel(false);
        let (handle, join) = spawn(
            "room1",
            Arc::new(NoHooks),
            None,
            test_config(10),
            shutdown,
        );
        let queue = SendQueue::new(16);
        handle.send(DocCommand::Subscribe {
            session_id: 1,
            queue: queue.clone(),
        });
        handle.send(DocCommand::Mutate(Box::new(|state| {
            if let Some(map) = state.as_object_mut() {
                map.insert("set".to_owned(), Value::Bool(true));
            }
        })));

        // First batch is the baseline snapshot; it must already carry the
        // mutation (the command arrived before the first tick).
        let Outbound::Patch { batch, .. } =
            tokio::time::timeout(Duration::from_secs(2), queue.pop())
                .await
                .expect("snapshot in time")
                .expect("queue open")
        else {
            panic!("expected patch")
        };
        let drift_core::PatchOp::Replace(root) = &batch.ops[0].op else {
            panic!("expected root replace")
        };
        assert_eq!(
            root.as_object().and_then(|m| m.get("set")),
            Some(&Value::Bool(true))
        );

        handle.send(DocCommand::Close);
        let _ = tokio::time::timeout(Duration::from_secs(2), join).await;
    }

    #[tokio::test]
    async fn sync_command_pushes_a_control_snapshot() {
        let (_tx, shutdown) = watch::channel(false);
        let (handle, join) = spawn(
            "room1",
            Arc::new(CounterHooks),
            None,
            test_config(10),
            shutdown,
        );
        let queue = SendQueue::new(16);
        handle.send(DocCommand::Sync {
            queue: queue.clone(),
        });

        let item = tokio::time::timeout(Duration::from_secs(2), queue.pop())
            .await
            .expect("snapshot in time")
            .expect("queue open");
        let Outbound::Control(Message::Patch(batch)) = item else {
            panic!("expected control patch")
        };
        assert_eq!(batch.kind, BatchKind::Snapshot);

        handle.send(DocCommand::Close);
        let _ = tokio::time::timeout(Duration::from_secs(2), join).await;
    }

    #[test]
    fn dt_clamps_to_five_cycles() {
        let cycle = Duration::from_millis(100);
        assert_eq!(clamp_dt(Duration::from_millis(40), cycle), Duration::from_millis(40));
        assert_eq!(clamp_dt(Duration::from_secs(60), cycle), Duration::from_millis(500));
    }
}
