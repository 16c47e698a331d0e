// SPDX-License-Identifier: Apache-2.0
//! One session per connected client.
//!
//! Three tasks cooperate: the reader (runs inline here, decodes frames and
//! dispatches), the writer (drains the send queue onto the transport), and
//! the heartbeat pinger. The first frame must be Hello; everything else
//! before it is a protocol error. Frame encodings are sniffed on receive
//! and chosen by negotiation on send.

use crate::config::ServerConfig;
use crate::doc::DocCommand;
use crate::hooks::{Hooks, SessionInfo};
use crate::outbound::{Outbound, SendQueue};
use crate::registry::{DocRouter, Registry};
use drift_proto::transport::{BoxedReader, BoxedWriter};
use drift_core::codec::EncodeOptions;
use drift_proto::{
    wire, Encoding, GoodbyeReason, Hello, Message, RejectReason, Welcome, CAP_COMPRESSION,
    CAP_FAST_PATCH, CAP_SYNC, CAP_WEBRTC, PROTOCOL_VERSION,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Two unanswered pings close the session.
const MAX_MISSED_PONGS: u32 = 2;

/// Negotiated per-session wire settings, fixed at Hello.
#[derive(Debug, Clone, Copy)]
struct Wire {
    encoding: Encoding,
    compression: bool,
    sync: bool,
}

impl Default for Wire {
    fn default() -> Self {
        // Pre-Hello frames (a Goodbye for a failed handshake) go out as
        // JSON, which every client can read.
        Self {
            encoding: Encoding::Json,
            compression: false,
            sync: false,
        }
    }
}

#[derive(Debug, Default)]
struct Heartbeat {
    outstanding: u32,
    nonce: u64,
    sent_at: Option<Instant>,
    rtt: Option<Duration>,
}

struct SessionState {
    id: u64,
    info: Option<SessionInfo>,
    subscriptions: HashSet<String>,
}

/// How the session ended; decides the Goodbye frame.
enum End {
    PeerGoodbye,
    Eof,
    Transport,
    Protocol(GoodbyeReason),
    HeartbeatTimeout,
    Shutdown,
}

enum Flow {
    Continue,
    Stop,
}

/// Drives one session to completion.
#[allow(clippy::too_many_lines)]
pub(crate) async fn run(
    id: u64,
    mut reader: BoxedReader,
    writer: BoxedWriter,
    registry: Arc<Registry>,
    hooks: Arc<dyn Hooks>,
    config: Arc<ServerConfig>,
    mut shutdown: watch::Receiver<bool>,
) {
    let queue = SendQueue::new(config.send_queue_capacity);
    let settings: Arc<OnceLock<Wire>> = Arc::new(OnceLock::new());
    let heartbeat = Arc::new(Mutex::new(Heartbeat::default()));
    let router = DocRouter::new(registry.clone());

    let mut writer_task = tokio::spawn(writer_loop(
        writer,
        queue.clone(),
        settings.clone(),
        config.clone(),
    ));
    let mut heartbeat_task = tokio::spawn(heartbeat_loop(
        queue.clone(),
        heartbeat.clone(),
        config.heartbeat(),
    ));

    let mut session = SessionState {
        id,
        info: None,
        subscriptions: HashSet::new(),
    };

    let end = loop {
        tokio::select! {
            frame = reader.recv() => match frame {
                Ok(Some(payload)) => {
                    let outcome = handle_frame(
                        &payload,
                        &mut session,
                        &queue,
                        &settings,
                        &heartbeat,
                        &registry,
                        hooks.as_ref(),
                        &router,
                        &config,
                    );
                    match outcome {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Stop) => break End::PeerGoodbye,
                        Err(reason) => break End::Protocol(reason),
                    }
                }
                Ok(None) => break End::Eof,
                Err(err) => {
                    debug!(session = id, ?err, "transport error");
                    break End::Transport;
                }
            },
            _ = &mut heartbeat_task => break End::HeartbeatTimeout,
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break End::Shutdown;
                }
            }
        }
    };

    let goodbye = match &end {
        End::Protocol(reason) => Some(*reason),
        End::HeartbeatTimeout => Some(GoodbyeReason::HeartbeatTimeout),
        End::Shutdown => Some(GoodbyeReason::Shutdown),
        End::PeerGoodbye | End::Eof | End::Transport => None,
    };
    if let Some(reason) = goodbye {
        queue.push_control(Message::Goodbye { reason });
    }

    // Remove this session from every document it watched. Errors in one
    // session must never touch the documents beyond this cleanup.
    for document in &session.subscriptions {
        if let Some(handle) = registry.get(document) {
            handle.send(DocCommand::Unsubscribe { session_id: id });
        }
    }
    if let Some(info) = &session.info {
        hooks.on_disconnect(info);
    }

    // Let the writer flush the Goodbye, then stop everything.
    queue.close();
    if tokio::time::timeout(Duration::from_secs(1), &mut writer_task)
        .await
        .is_err()
    {
        writer_task.abort();
    }
    heartbeat_task.abort();

    let rtt_ms = heartbeat
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .rtt
        .map(|rtt| rtt.as_millis() as u64);
    info!(session = id, rtt_ms, "session closed");
}

#[allow(clippy::too_many_arguments)]
fn handle_frame(
    payload: &[u8],
    session: &mut SessionState,
    queue: &Arc<SendQueue>,
    settings: &OnceLock<Wire>,
    heartbeat: &Mutex<Heartbeat>,
    registry: &Arc<Registry>,
    hooks: &dyn Hooks,
    router: &DocRouter,
    config: &ServerConfig,
) -> Result<Flow, GoodbyeReason> {
    let encoding = wire::detect_encoding(payload);
    let msg = wire::decode_message(payload, encoding).map_err(|err| {
        warn!(session = session.id, %err, "undecodable frame");
        GoodbyeReason::ProtocolError
    })?;

    let Some(info) = session.info.clone() else {
        // Pre-Hello: only Hello is legal.
        return match msg {
            Message::Hello(hello) => handle_hello(hello, encoding, session, queue, settings, hooks, config),
            other => {
                warn!(session = session.id, kind = other.tag(), "frame before hello");
                Err(GoodbyeReason::ProtocolError)
            }
        };
    };

    match msg {
        Message::Hello(_) => {
            warn!(session = session.id, "duplicate hello");
            Err(GoodbyeReason::ProtocolError)
        }
        Message::Subscribe { document } => {
            if !hooks.authorize_subscribe(&info, &document) {
                queue.push_control(Message::SubscribeRejected {
                    document,
                    reason: RejectReason::AuthDenied,
                });
                return Ok(Flow::Continue);
            }
            match registry.create_or_get(&document) {
                Ok(handle) => {
                    handle.send(DocCommand::Subscribe {
                        session_id: session.id,
                        queue: queue.clone(),
                    });
                    session.subscriptions.insert(document);
                }
                Err(reason) => {
                    queue.push_control(Message::SubscribeRejected { document, reason });
                }
            }
            Ok(Flow::Continue)
        }
        Message::Unsubscribe { document } => {
            if session.subscriptions.remove(&document) {
                if let Some(handle) = registry.get(&document) {
                    handle.send(DocCommand::Unsubscribe {
                        session_id: session.id,
                    });
                }
            }
            Ok(Flow::Continue)
        }
        Message::SyncRequest { document } => {
            let wire = settings.get().copied().unwrap_or_default();
            if !wire.sync {
                queue.push_control(Message::SubscribeRejected {
                    document,
                    reason: RejectReason::AuthDenied,
                });
                return Ok(Flow::Continue);
            }
            if !hooks.authorize_subscribe(&info, &document) {
                queue.push_control(Message::SubscribeRejected {
                    document,
                    reason: RejectReason::AuthDenied,
                });
                return Ok(Flow::Continue);
            }
            match registry.create_or_get(&document) {
                Ok(handle) => handle.send(DocCommand::Sync {
                    queue: queue.clone(),
                }),
                Err(reason) => {
                    queue.push_control(Message::SubscribeRejected { document, reason });
                }
            }
            Ok(Flow::Continue)
        }
        Message::ClientMessage { payload } => {
            hooks.on_message(&info, payload, router);
            Ok(Flow::Continue)
        }
        Message::Ping { nonce } => {
            queue.push_control(Message::Pong { nonce });
            Ok(Flow::Continue)
        }
        Message::Pong { nonce } => {
            let mut hb = heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
            if hb.nonce == nonce {
                hb.outstanding = 0;
                if let Some(sent_at) = hb.sent_at {
                    hb.rtt = Some(sent_at.elapsed());
                }
            }
            Ok(Flow::Continue)
        }
        Message::Goodbye { .. } => Ok(Flow::Stop),
        Message::Welcome(_) | Message::SubscribeRejected { .. } | Message::ServerMessage { .. }
        | Message::Patch(_) => {
            warn!(session = session.id, "client sent a server-only frame");
            Err(GoodbyeReason::ProtocolError)
        }
    }
}

fn handle_hello(
    hello: Hello,
    arrival: Encoding,
    session: &mut SessionState,
    queue: &Arc<SendQueue>,
    settings: &OnceLock<Wire>,
    hooks: &dyn Hooks,
    config: &ServerConfig,
) -> Result<Flow, GoodbyeReason> {
    if hello.protocol_version != PROTOCOL_VERSION {
        warn!(
            session = session.id,
            theirs = hello.protocol_version,
            ours = PROTOCOL_VERSION,
            "protocol version mismatch"
        );
        return Err(GoodbyeReason::ProtocolError);
    }
    if !hooks.authorize_hello(hello.auth_token.as_deref()) {
        return Err(GoodbyeReason::AuthDenied);
    }

    let offered = |cap: &str| hello.capabilities.iter().any(|c| c == cap);
    let mut granted = Vec::new();
    if config.allow_fast_patch && offered(CAP_FAST_PATCH) {
        granted.push(CAP_FAST_PATCH.to_owned());
    }
    if config.allow_compression && offered(CAP_COMPRESSION) {
        granted.push(CAP_COMPRESSION.to_owned());
    }
    if config.allow_sync && offered(CAP_SYNC) {
        granted.push(CAP_SYNC.to_owned());
    }
    if config.allow_webrtc && offered(CAP_WEBRTC) {
        granted.push(CAP_WEBRTC.to_owned());
    }

    let fast = granted.iter().any(|c| c == CAP_FAST_PATCH);
    let wire = Wire {
        encoding: if fast { Encoding::FastBinary } else { arrival },
        compression: fast && granted.iter().any(|c| c == CAP_COMPRESSION),
        sync: granted.iter().any(|c| c == CAP_SYNC),
    };
    let _ = settings.set(wire);

    let info = SessionInfo {
        id: session.id,
        auth_token: hello.auth_token,
    };
    hooks.on_connect(&info);
    session.info = Some(info);

    queue.push_control(Message::Welcome(Welcome {
        session_id: session.id,
        capabilities: granted,
    }));
    debug!(session = session.id, ?wire, "hello complete");
    Ok(Flow::Continue)
}

async fn writer_loop(
    mut writer: BoxedWriter,
    queue: Arc<SendQueue>,
    settings: Arc<OnceLock<Wire>>,
    config: Arc<ServerConfig>,
) {
    let mut batches_sent: u64 = 0;
    let mut bytes_sent: u64 = 0;
    while let Some(item) = queue.pop().await {
        // Wait for the transport before committing to the frame: a batch
        // made stale by a resync while we waited must be dropped, not sent.
        writer.ready().await;
        let msg = match item {
            Outbound::Patch { batch, epoch } => {
                if !queue.epoch_is_current(&batch.document, epoch) {
                    continue;
                }
                batches_sent += 1;
                Message::Patch(batch)
            }
            Outbound::Control(msg) => msg,
        };
        if config.simulate_latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(config.simulate_latency_ms)).await;
        }
        let wire = settings.get().copied().unwrap_or_default();
        let options = EncodeOptions {
            allow_compression: wire.compression,
            compress_min: config.compress_min,
        };
        let bytes = wire::encode_message(&msg, wire.encoding, &options);
        if writer.send(&bytes).await.is_err() {
            break;
        }
        bytes_sent += bytes.len() as u64;
    }
    debug!(batches_sent, bytes_sent, "session writer finished");
}

/// Pings on a fixed interval; returns (ending the session) once
/// [`MAX_MISSED_PONGS`] pings go unanswered.
async fn heartbeat_loop(queue: Arc<SendQueue>, heartbeat: Arc<Mutex<Heartbeat>>, period: Duration) {
    let mut ticker = tokio::time::interval(period.max(Duration::from_millis(1)));
    // interval() fires immediately; skip that so the client gets a grace
    // period after the handshake.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let nonce = {
            let mut hb = heartbeat.lock().unwrap_or_else(PoisonError::into_inner);
            if hb.outstanding >= MAX_MISSED_PONGS {
                return;
            }
            hb.outstanding += 1;
            hb.nonce += 1;
            hb.sent_at = Some(Instant::now());
            hb.nonce
        };
        queue.push_control(Message::Ping { nonce });
    }
}
