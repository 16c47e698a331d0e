// SPDX-License-Identifier: Apache-2.0
//! Session wire schema for the Drift hub.
//!
//! One logical [`Message`] travels per frame. Two encodings exist, chosen
//! per session during the Hello/Welcome exchange: a JSON form (`t`-tagged
//! objects, patches as RFC 6902 records) and a Fast binary form (one kind
//! byte per frame, patch batches in the `drift-core` codec, control fields
//! in the same varint/TLV primitives). See [`wire`] for the encodings and
//! [`frame`] for the length-prefixed transport framing.

pub mod frame;
pub mod transport;
pub mod wire;

use drift_core::{PatchBatch, Value};
use serde::{Deserialize, Serialize};

/// Wire protocol version carried in Hello/Welcome.
pub const PROTOCOL_VERSION: u16 = 1;

/// Capability identifier: client/server can speak the Fast binary form.
pub const CAP_FAST_PATCH: &str = "fast-patch";
/// Capability identifier: per-batch zlib compression.
pub const CAP_COMPRESSION: &str = "compress";
/// Capability identifier: pull-based full-state reads.
pub const CAP_SYNC: &str = "sync";
/// Capability identifier: peer-to-peer data-channel transport negotiation.
pub const CAP_WEBRTC: &str = "webrtc";

/// Server-unique session identifier.
pub type SessionId = u64;

/// Frame encoding negotiated for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Encoding {
    /// UTF-8 JSON objects with a `t` tag field.
    #[default]
    Json,
    /// Tagged binary layout (kind byte + TLV body).
    FastBinary,
}

/// Why a session was told goodbye.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GoodbyeReason {
    /// Server is draining; no fault of the client.
    Shutdown,
    /// Malformed or out-of-order control message.
    ProtocolError,
    /// Two heartbeat replies missed.
    HeartbeatTimeout,
    /// The auth hook rejected the Hello.
    AuthDenied,
}

/// Why a Subscribe was refused (the session stays open).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The auth hook rejected this (session, document) pair.
    AuthDenied,
    /// The server is at `max_inflight_documents`.
    DocumentLimit,
    /// The document is draining or closed.
    Draining,
}

/// Hello payload (client → server, first frame).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    /// Wire protocol version the client speaks.
    pub protocol_version: u16,
    /// Capability identifiers (e.g. "fast-patch", "compress").
    pub capabilities: Vec<String>,
    /// Opaque token handed to the auth hook.
    pub auth_token: Option<String>,
}

/// Welcome payload (server → client, replies to Hello).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Welcome {
    /// Server-assigned session identifier.
    pub session_id: SessionId,
    /// Capabilities enabled for this session (intersection of client
    /// capabilities and server policy).
    pub capabilities: Vec<String>,
}

/// Wire message kinds, one per frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Client introduction; must be the first frame on a session.
    Hello(Hello),
    /// Server reply to Hello.
    Welcome(Welcome),
    /// Subscribe to a document by name.
    Subscribe {
        /// Document name.
        document: String,
    },
    /// Subscription refused; the session stays open.
    SubscribeRejected {
        /// Document name.
        document: String,
        /// Why.
        reason: RejectReason,
    },
    /// Drop a subscription; no reply is sent.
    Unsubscribe {
        /// Document name.
        document: String,
    },
    /// Snapshot or incremental patch batch for one document.
    Patch(PatchBatch),
    /// One-off full-state read (requires the "sync" capability); answered
    /// with a Snapshot Patch frame without subscribing.
    SyncRequest {
        /// Document name.
        document: String,
    },
    /// Opaque application payload, client → server.
    ClientMessage {
        /// Application-defined body.
        payload: Value,
    },
    /// Opaque application payload, server → client.
    ServerMessage {
        /// Application-defined body.
        payload: Value,
    },
    /// Heartbeat probe.
    Ping {
        /// Echoed back in the matching Pong.
        nonce: u64,
    },
    /// Heartbeat reply.
    Pong {
        /// Nonce from the Ping being answered.
        nonce: u64,
    },
    /// Session termination notice (either direction).
    Goodbye {
        /// Why the session is ending.
        reason: GoodbyeReason,
    },
}

impl Message {
    /// Canonical tag string, used by the JSON form's `t` field.
    pub fn tag(&self) -> &'static str {
        match self {
            Message::Hello(_) => "hello",
            Message::Welcome(_) => "welcome",
            Message::Subscribe { .. } => "subscribe",
            Message::SubscribeRejected { .. } => "subscribe_rejected",
            Message::Unsubscribe { .. } => "unsubscribe",
            Message::Patch(_) => "patch",
            Message::SyncRequest { .. } => "sync_request",
            Message::ClientMessage { .. } => "client_message",
            Message::ServerMessage { .. } => "server_message",
            Message::Ping { .. } => "ping",
            Message::Pong { .. } => "pong",
            Message::Goodbye { .. } => "goodbye",
        }
    }
}
