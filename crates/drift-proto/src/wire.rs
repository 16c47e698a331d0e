// SPDX-License-Identifier: Apache-2.0
//! Frame payload encodings.
//!
//! JSON form: one UTF-8 JSON object per frame with a `t` tag field; patch
//! frames reuse the RFC 6902-style batch record from `drift-core`.
//!
//! Fast binary form: one kind byte, then the body. Patch frames carry the
//! `drift-core` binary batch codec verbatim; control frames spell their
//! fields with the same varint/length-prefixed primitives.

use crate::{Encoding, GoodbyeReason, Hello, Message, RejectReason, Welcome};
use drift_core::codec::{self, CodecError, EncodeOptions, Reader};
use drift_core::json as batch_json;
use serde_json::json;
use thiserror::Error;

// Binary frame kind tags.
const KIND_HELLO: u8 = 0x01;
const KIND_WELCOME: u8 = 0x02;
const KIND_SUBSCRIBE: u8 = 0x03;
const KIND_SUBSCRIBE_REJECTED: u8 = 0x04;
const KIND_UNSUBSCRIBE: u8 = 0x05;
const KIND_PATCH: u8 = 0x06;
const KIND_SYNC_REQUEST: u8 = 0x07;
const KIND_CLIENT_MESSAGE: u8 = 0x08;
const KIND_SERVER_MESSAGE: u8 = 0x09;
const KIND_PING: u8 = 0x0a;
const KIND_PONG: u8 = 0x0b;
const KIND_GOODBYE: u8 = 0x0c;

/// Failure while encoding or decoding a frame payload.
#[derive(Debug, Error)]
pub enum WireError {
    /// JSON frame was not valid JSON or missing its tag.
    #[error("malformed json frame: {0}")]
    Json(String),
    /// Unknown `t` tag or kind byte.
    #[error("unknown frame kind {0:?}")]
    UnknownKind(String),
    /// Binary body failed to parse.
    #[error("malformed binary frame: {0}")]
    Binary(#[from] CodecError),
    /// Patch body failed to parse in the JSON form.
    #[error("malformed patch frame: {0}")]
    Patch(#[from] drift_core::json::JsonFormError),
    /// An enum discriminant outside its range.
    #[error("bad {what} discriminant {value}")]
    BadDiscriminant {
        /// Which enum.
        what: &'static str,
        /// Offending value.
        value: u64,
    },
}

/// Encodes a message in the given frame encoding. `patch_options` applies
/// to Patch frames in the binary form (compression policy); other frames
/// ignore it.
pub fn encode_message(
    msg: &Message,
    encoding: Encoding,
    patch_options: &EncodeOptions,
) -> Vec<u8> {
    match encoding {
        Encoding::Json => encode_json(msg).into_bytes(),
        Encoding::FastBinary => encode_binary(msg, patch_options),
    }
}

/// Decodes a frame payload in the given encoding.
pub fn decode_message(payload: &[u8], encoding: Encoding) -> Result<Message, WireError> {
    match encoding {
        Encoding::Json => decode_json(payload),
        Encoding::FastBinary => decode_binary(payload),
    }
}

/// Sniffs the encoding of an incoming frame. JSON frames always open with
/// `{`; binary kind tags stay well below it. Receivers sniff rather than
/// track negotiation state, which makes the Hello/Welcome switchover
/// race-free on both sides.
pub fn detect_encoding(payload: &[u8]) -> Encoding {
    match payload.first() {
        Some(b'{') => Encoding::Json,
        _ => Encoding::FastBinary,
    }
}

// --- JSON form ------------------------------------------------------------

fn encode_json(msg: &Message) -> String {
    let value = match msg {
        Message::Hello(hello) => json!({
            "t": "hello",
            "protocol_version": hello.protocol_version,
            "capabilities": hello.capabilities,
            "auth_token": hello.auth_token,
        }),
        Message::Welcome(welcome) => json!({
            "t": "welcome",
            "session_id": welcome.session_id,
            "capabilities": welcome.capabilities,
        }),
        Message::Subscribe { document } => json!({"t": "subscribe", "doc": document}),
        Message::SubscribeRejected { document, reason } => json!({
            "t": "subscribe_rejected",
            "doc": document,
            "reason": reject_reason_str(*reason),
        }),
        Message::Unsubscribe { document } => json!({"t": "unsubscribe", "doc": document}),
        Message::Patch(batch) => {
            let mut value = batch_json::to_value(batch);
            if let Some(map) = value.as_object_mut() {
                map.insert("t".to_owned(), json!("patch"));
            }
            value
        }
        Message::SyncRequest { document } => json!({"t": "sync_request", "doc": document}),
        Message::ClientMessage { payload } => json!({"t": "client_message", "payload": payload}),
        Message::ServerMessage { payload } => json!({"t": "server_message", "payload": payload}),
        Message::Ping { nonce } => json!({"t": "ping", "nonce": nonce}),
        Message::Pong { nonce } => json!({"t": "pong", "nonce": nonce}),
        Message::Goodbye { reason } => json!({
            "t": "goodbye",
            "reason": goodbye_reason_str(*reason),
        }),
    };
    value.to_string()
}

fn decode_json(payload: &[u8]) -> Result<Message, WireError> {
    let text = std::str::from_utf8(payload).map_err(|err| WireError::Json(err.to_string()))?;
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|err| WireError::Json(err.to_string()))?;
    let tag = value
        .get("t")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| WireError::Json("missing t field".into()))?
        .to_owned();

    match tag.as_str() {
        "hello" => {
            let capabilities = value
                .get("capabilities")
                .and_then(serde_json::Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(serde_json::Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default();
            let auth_token = value
                .get("auth_token")
                .and_then(serde_json::Value::as_str)
                .map(str::to_owned);
            let protocol_version = u64_field(&value, "protocol_version")? as u16;
            Ok(Message::Hello(Hello {
                protocol_version,
                capabilities,
                auth_token,
            }))
        }
        "welcome" => {
            let capabilities = value
                .get("capabilities")
                .and_then(serde_json::Value::as_array)
                .map(|items| {
                    items
                        .iter()
                        .filter_map(serde_json::Value::as_str)
                        .map(str::to_owned)
                        .collect()
                })
                .unwrap_or_default();
            Ok(Message::Welcome(Welcome {
                session_id: u64_field(&value, "session_id")?,
                capabilities,
            }))
        }
        "subscribe" => Ok(Message::Subscribe {
            document: str_field(&value, "doc")?,
        }),
        "subscribe_rejected" => Ok(Message::SubscribeRejected {
            document: str_field(&value, "doc")?,
            reason: parse_reject_reason(&str_field(&value, "reason")?)?,
        }),
        "unsubscribe" => Ok(Message::Unsubscribe {
            document: str_field(&value, "doc")?,
        }),
        "patch" => Ok(Message::Patch(batch_json::from_value(value)?)),
        "sync_request" => Ok(Message::SyncRequest {
            document: str_field(&value, "doc")?,
        }),
        "client_message" => Ok(Message::ClientMessage {
            payload: parse_payload(&value)?,
        }),
        "server_message" => Ok(Message::ServerMessage {
            payload: parse_payload(&value)?,
        }),
        "ping" => Ok(Message::Ping {
            nonce: u64_field(&value, "nonce")?,
        }),
        "pong" => Ok(Message::Pong {
            nonce: u64_field(&value, "nonce")?,
        }),
        "goodbye" => Ok(Message::Goodbye {
            reason: parse_goodbye_reason(&str_field(&value, "reason")?)?,
        }),
        other => Err(WireError::UnknownKind(other.to_owned())),
    }
}

fn str_field(value: &serde_json::Value, name: &str) -> Result<String, WireError> {
    value
        .get(name)
        .and_then(serde_json::Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| WireError::Json(format!("missing {name} field")))
}

fn u64_field(value: &serde_json::Value, name: &str) -> Result<u64, WireError> {
    value
        .get(name)
        .and_then(serde_json::Value::as_u64)
        .ok_or_else(|| WireError::Json(format!("missing {name} field")))
}

fn parse_payload(value: &serde_json::Value) -> Result<drift_core::Value, WireError> {
    let payload = value
        .get("payload")
        .ok_or_else(|| WireError::Json("missing payload field".into()))?;
    serde_json::from_value(payload.clone()).map_err(|err| WireError::Json(err.to_string()))
}

fn goodbye_reason_str(reason: GoodbyeReason) -> &'static str {
    match reason {
        GoodbyeReason::Shutdown => "shutdown",
        GoodbyeReason::ProtocolError => "protocol_error",
        GoodbyeReason::HeartbeatTimeout => "heartbeat_timeout",
        GoodbyeReason::AuthDenied => "auth_denied",
    }
}

fn parse_goodbye_reason(text: &str) -> Result<GoodbyeReason, WireError> {
    match text {
        "shutdown" => Ok(GoodbyeReason::Shutdown),
        "protocol_error" => Ok(GoodbyeReason::ProtocolError),
        "heartbeat_timeout" => Ok(GoodbyeReason::HeartbeatTimeout),
        "auth_denied" => Ok(GoodbyeReason::AuthDenied),
        other => Err(WireError::UnknownKind(other.to_owned())),
    }
}

fn reject_reason_str(reason: RejectReason) -> &'static str {
    match reason {
        RejectReason::AuthDenied => "auth_denied",
        RejectReason::DocumentLimit => "document_limit",
        RejectReason::Draining => "draining",
    }
}

fn parse_reject_reason(text: &str) -> Result<RejectReason, WireError> {
    match text {
        "auth_denied" => Ok(RejectReason::AuthDenied),
        "document_limit" => Ok(RejectReason::DocumentLimit),
        "draining" => Ok(RejectReason::Draining),
        other => Err(WireError::UnknownKind(other.to_owned())),
    }
}

// --- Fast binary form -----------------------------------------------------

fn encode_binary(msg: &Message, patch_options: &EncodeOptions) -> Vec<u8> {
    let mut out = Vec::with_capacity(32);
    match msg {
        Message::Hello(hello) => {
            out.push(KIND_HELLO);
            codec::write_uvarint(u64::from(hello.protocol_version), &mut out);
            write_str_list(&hello.capabilities, &mut out);
            match &hello.auth_token {
                Some(token) => {
                    out.push(1);
                    codec::write_str(token, &mut out);
                }
                None => out.push(0),
            }
        }
        Message::Welcome(welcome) => {
            out.push(KIND_WELCOME);
            codec::write_uvarint(welcome.session_id, &mut out);
            write_str_list(&welcome.capabilities, &mut out);
        }
        Message::Subscribe { document } => {
            out.push(KIND_SUBSCRIBE);
            codec::write_str(document, &mut out);
        }
        Message::SubscribeRejected { document, reason } => {
            out.push(KIND_SUBSCRIBE_REJECTED);
            codec::write_str(document, &mut out);
            out.push(*reason as u8);
        }
        Message::Unsubscribe { document } => {
            out.push(KIND_UNSUBSCRIBE);
            codec::write_str(document, &mut out);
        }
        Message::Patch(batch) => {
            out.push(KIND_PATCH);
            out.extend_from_slice(&codec::encode(batch, patch_options));
        }
        Message::SyncRequest { document } => {
            out.push(KIND_SYNC_REQUEST);
            codec::write_str(document, &mut out);
        }
        Message::ClientMessage { payload } => {
            out.push(KIND_CLIENT_MESSAGE);
            codec::write_value(payload, &mut out);
        }
        Message::ServerMessage { payload } => {
            out.push(KIND_SERVER_MESSAGE);
            codec::write_value(payload, &mut out);
        }
        Message::Ping { nonce } => {
            out.push(KIND_PING);
            codec::write_uvarint(*nonce, &mut out);
        }
        Message::Pong { nonce } => {
            out.push(KIND_PONG);
            codec::write_uvarint(*nonce, &mut out);
        }
        Message::Goodbye { reason } => {
            out.push(KIND_GOODBYE);
            out.push(*reason as u8);
        }
    }
    out
}

fn decode_binary(payload: &[u8]) -> Result<Message, WireError> {
    let (&kind, body) = payload
        .split_first()
        .ok_or(WireError::Binary(CodecError::Incomplete))?;
    if kind == KIND_PATCH {
        return Ok(Message::Patch(codec::decode(body)?));
    }

    let mut reader = Reader::new(body);
    let msg = match kind {
        KIND_HELLO => {
            let protocol_version = reader.take_uvarint()? as u16;
            let capabilities = take_str_list(&mut reader)?;
            let auth_token = if reader.take_u8()? != 0 {
                Some(reader.take_str()?)
            } else {
                None
            };
            Message::Hello(Hello {
                protocol_version,
                capabilities,
                auth_token,
            })
        }
        KIND_WELCOME => Message::Welcome(Welcome {
            session_id: reader.take_uvarint()?,
            capabilities: take_str_list(&mut reader)?,
        }),
        KIND_SUBSCRIBE => Message::Subscribe {
            document: reader.take_str()?,
        },
        KIND_SUBSCRIBE_REJECTED => Message::SubscribeRejected {
            document: reader.take_str()?,
            reason: reject_reason_from(reader.take_u8()?)?,
        },
        KIND_UNSUBSCRIBE => Message::Unsubscribe {
            document: reader.take_str()?,
        },
        KIND_SYNC_REQUEST => Message::SyncRequest {
            document: reader.take_str()?,
        },
        KIND_CLIENT_MESSAGE => Message::ClientMessage {
            payload: reader.take_value()?,
        },
        KIND_SERVER_MESSAGE => Message::ServerMessage {
            payload: reader.take_value()?,
        },
        KIND_PING => Message::Ping {
            nonce: reader.take_uvarint()?,
        },
        KIND_PONG => Message::Pong {
            nonce: reader.take_uvarint()?,
        },
        KIND_GOODBYE => Message::Goodbye {
            reason: goodbye_reason_from(reader.take_u8()?)?,
        },
        other => return Err(WireError::UnknownKind(format!("{other:#04x}"))),
    };
    if !reader.is_empty() {
        return Err(WireError::Binary(CodecError::Trailing));
    }
    Ok(msg)
}

fn write_str_list(items: &[String], out: &mut Vec<u8>) {
    codec::write_uvarint(items.len() as u64, out);
    for item in items {
        codec::write_str(item, out);
    }
}

fn take_str_list(reader: &mut Reader<'_>) -> Result<Vec<String>, WireError> {
    let count = reader.take_uvarint()?;
    let mut items = Vec::with_capacity(count.min(64) as usize);
    for _ in 0..count {
        items.push(reader.take_str()?);
    }
    Ok(items)
}

fn goodbye_reason_from(value: u8) -> Result<GoodbyeReason, WireError> {
    match value {
        0 => Ok(GoodbyeReason::Shutdown),
        1 => Ok(GoodbyeReason::ProtocolError),
        2 => Ok(GoodbyeReason::HeartbeatTimeout),
        3 => Ok(GoodbyeReason::AuthDenied),
        other => Err(WireError::BadDiscriminant {
            what: "goodbye reason",
            value: u64::from(other),
        }),
    }
}

fn reject_reason_from(value: u8) -> Result<RejectReason, WireError> {
    match value {
        0 => Ok(RejectReason::AuthDenied),
        1 => Ok(RejectReason::DocumentLimit),
        2 => Ok(RejectReason::Draining),
        other => Err(WireError::BadDiscriminant {
            what: "reject reason",
            value: u64::from(other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drift_core::{PatchBatch, Value};

    fn messages() -> Vec<Message> {
        vec![
            Message::Hello(Hello {
                protocol_version: crate::PROTOCOL_VERSION,
                capabilities: vec![crate::CAP_FAST_PATCH.into(), crate::CAP_COMPRESSION.into()],
                auth_token: Some("tok".into()),
            }),
            Message::Hello(Hello {
                protocol_version: crate::PROTOCOL_VERSION,
                capabilities: vec![],
                auth_token: None,
            }),
            Message::Welcome(Welcome {
                session_id: 7,
                capabilities: vec![crate::CAP_FAST_PATCH.into()],
            }),
            Message::Subscribe {
                document: "room1".into(),
            },
            Message::SubscribeRejected {
                document: "room1".into(),
                reason: RejectReason::AuthDenied,
            },
            Message::Unsubscribe {
                document: "room1".into(),
            },
            Message::Patch(PatchBatch::snapshot("room1", 3, Value::empty_object())),
            Message::SyncRequest {
                document: "room1".into(),
            },
            Message::ClientMessage {
                payload: Value::Str("hi".into()),
            },
            Message::ServerMessage {
                payload: Value::Int(-3),
            },
            Message::Ping { nonce: 99 },
            Message::Pong { nonce: 99 },
            Message::Goodbye {
                reason: GoodbyeReason::HeartbeatTimeout,
            },
        ]
    }

    #[test]
    fn json_form_round_trips_every_kind() {
        for msg in messages() {
            let bytes = encode_message(&msg, Encoding::Json, &EncodeOptions::default());
            let back = decode_message(&bytes, Encoding::Json).expect("decode json");
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn binary_form_round_trips_every_kind() {
        for msg in messages() {
            let bytes = encode_message(&msg, Encoding::FastBinary, &EncodeOptions::default());
            let back = decode_message(&bytes, Encoding::FastBinary).expect("decode binary");
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn json_frames_carry_the_tag_field() {
        let msg = Message::Ping { nonce: 1 };
        let bytes = encode_message(&msg, Encoding::Json, &EncodeOptions::default());
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(value["t"], "ping");
        assert_eq!(value["t"], msg.tag());
    }

    #[test]
    fn sniffing_separates_the_two_forms() {
        for msg in messages() {
            let json = encode_message(&msg, Encoding::Json, &EncodeOptions::default());
            assert_eq!(detect_encoding(&json), Encoding::Json);
            let binary = encode_message(&msg, Encoding::FastBinary, &EncodeOptions::default());
            assert_eq!(detect_encoding(&binary), Encoding::FastBinary);
        }
    }

    #[test]
    fn unknown_json_tag_is_rejected() {
        let err = decode_message(br#"{"t":"warp"}"#, Encoding::Json).unwrap_err();
        assert!(matches!(err, WireError::UnknownKind(_)));
    }

    #[test]
    fn unknown_binary_kind_is_rejected() {
        let err = decode_message(&[0x7f], Encoding::FastBinary).unwrap_err();
        assert!(matches!(err, WireError::UnknownKind(_)));
    }

    #[test]
    fn trailing_binary_bytes_are_rejected() {
        let mut bytes =
            encode_message(&Message::Ping { nonce: 1 }, Encoding::FastBinary, &EncodeOptions::default());
        bytes.push(0);
        let err = decode_message(&bytes, Encoding::FastBinary).unwrap_err();
        assert!(matches!(err, WireError::Binary(CodecError::Trailing)));
    }

    #[test]
    fn empty_frame_is_rejected() {
        assert!(decode_message(&[], Encoding::FastBinary).is_err());
        assert!(decode_message(&[], Encoding::Json).is_err());
    }
}
