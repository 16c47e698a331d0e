// SPDX-License-Identifier: Apache-2.0
//! JSON form of a [`PatchBatch`]: RFC 6902-flavoured op records with
//! `/`-joined pointer paths, wrapped in a batch object.
//!
//! ```json
//! {"doc":"room1","base":1,"rev":2,"kind":"incremental",
//!  "ops":[{"op":"replace","path":"/count","value":1}]}
//! ```

use crate::patch::{parse_pointer, render_pointer, BatchKind, Patch, PatchOp};
use crate::value::Value;
use crate::PatchBatch;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure while reading the JSON form.
#[derive(Debug, Error)]
pub enum JsonFormError {
    /// Not valid JSON, or not the batch shape.
    #[error("malformed batch json: {0}")]
    Malformed(#[from] serde_json::Error),
    /// `op` was not one of add/replace/remove, or value presence mismatched.
    #[error("bad op record: {0}")]
    BadOp(&'static str),
    /// `path` was not a valid JSON pointer.
    #[error("bad pointer: {0}")]
    BadPointer(String),
    /// `kind` was not snapshot/incremental.
    #[error("bad batch kind: {0}")]
    BadKind(String),
}

#[derive(Serialize, Deserialize)]
struct OpRecord {
    op: String,
    path: String,
    // `value: null` must stay distinct from an absent `value` (a Replace can
    // legitimately carry JSON null), so presence maps to `Some` explicitly.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    value: Option<Value>,
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

#[derive(Serialize, Deserialize)]
struct BatchRecord {
    doc: String,
    base: u64,
    rev: u64,
    kind: String,
    ops: Vec<OpRecord>,
}

/// Serializes a batch to its JSON text form.
pub fn encode(batch: &PatchBatch) -> String {
    // BatchRecord has no map keys that can fail to serialize.
    serde_json::to_string(&to_record(batch)).unwrap_or_default()
}

/// Batch as a `serde_json::Value`, for callers that embed it in a larger
/// JSON frame.
pub fn to_value(batch: &PatchBatch) -> serde_json::Value {
    serde_json::to_value(to_record(batch)).unwrap_or_default()
}

/// Parses a batch out of a `serde_json::Value` in the wire shape.
pub fn from_value(value: serde_json::Value) -> Result<PatchBatch, JsonFormError> {
    from_record(serde_json::from_value(value)?)
}

fn to_record(batch: &PatchBatch) -> BatchRecord {
    BatchRecord {
        doc: batch.document.clone(),
        base: batch.base_revision,
        rev: batch.new_revision,
        kind: match batch.kind {
            BatchKind::Snapshot => "snapshot".to_owned(),
            BatchKind::Incremental => "incremental".to_owned(),
        },
        ops: batch
            .ops
            .iter()
            .map(|patch| {
                let (op, value) = match &patch.op {
                    PatchOp::Add(v) => ("add", Some(v.clone())),
                    PatchOp::Replace(v) => ("replace", Some(v.clone())),
                    PatchOp::Remove => ("remove", None),
                };
                OpRecord {
                    op: op.to_owned(),
                    path: render_pointer(&patch.path),
                    value,
                }
            })
            .collect(),
    }
}

/// Parses a batch from its JSON text form.
pub fn decode(text: &str) -> Result<PatchBatch, JsonFormError> {
    from_record(serde_json::from_str(text)?)
}

fn from_record(record: BatchRecord) -> Result<PatchBatch, JsonFormError> {
    let kind = match record.kind.as_str() {
        "snapshot" => BatchKind::Snapshot,
        "incremental" => BatchKind::Incremental,
        other => return Err(JsonFormError::BadKind(other.to_owned())),
    };
    let mut ops = Vec::with_capacity(record.ops.len());
    for op_record in record.ops {
        let path = parse_pointer(&op_record.path)
            .ok_or_else(|| JsonFormError::BadPointer(op_record.path.clone()))?;
        let op = match (op_record.op.as_str(), op_record.value) {
            ("add", Some(value)) => PatchOp::Add(value),
            ("replace", Some(value)) => PatchOp::Replace(value),
            ("remove", None) => PatchOp::Remove,
            ("add" | "replace", None) => return Err(JsonFormError::BadOp("missing value")),
            ("remove", Some(_)) => return Err(JsonFormError::BadOp("unexpected value")),
            _ => return Err(JsonFormError::BadOp("unknown op")),
        };
        ops.push(Patch { path, op });
    }
    Ok(PatchBatch {
        document: record.doc,
        base_revision: record.base,
        new_revision: record.rev,
        kind,
        ops,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::PathToken::Key;

    #[test]
    fn round_trip() {
        let batch = PatchBatch {
            document: "room1".into(),
            base_revision: 1,
            new_revision: 2,
            kind: BatchKind::Incremental,
            ops: vec![
                Patch::replace(vec![Key("count".into())], Value::Int(1)),
                Patch::remove(vec![Key("gone".into())]),
            ],
        };
        let text = encode(&batch);
        assert_eq!(decode(&text).unwrap(), batch);
    }

    #[test]
    fn wire_shape_matches_rfc6902_records() {
        let batch = PatchBatch {
            document: "d".into(),
            base_revision: 0,
            new_revision: 1,
            kind: BatchKind::Incremental,
            ops: vec![Patch::replace(vec![Key("count".into())], Value::Int(1))],
        };
        let parsed: serde_json::Value = serde_json::from_str(&encode(&batch)).unwrap();
        assert_eq!(parsed["ops"][0]["op"], "replace");
        assert_eq!(parsed["ops"][0]["path"], "/count");
        assert_eq!(parsed["ops"][0]["value"], 1);
    }

    #[test]
    fn remove_record_has_no_value_field() {
        let batch = PatchBatch {
            document: "d".into(),
            base_revision: 0,
            new_revision: 1,
            kind: BatchKind::Incremental,
            ops: vec![Patch::remove(vec![Key("x".into())])],
        };
        let parsed: serde_json::Value = serde_json::from_str(&encode(&batch)).unwrap();
        assert!(parsed["ops"][0].get("value").is_none());
    }

    #[test]
    fn replace_with_null_value_round_trips() {
        let batch = PatchBatch {
            document: "d".into(),
            base_revision: 0,
            new_revision: 1,
            kind: BatchKind::Incremental,
            ops: vec![Patch::replace(vec![Key("x".into())], Value::Null)],
        };
        assert_eq!(decode(&encode(&batch)).unwrap(), batch);
    }

    #[test]
    fn unknown_op_is_rejected() {
        let text = r#"{"doc":"d","base":0,"rev":1,"kind":"incremental",
                       "ops":[{"op":"move","path":"/a","value":1}]}"#;
        assert!(matches!(decode(text), Err(JsonFormError::BadOp(_))));
    }
}
