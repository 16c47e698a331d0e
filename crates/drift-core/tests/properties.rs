// SPDX-License-Identifier: Apache-2.0

#![allow(missing_docs)]
//! Property tests for the patch engine: diff/apply round-trip, private-key
//! exclusion, and codec determinism over generated trees.

use drift_core::codec::{self, EncodeOptions};
use drift_core::{apply, diff, BatchKind, DiffOptions, PatchBatch, Value};
use proptest::collection::{btree_map, vec};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Generated trees: bounded depth and width keep cases fast; keys mix
/// public and private spellings so the privacy property sees both.
fn value_strategy() -> impl Strategy<Value = Value> {
    let leaf = prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::Bool),
        any::<i64>().prop_map(Value::Int),
        // Finite floats only: NaN trees never settle, by design.
        any::<f64>().prop_filter("finite", |f| f.is_finite()).prop_map(Value::Float),
        "[a-z]{0,8}".prop_map(Value::Str),
        vec(any::<u8>(), 0..16).prop_map(Value::Bytes),
    ];
    leaf.prop_recursive(3, 48, 6, |inner| {
        prop_oneof![
            vec(inner.clone(), 0..6).prop_map(Value::Array),
            btree_map(key_strategy(), inner, 0..6).prop_map(Value::Object),
        ]
    })
}

fn key_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        4 => "[a-z]{1,6}".prop_map(String::from),
        1 => "_[a-z]{1,5}".prop_map(String::from),
    ]
}

fn batch_strategy() -> impl Strategy<Value = PatchBatch> {
    (value_strategy(), value_strategy(), any::<u64>()).prop_map(|(old, new, base)| {
        let ops = diff(&old, &new, &DiffOptions::default());
        PatchBatch {
            document: "prop".into(),
            base_revision: base,
            new_revision: base.wrapping_add(1),
            kind: BatchKind::Incremental,
            ops,
        }
    })
}

fn collect_keys(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                out.push(k.clone());
                collect_keys(v, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_keys(item, out);
            }
        }
        _ => {}
    }
}

proptest! {
    /// Applying `diff(a, b)` to the visible projection of `a` yields the
    /// visible projection of `b`.
    #[test]
    fn diff_apply_round_trip(old in value_strategy(), new in value_strategy()) {
        let patches = diff(&old, &new, &DiffOptions::default());
        let mut replay = old.visible();
        // The diff walks `old` itself, so paths resolve against the visible
        // clone too (private keys are never referenced).
        apply(&mut replay, &patches).expect("apply diff output");
        prop_assert_eq!(replay, new.visible());
    }

    /// Same round trip under element-wise array diffing.
    #[test]
    fn diff_apply_round_trip_element_mode(old in value_strategy(), new in value_strategy()) {
        let options = DiffOptions { array_mode: drift_core::ArrayMode::Element };
        let patches = diff(&old, &new, &options);
        let mut replay = old.visible();
        apply(&mut replay, &patches).expect("apply diff output");
        prop_assert_eq!(replay, new.visible());
    }

    /// No emitted path token or value subtree starts with `_`.
    #[test]
    fn diff_never_references_private_keys(old in value_strategy(), new in value_strategy()) {
        for patch in diff(&old, &new, &DiffOptions::default()) {
            for token in &patch.path {
                if let drift_core::PathToken::Key(k) = token {
                    prop_assert!(!k.starts_with('_'), "private key in path: {}", k);
                }
            }
            let value = match &patch.op {
                drift_core::PatchOp::Add(v) | drift_core::PatchOp::Replace(v) => v,
                drift_core::PatchOp::Remove => continue,
            };
            let mut keys = Vec::new();
            collect_keys(value, &mut keys);
            prop_assert!(keys.iter().all(|k| !k.starts_with('_')));
        }
    }

    /// Binary encode/decode is the identity on batches.
    #[test]
    fn binary_round_trip(batch in batch_strategy()) {
        let bytes = codec::encode(&batch, &EncodeOptions::default());
        let back = codec::decode(&bytes).expect("decode");
        prop_assert_eq!(back, batch);
    }

    /// Binary round trip survives the compressed path too.
    #[test]
    fn binary_round_trip_compressed(batch in batch_strategy()) {
        let options = EncodeOptions { allow_compression: true, compress_min: 32 };
        let bytes = codec::encode(&batch, &options);
        let back = codec::decode(&bytes).expect("decode");
        prop_assert_eq!(back, batch);
    }

    /// Equal batches encode to byte-identical output.
    #[test]
    fn binary_encoding_is_deterministic(batch in batch_strategy()) {
        let options = EncodeOptions::default();
        prop_assert_eq!(codec::encode(&batch, &options), codec::encode(&batch, &options));
    }

    /// JSON form round-trips batches whose values survive JSON (it reuses
    /// the same Patch model, so this mainly exercises pointer rendering).
    #[test]
    fn json_round_trip(batch in batch_strategy()) {
        let text = drift_core::json::encode(&batch);
        let back = drift_core::json::decode(&text).expect("decode json form");
        prop_assert_eq!(back, batch);
    }
}

#[test]
fn snapshot_batch_is_single_root_replace() {
    let mut map = BTreeMap::new();
    map.insert("count".to_owned(), Value::Int(0));
    map.insert("_secret".to_owned(), Value::Str("x".into()));
    let state = Value::Object(map);

    let batch = PatchBatch::snapshot("room1", 1, state.visible());
    assert_eq!(batch.kind, BatchKind::Snapshot);
    assert_eq!(batch.ops.len(), 1);
    assert!(batch.ops[0].path.is_empty());
    match &batch.ops[0].op {
        drift_core::PatchOp::Replace(v) => assert!(!v.has_private_keys()),
        other => panic!("expected root replace, got {other:?}"),
    }
}
