// SPDX-License-Identifier: Apache-2.0
//! Deep diff between two value trees.
//!
//! Output contract:
//! - Applying the result to a clone of `old` yields `new` (private keys
//!   excluded on both sides).
//! - No emitted path or value references a private key.
//! - Arrays use an index-based diff, never an LCS: a length change is a
//!   whole-array Replace unless [`ArrayMode::Element`] is selected, in which
//!   case tail Removes are emitted first in descending index order.

use crate::patch::{Patch, PatchPath, PathToken};
use crate::value::{is_private_key, Value};

/// Array diffing policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArrayMode {
    /// A length change replaces the whole array (the default: mutable
    /// collections are expected to be map-keyed, not ordered lists).
    #[default]
    Whole,
    /// Emit per-index Add/Replace/Remove operations.
    Element,
}

/// Options for [`diff`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    /// How arrays with differing lengths are described.
    pub array_mode: ArrayMode,
}

/// Computes the ordered patch list turning `old` into `new`.
///
/// Both trees are read as-is; private keys are skipped on both sides, so a
/// mutation that only touches `_`-prefixed keys produces an empty list.
pub fn diff(old: &Value, new: &Value, options: &DiffOptions) -> Vec<Patch> {
    let mut out = Vec::new();
    let mut path = Vec::new();
    diff_at(old, new, options, &mut path, &mut out);
    out
}

fn diff_at(
    old: &Value,
    new: &Value,
    options: &DiffOptions,
    path: &mut PatchPath,
    out: &mut Vec<Patch>,
) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) => {
            // Removes for keys only in old.
            for key in old_map.keys() {
                if is_private_key(key) || new_map.contains_key(key) {
                    continue;
                }
                path.push(PathToken::Key(key.clone()));
                out.push(Patch::remove(path.clone()));
                path.pop();
            }
            // Adds for keys only in new, recursion for shared keys.
            for (key, new_child) in new_map {
                if is_private_key(key) {
                    continue;
                }
                path.push(PathToken::Key(key.clone()));
                match old_map.get(key) {
                    None => out.push(Patch::add(path.clone(), new_child.visible())),
                    Some(old_child) => diff_at(old_child, new_child, options, path, out),
                }
                path.pop();
            }
        }
        (Value::Array(old_items), Value::Array(new_items)) => {
            diff_arrays(old_items, new_items, options, path, out);
        }
        (old_leaf, new_leaf) => {
            // Leaves, or a container/leaf kind change: strict structural
            // inequality (NaN != NaN) forces a Replace.
            if old_leaf != new_leaf {
                out.push(Patch::replace(path.clone(), new_leaf.visible()));
            }
        }
    }
}

fn diff_arrays(
    old_items: &[Value],
    new_items: &[Value],
    options: &DiffOptions,
    path: &mut PatchPath,
    out: &mut Vec<Patch>,
) {
    if old_items.len() != new_items.len() && options.array_mode == ArrayMode::Whole {
        out.push(Patch::replace(
            path.clone(),
            Value::Array(new_items.iter().map(Value::visible).collect()),
        ));
        return;
    }

    // Tail removes first, in descending index order, so sequential
    // application never shifts an index it has yet to touch.
    if old_items.len() > new_items.len() {
        for index in (new_items.len()..old_items.len()).rev() {
            path.push(PathToken::Index(index));
            out.push(Patch::remove(path.clone()));
            path.pop();
        }
    }

    let shared = old_items.len().min(new_items.len());
    for index in 0..shared {
        path.push(PathToken::Index(index));
        diff_at(&old_items[index], &new_items[index], options, path, out);
        path.pop();
    }

    for (offset, item) in new_items.iter().enumerate().skip(old_items.len()) {
        path.push(PathToken::Index(offset));
        out.push(Patch::add(path.clone(), item.visible()));
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::apply;
    use crate::patch::PatchOp;
    use std::collections::BTreeMap;

    fn obj(entries: &[(&str, Value)]) -> Value {
        Value::Object(
            entries
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect(),
        )
    }

    fn key(k: &str) -> PathToken {
        PathToken::Key(k.to_owned())
    }

    #[test]
    fn identical_trees_produce_no_patches() {
        let tree = obj(&[("a", Value::Int(1)), ("b", Value::Str("x".into()))]);
        assert!(diff(&tree, &tree, &DiffOptions::default()).is_empty());
    }

    #[test]
    fn primitive_change_is_a_replace() {
        let old = obj(&[("count", Value::Int(0))]);
        let new = obj(&[("count", Value::Int(1))]);
        let patches = diff(&old, &new, &DiffOptions::default());
        assert_eq!(patches, vec![Patch::replace(vec![key("count")], Value::Int(1))]);
    }

    #[test]
    fn private_keys_never_appear() {
        let old = obj(&[("_secret", Value::Str("a".into())), ("kept", Value::Int(1))]);
        let new = obj(&[("_secret", Value::Str("b".into())), ("kept", Value::Int(1))]);
        assert!(diff(&old, &new, &DiffOptions::default()).is_empty());

        // A freshly added subtree is scrubbed before it is emitted.
        let new2 = obj(&[
            ("kept", Value::Int(1)),
            ("fresh", obj(&[("_inner", Value::Int(9)), ("ok", Value::Int(2))])),
        ]);
        let patches = diff(&old, &new2, &DiffOptions::default());
        let added = patches
            .iter()
            .find_map(|p| match (&p.path[..], &p.op) {
                ([PathToken::Key(k)], PatchOp::Add(v)) if k == "fresh" => Some(v),
                _ => None,
            })
            .expect("add for fresh");
        assert!(!added.has_private_keys());
    }

    #[test]
    fn array_length_change_replaces_whole_array() {
        let old = obj(&[(
            "items",
            Value::Array(vec![Value::Int(1), Value::Int(2), Value::Int(3)]),
        )]);
        let new = obj(&[(
            "items",
            Value::Array(vec![Value::Int(9), Value::Int(2), Value::Int(3), Value::Int(4)]),
        )]);
        let patches = diff(&old, &new, &DiffOptions::default());
        assert_eq!(
            patches,
            vec![Patch::replace(
                vec![key("items")],
                Value::Array(vec![Value::Int(9), Value::Int(2), Value::Int(3), Value::Int(4)]),
            )]
        );
    }

    #[test]
    fn element_mode_emits_tail_removes_in_descending_order() {
        let old = Value::Array(vec![
            Value::Int(1),
            Value::Int(2),
            Value::Int(3),
            Value::Int(4),
        ]);
        let new = Value::Array(vec![Value::Int(1), Value::Int(7)]);
        let options = DiffOptions {
            array_mode: ArrayMode::Element,
        };
        let patches = diff(&old, &new, &options);
        assert_eq!(
            patches,
            vec![
                Patch::remove(vec![PathToken::Index(3)]),
                Patch::remove(vec![PathToken::Index(2)]),
                Patch::replace(vec![PathToken::Index(1)], Value::Int(7)),
            ]
        );

        let mut replay = old.clone();
        apply(&mut replay, &patches).unwrap();
        assert_eq!(replay, new);
    }

    #[test]
    fn nested_add_and_remove() {
        let old = obj(&[(
            "entities",
            obj(&[(
                "e1",
                obj(&[("pos", Value::Array(vec![Value::Int(0), Value::Int(0), Value::Int(0)]))]),
            )]),
        )]);
        let new = obj(&[(
            "entities",
            obj(&[(
                "e2",
                obj(&[("pos", Value::Array(vec![Value::Int(5), Value::Int(5), Value::Int(5)]))]),
            )]),
        )]);
        let patches = diff(&old, &new, &DiffOptions::default());
        assert_eq!(patches.len(), 2);
        assert!(patches
            .iter()
            .any(|p| p.path == vec![key("entities"), key("e1")] && p.op == PatchOp::Remove));
        assert!(patches
            .iter()
            .any(|p| p.path == vec![key("entities"), key("e2")]
                && matches!(p.op, PatchOp::Add(_))));
    }

    #[test]
    fn kind_change_is_a_replace() {
        let old = obj(&[("v", Value::Int(1))]);
        let new = obj(&[("v", Value::Array(vec![Value::Int(1)]))]);
        let patches = diff(&old, &new, &DiffOptions::default());
        assert_eq!(
            patches,
            vec![Patch::replace(vec![key("v")], Value::Array(vec![Value::Int(1)]))]
        );
    }

    #[test]
    fn nan_forces_a_replace_every_tick() {
        let old = obj(&[("x", Value::Float(f64::NAN))]);
        let new = obj(&[("x", Value::Float(f64::NAN))]);
        let patches = diff(&old, &new, &DiffOptions::default());
        assert_eq!(patches.len(), 1, "NaN != NaN by contract");
    }

    #[test]
    fn diff_then_apply_reaches_new_tree() {
        let old = obj(&[
            ("a", Value::Int(1)),
            ("b", obj(&[("c", Value::Str("old".into())), ("gone", Value::Bool(true))])),
            ("items", Value::Array(vec![Value::Int(1), Value::Int(2)])),
        ]);
        let new = obj(&[
            ("a", Value::Int(2)),
            ("b", obj(&[("c", Value::Str("new".into())), ("added", Value::Null)])),
            ("items", Value::Array(vec![Value::Int(3)])),
            ("extra", Value::Object(BTreeMap::new())),
        ]);
        let patches = diff(&old, &new, &DiffOptions::default());
        let mut replay = old.clone();
        apply(&mut replay, &patches).unwrap();
        assert_eq!(replay, new);
    }
}
