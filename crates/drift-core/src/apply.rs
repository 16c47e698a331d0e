// SPDX-License-Identifier: Apache-2.0
//! In-place patch application.

use crate::patch::{render_pointer, Patch, PatchOp, PathToken};
use crate::value::Value;
use thiserror::Error;

/// Failure while applying a patch list.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PatchError {
    /// Replace/Remove targeted a path that does not exist.
    #[error("patch conflict at {pointer}: path does not exist")]
    Conflict {
        /// JSON-pointer rendering of the offending path.
        pointer: String,
    },
    /// A path token does not fit the container it addresses (for example an
    /// out-of-bounds array index on Add).
    #[error("bad path at {pointer}: {reason}")]
    BadPath {
        /// JSON-pointer rendering of the offending path.
        pointer: String,
        /// What went wrong.
        reason: &'static str,
    },
    /// A root Remove is meaningless; the document root always exists.
    #[error("cannot remove the document root")]
    RemoveRoot,
}

/// Applies `patches` to `tree` in order, mutating it in place.
///
/// `Add` creates missing intermediate objects along the way; `Replace` and
/// `Remove` of a missing path fail with [`PatchError::Conflict`]. The tree
/// is left in the partially-applied state on error (callers that need
/// atomicity clone first).
pub fn apply(tree: &mut Value, patches: &[Patch]) -> Result<(), PatchError> {
    for patch in patches {
        apply_one(tree, patch)?;
    }
    Ok(())
}

fn apply_one(tree: &mut Value, patch: &Patch) -> Result<(), PatchError> {
    let Some((last, parents)) = patch.path.split_last() else {
        // Root operations.
        return match &patch.op {
            PatchOp::Add(value) | PatchOp::Replace(value) => {
                *tree = value.clone();
                Ok(())
            }
            PatchOp::Remove => Err(PatchError::RemoveRoot),
        };
    };

    let create_missing = matches!(patch.op, PatchOp::Add(_));
    let mut node = tree;
    for (depth, token) in parents.iter().enumerate() {
        node = descend(node, token, create_missing).ok_or_else(|| PatchError::Conflict {
            pointer: render_pointer(&patch.path[..=depth]),
        })?;
    }

    let pointer = || render_pointer(&patch.path);
    match (&patch.op, node) {
        (PatchOp::Add(value), Value::Object(map)) => {
            map.insert(token_key(last), value.clone());
            Ok(())
        }
        (PatchOp::Add(value), Value::Array(items)) => {
            let index = token_index(last).ok_or_else(|| PatchError::BadPath {
                pointer: pointer(),
                reason: "array index out of range",
            })?;
            if index > items.len() {
                return Err(PatchError::BadPath {
                    pointer: pointer(),
                    reason: "array index out of range",
                });
            }
            items.insert(index, value.clone());
            Ok(())
        }
        (PatchOp::Replace(value), Value::Object(map)) => {
            let slot = map.get_mut(&token_key(last)).ok_or_else(|| PatchError::Conflict {
                pointer: pointer(),
            })?;
            *slot = value.clone();
            Ok(())
        }
        (PatchOp::Replace(value), Value::Array(items)) => {
            let slot = token_index(last)
                .and_then(|i| items.get_mut(i))
                .ok_or_else(|| PatchError::Conflict {
                    pointer: pointer(),
                })?;
            *slot = value.clone();
            Ok(())
        }
        (PatchOp::Remove, Value::Object(map)) => {
            map.remove(&token_key(last))
                .map(|_| ())
                .ok_or_else(|| PatchError::Conflict {
                    pointer: pointer(),
                })
        }
        (PatchOp::Remove, Value::Array(items)) => {
            let index = token_index(last)
                .filter(|&i| i < items.len())
                .ok_or_else(|| PatchError::Conflict {
                    pointer: pointer(),
                })?;
            items.remove(index);
            Ok(())
        }
        (_, _) => Err(PatchError::BadPath {
            pointer: pointer(),
            reason: "parent is not a container",
        }),
    }
}

/// Steps into `node` by one token. With `create_missing`, absent object keys
/// grow an empty object (the Add contract). Returns `None` when the step is
/// impossible.
fn descend<'a>(node: &'a mut Value, token: &PathToken, create_missing: bool) -> Option<&'a mut Value> {
    match node {
        Value::Object(map) => {
            let key = token_key(token);
            if create_missing && !map.contains_key(&key) {
                map.insert(key.clone(), Value::empty_object());
            }
            map.get_mut(&key)
        }
        Value::Array(items) => {
            let index = token_index(token)?;
            items.get_mut(index)
        }
        _ => None,
    }
}

/// Token as an object key. Index tokens address numeric keys, which keeps
/// the JSON pointer form (where `/3` is ambiguous) lossless.
fn token_key(token: &PathToken) -> String {
    match token {
        PathToken::Key(k) => k.clone(),
        PathToken::Index(i) => i.to_string(),
    }
}

/// Token as an array index. Key tokens holding canonical decimal also
/// resolve, for the same JSON-pointer reason.
fn token_index(token: &PathToken) -> Option<usize> {
    match token {
        PathToken::Index(i) => Some(*i),
        PathToken::Key(k) => k.parse().ok(),
    }
}
