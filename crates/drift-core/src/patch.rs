// SPDX-License-Identifier: Apache-2.0
//! Patch, path, and batch types shared by the diff engine and both codecs.

use crate::value::Value;
use crate::Revision;
use serde::{Deserialize, Serialize};
use std::fmt;

/// One step into a value tree: an object key or an array index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathToken {
    /// Object key.
    Key(String),
    /// Array index.
    Index(usize),
}

impl fmt::Display for PathToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathToken::Key(k) => f.write_str(k),
            PathToken::Index(i) => write!(f, "{i}"),
        }
    }
}

/// Ordered token sequence from the document root.
pub type PatchPath = Vec<PathToken>;

/// Renders a path as an RFC 6901 JSON pointer (`/a/0/b`), escaping `~` and
/// `/` as `~0` and `~1`.
pub fn render_pointer(path: &[PathToken]) -> String {
    let mut out = String::new();
    for token in path {
        out.push('/');
        match token {
            PathToken::Key(k) => {
                for ch in k.chars() {
                    match ch {
                        '~' => out.push_str("~0"),
                        '/' => out.push_str("~1"),
                        other => out.push(other),
                    }
                }
            }
            PathToken::Index(i) => out.push_str(&i.to_string()),
        }
    }
    out
}

/// Parses an RFC 6901 pointer back into tokens. All-digit tokens come back
/// as [`PathToken::Index`]; [`crate::apply`] resolves them against the
/// actual container type, so numeric object keys still address correctly.
pub fn parse_pointer(pointer: &str) -> Option<PatchPath> {
    if pointer.is_empty() {
        return Some(Vec::new());
    }
    if !pointer.starts_with('/') {
        return None;
    }
    let mut tokens = Vec::new();
    for raw in pointer[1..].split('/') {
        let unescaped = raw.replace("~1", "/").replace("~0", "~");
        // Index tokens are canonical decimal: no sign, no leading zero.
        let canonical_index = !unescaped.is_empty()
            && unescaped.bytes().all(|b| b.is_ascii_digit())
            && (unescaped == "0" || !unescaped.starts_with('0'));
        match unescaped.parse::<usize>() {
            Ok(index) if canonical_index => tokens.push(PathToken::Index(index)),
            _ => tokens.push(PathToken::Key(unescaped)),
        }
    }
    Some(tokens)
}

/// The mutation a patch performs at its path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PatchOp {
    /// Insert a value at a path that does not exist yet.
    Add(Value),
    /// Replace the value at an existing path.
    Replace(Value),
    /// Delete the value at an existing path.
    Remove,
}

impl PatchOp {
    /// Canonical op name used by the JSON wire form.
    pub fn name(&self) -> &'static str {
        match self {
            PatchOp::Add(_) => "add",
            PatchOp::Replace(_) => "replace",
            PatchOp::Remove => "remove",
        }
    }
}

/// A single Add/Remove/Replace against a path within a document's visible
/// state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Path from the document root.
    pub path: PatchPath,
    /// Mutation to perform there.
    pub op: PatchOp,
}

impl Patch {
    /// Add `value` at `path`.
    pub fn add(path: PatchPath, value: Value) -> Self {
        Self {
            path,
            op: PatchOp::Add(value),
        }
    }

    /// Replace the value at `path`.
    pub fn replace(path: PatchPath, value: Value) -> Self {
        Self {
            path,
            op: PatchOp::Replace(value),
        }
    }

    /// Remove the value at `path`.
    pub fn remove(path: PatchPath) -> Self {
        Self {
            path,
            op: PatchOp::Remove,
        }
    }
}

/// Whether a batch carries a full snapshot or an incremental diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchKind {
    /// Single root Replace with the whole visible state; applies to any
    /// baseline.
    Snapshot,
    /// Ordered diff against exactly `base_revision`.
    Incremental,
}

/// An ordered set of patches tagged with the revision window it spans.
///
/// For `Snapshot` batches `base_revision` is 0 and `ops` is a single root
/// Replace. For `Incremental` batches `new_revision == base_revision + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchBatch {
    /// Name of the document the batch belongs to.
    pub document: String,
    /// Revision the batch applies on top of.
    pub base_revision: Revision,
    /// Revision the receiver is at after applying the batch.
    pub new_revision: Revision,
    /// Snapshot or incremental.
    pub kind: BatchKind,
    /// Ordered operations.
    pub ops: Vec<Patch>,
}

impl PatchBatch {
    /// Builds a snapshot batch: one root Replace carrying `state` (which the
    /// caller has already made visible).
    pub fn snapshot(document: impl Into<String>, revision: Revision, state: Value) -> Self {
        Self {
            document: document.into(),
            base_revision: 0,
            new_revision: revision,
            kind: BatchKind::Snapshot,
            ops: vec![Patch::replace(Vec::new(), state)],
        }
    }

    /// Builds an incremental batch moving `base_revision` to
    /// `base_revision + 1`.
    pub fn incremental(
        document: impl Into<String>,
        base_revision: Revision,
        ops: Vec<Patch>,
    ) -> Self {
        Self {
            document: document.into(),
            base_revision,
            new_revision: base_revision + 1,
            kind: BatchKind::Incremental,
            ops,
        }
    }
}
