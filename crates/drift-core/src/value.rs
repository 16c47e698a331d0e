// SPDX-License-Identifier: Apache-2.0
//! JSON-compatible value tree with byte buffers and private keys.

use serde::de::{self, MapAccess, SeqAccess, Visitor};
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Object keys starting with this prefix are private: mutable server-side,
/// never serialized into patches, snapshots, or persisted records.
pub const PRIVATE_PREFIX: char = '_';

/// A JSON-compatible tree value.
///
/// Objects are ordered maps (`BTreeMap`), which makes diff output and codec
/// output deterministic for equal trees. Equality is structural: derived
/// `PartialEq` gives `NaN != NaN` on floats and element-wise comparison on
/// byte buffers, which is exactly the diff contract.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// JSON null.
    Null,
    /// Boolean.
    Bool(bool),
    /// Integral number. JSON numbers without a fractional part decode here.
    Int(i64),
    /// IEEE-754 double.
    Float(f64),
    /// UTF-8 string.
    Str(String),
    /// Raw byte buffer. Rendered as `{"$bytes": "<base64>"}` in JSON form.
    Bytes(Vec<u8>),
    /// Ordered sequence.
    Array(Vec<Value>),
    /// Ordered string-keyed map.
    Object(BTreeMap<String, Value>),
}

impl Value {
    /// Empty object, the default seed for new documents.
    pub fn empty_object() -> Self {
        Value::Object(BTreeMap::new())
    }

    /// Returns true for `Value::Object`.
    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    /// Borrow the object map, if this is an object.
    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Mutably borrow the object map, if this is an object.
    pub fn as_object_mut(&mut self) -> Option<&mut BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Borrow the array, if this is an array.
    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Deep copy with every private (`_`-prefixed) object key removed, at
    /// every depth. This is the only shape of a document that may leave the
    /// server: snapshots, diff values, and persisted records all go through
    /// it.
    pub fn visible(&self) -> Value {
        match self {
            Value::Object(map) => Value::Object(
                map.iter()
                    .filter(|(k, _)| !is_private_key(k))
                    .map(|(k, v)| (k.clone(), v.visible()))
                    .collect(),
            ),
            Value::Array(items) => Value::Array(items.iter().map(Value::visible).collect()),
            other => other.clone(),
        }
    }

    /// True if the tree contains a private key at any depth.
    pub fn has_private_keys(&self) -> bool {
        match self {
            Value::Object(map) => map
                .iter()
                .any(|(k, v)| is_private_key(k) || v.has_private_keys()),
            Value::Array(items) => items.iter().any(Value::has_private_keys),
            _ => false,
        }
    }
}

/// True for object keys the patch engine must never serialize.
pub(crate) fn is_private_key(key: &str) -> bool {
    key.starts_with(PRIVATE_PREFIX)
}

const BYTES_MARKER: &str = "$bytes";

impl Serialize for Value {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use base64::Engine as _;
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(b) => serializer.serialize_bool(*b),
            Value::Int(n) => serializer.serialize_i64(*n),
            Value::Float(f) => serializer.serialize_f64(*f),
            Value::Str(s) => serializer.serialize_str(s),
            Value::Bytes(b) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(
                    BYTES_MARKER,
                    &base64::engine::general_purpose::STANDARD.encode(b),
                )?;
                map.end()
            }
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Object(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct ValueVisitor;

        impl<'de> Visitor<'de> for ValueVisitor {
            type Value = Value;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a JSON-compatible value")
            }

            fn visit_unit<E>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_none<E>(self) -> Result<Value, E> {
                Ok(Value::Null)
            }

            fn visit_some<D>(self, deserializer: D) -> Result<Value, D::Error>
            where
                D: Deserializer<'de>,
            {
                Deserialize::deserialize(deserializer)
            }

            fn visit_bool<E>(self, b: bool) -> Result<Value, E> {
                Ok(Value::Bool(b))
            }

            fn visit_i64<E>(self, n: i64) -> Result<Value, E> {
                Ok(Value::Int(n))
            }

            fn visit_u64<E>(self, n: u64) -> Result<Value, E>
            where
                E: de::Error,
            {
                i64::try_from(n)
                    .map(Value::Int)
                    .map_err(|_| E::custom("integer out of i64 range"))
            }

            fn visit_f64<E>(self, f: f64) -> Result<Value, E> {
                Ok(Value::Float(f))
            }

            fn visit_str<E>(self, s: &str) -> Result<Value, E> {
                Ok(Value::Str(s.to_owned()))
            }

            fn visit_string<E>(self, s: String) -> Result<Value, E> {
                Ok(Value::Str(s))
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Value, A::Error>
            where
                A: SeqAccess<'de>,
            {
                let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
                while let Some(item) = seq.next_element()? {
                    items.push(item);
                }
                Ok(Value::Array(items))
            }

            fn visit_map<A>(self, mut access: A) -> Result<Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                use base64::Engine as _;
                let mut map = BTreeMap::new();
                while let Some((key, value)) = access.next_entry::<String, Value>()? {
                    map.insert(key, value);
                }
                // A single-entry `{"$bytes": "..."}` map is the JSON spelling
                // of a byte buffer.
                if map.len() == 1 {
                    if let Some(Value::Str(encoded)) = map.get(BYTES_MARKER) {
                        let bytes = base64::engine::general_purpose::STANDARD
                            .decode(encoded)
                            .map_err(de::Error::custom)?;
                        return Ok(Value::Bytes(bytes));
                    }
                }
                Ok(Value::Object(map))
            }
        }

        deserializer.deserialize_any(ValueVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(entries: &[(&str, Value)]) -> Value {
        Value::Object(
            entries
                .iter()
                .map(|(k, v)| ((*k).to_owned(), v.clone()))
                .collect(),
        )
    }

    #[test]
    fn visible_strips_private_keys_at_every_depth() {
        let tree = obj(&[
            ("count", Value::Int(3)),
            ("_secret", Value::Str("x".into())),
            (
                "nested",
                obj(&[
                    ("_hidden", Value::Bool(true)),
                    ("kept", Value::Null),
                ]),
            ),
            (
                "list",
                Value::Array(vec![obj(&[("_inner", Value::Int(1)), ("ok", Value::Int(2))])]),
            ),
        ]);

        let visible = tree.visible();
        assert!(!visible.has_private_keys());
        assert_eq!(
            visible,
            obj(&[
                ("count", Value::Int(3)),
                ("nested", obj(&[("kept", Value::Null)])),
                ("list", Value::Array(vec![obj(&[("ok", Value::Int(2))])])),
            ])
        );
    }

    #[test]
    fn nan_is_not_equal_to_itself() {
        assert_ne!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_eq!(Value::Float(1.5), Value::Float(1.5));
    }

    #[test]
    fn json_round_trip_preserves_ints_and_bytes() {
        let tree = obj(&[
            ("n", Value::Int(42)),
            ("f", Value::Float(0.5)),
            ("b", Value::Bytes(vec![0, 1, 255])),
        ]);
        let text = serde_json::to_string(&tree).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, tree);
    }

    #[test]
    fn plain_object_with_other_keys_is_not_bytes() {
        let text = r#"{"$bytes":"AAE=","extra":1}"#;
        let back: Value = serde_json::from_str(text).unwrap();
        assert!(back.is_object());
    }
}
