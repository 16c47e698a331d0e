// SPDX-License-Identifier: Apache-2.0
//! Deterministic binary form of a [`PatchBatch`].
//!
//! Layout:
//! - 1 header byte: high nibble = format version (1); bit 0 = snapshot,
//!   bit 1 = payload zlib-compressed.
//! - Payload (possibly compressed): document name (varint len + UTF-8),
//!   `base_revision` varint, `new_revision` varint, op count varint, then
//!   each op as `{op tag u8, path len varint, tokens, value-present u8,
//!   value}`.
//! - Integers are LEB128 varints (signed values zigzag-encoded); floats are
//!   IEEE-754 f64 little-endian; strings and byte buffers are
//!   length-prefixed.
//!
//! Encoding is deterministic: object entries serialize in map order
//! (`BTreeMap`), varints are minimal-width, and compression is only applied
//! when it actually shrinks the payload, so equal batches produce
//! byte-identical output under equal options.

use crate::patch::{BatchKind, Patch, PatchOp, PathToken};
use crate::value::Value;
use crate::PatchBatch;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use thiserror::Error;

/// Format version carried in the header nibble.
const FORMAT_VERSION: u8 = 1;
const FLAG_SNAPSHOT: u8 = 0b0000_0001;
const FLAG_COMPRESSED: u8 = 0b0000_0010;

/// Payloads below this size are never worth compressing.
pub const DEFAULT_COMPRESS_MIN: usize = 1024;

/// Hard cap on declared lengths, matching the transport frame cap.
const MAX_LEN: u64 = 8 * 1024 * 1024;

// Value tags.
const TAG_NULL: u8 = 0x00;
const TAG_FALSE: u8 = 0x01;
const TAG_TRUE: u8 = 0x02;
const TAG_INT: u8 = 0x03;
const TAG_FLOAT: u8 = 0x04;
const TAG_STR: u8 = 0x05;
const TAG_BYTES: u8 = 0x06;
const TAG_ARRAY: u8 = 0x07;
const TAG_OBJECT: u8 = 0x08;

// Op tags.
const OP_ADD: u8 = 0x00;
const OP_REPLACE: u8 = 0x01;
const OP_REMOVE: u8 = 0x02;

// Path token tags.
const TOKEN_KEY: u8 = 0x00;
const TOKEN_INDEX: u8 = 0x01;

/// Failure while encoding or decoding the binary form.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Input ended before the value it declared.
    #[error("incomplete input")]
    Incomplete,
    /// Bytes left over after the batch.
    #[error("trailing bytes after batch")]
    Trailing,
    /// Header carried an unknown format version.
    #[error("unsupported format version {0}")]
    Version(u8),
    /// An unknown tag byte.
    #[error("unknown tag {tag:#04x} for {what}")]
    UnknownTag {
        /// Offending byte.
        tag: u8,
        /// Which grammar position it appeared in.
        what: &'static str,
    },
    /// A declared length exceeded the frame cap.
    #[error("declared length {0} exceeds limit")]
    LengthLimit(u64),
    /// A varint ran past 10 bytes.
    #[error("varint overflow")]
    VarintOverflow,
    /// Length-prefixed string was not UTF-8.
    #[error("invalid utf-8 in string")]
    Utf8,
    /// zlib stream failed to inflate.
    #[error("decompression failed: {0}")]
    Inflate(String),
}

/// Options for [`encode`].
#[derive(Debug, Clone, Copy)]
pub struct EncodeOptions {
    /// Whether compression may be used at all (per-document policy flag).
    pub allow_compression: bool,
    /// Minimum payload size before compression is attempted.
    pub compress_min: usize,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        Self {
            allow_compression: false,
            compress_min: DEFAULT_COMPRESS_MIN,
        }
    }
}

/// Encodes a batch into the binary form.
pub fn encode(batch: &PatchBatch, options: &EncodeOptions) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    write_str(&batch.document, &mut payload);
    write_uvarint(batch.base_revision, &mut payload);
    write_uvarint(batch.new_revision, &mut payload);
    write_uvarint(batch.ops.len() as u64, &mut payload);
    for op in &batch.ops {
        put_patch(op, &mut payload);
    }

    let mut flags = 0u8;
    if batch.kind == BatchKind::Snapshot {
        flags |= FLAG_SNAPSHOT;
    }

    if options.allow_compression && payload.len() >= options.compress_min {
        let mut encoder = ZlibEncoder::new(Vec::with_capacity(payload.len() / 2), Compression::default());
        // Writing to a Vec cannot fail.
        let compressed = encoder
            .write_all(&payload)
            .and_then(|()| encoder.finish())
            .ok();
        if let Some(compressed) = compressed {
            let mut prefixed = Vec::with_capacity(compressed.len() + 10);
            write_uvarint(payload.len() as u64, &mut prefixed);
            prefixed.extend_from_slice(&compressed);
            if prefixed.len() < payload.len() {
                let mut out = Vec::with_capacity(1 + prefixed.len());
                out.push((FORMAT_VERSION << 4) | flags | FLAG_COMPRESSED);
                out.extend_from_slice(&prefixed);
                return out;
            }
        }
    }

    let mut out = Vec::with_capacity(1 + payload.len());
    out.push((FORMAT_VERSION << 4) | flags);
    out.extend_from_slice(&payload);
    out
}

/// Decodes a batch from the binary form.
pub fn decode(bytes: &[u8]) -> Result<PatchBatch, CodecError> {
    let (&header, rest) = bytes.split_first().ok_or(CodecError::Incomplete)?;
    let version = header >> 4;
    if version != FORMAT_VERSION {
        return Err(CodecError::Version(version));
    }
    let kind = if header & FLAG_SNAPSHOT != 0 {
        BatchKind::Snapshot
    } else {
        BatchKind::Incremental
    };

    let inflated;
    let payload: &[u8] = if header & FLAG_COMPRESSED != 0 {
        let mut cursor = Reader::new(rest);
        let raw_len = cursor.take_uvarint()?;
        if raw_len > MAX_LEN {
            return Err(CodecError::LengthLimit(raw_len));
        }
        let mut decoder = ZlibDecoder::new(cursor.remaining());
        let mut buf = Vec::with_capacity(raw_len as usize);
        decoder
            .read_to_end(&mut buf)
            .map_err(|err| CodecError::Inflate(err.to_string()))?;
        if buf.len() as u64 != raw_len {
            return Err(CodecError::Inflate("length prefix mismatch".into()));
        }
        inflated = buf;
        &inflated
    } else {
        rest
    };

    let mut cursor = Reader::new(payload);
    let document = cursor.take_str()?;
    let base_revision = cursor.take_uvarint()?;
    let new_revision = cursor.take_uvarint()?;
    let op_count = cursor.take_uvarint()?;
    if op_count > MAX_LEN {
        return Err(CodecError::LengthLimit(op_count));
    }
    let mut ops = Vec::with_capacity(op_count as usize);
    for _ in 0..op_count {
        ops.push(cursor.take_patch()?);
    }
    if !cursor.is_empty() {
        return Err(CodecError::Trailing);
    }

    Ok(PatchBatch {
        document,
        base_revision,
        new_revision,
        kind,
        ops,
    })
}

// --- Encoder --------------------------------------------------------------

fn put_patch(patch: &Patch, out: &mut Vec<u8>) {
    let (tag, value) = match &patch.op {
        PatchOp::Add(v) => (OP_ADD, Some(v)),
        PatchOp::Replace(v) => (OP_REPLACE, Some(v)),
        PatchOp::Remove => (OP_REMOVE, None),
    };
    out.push(tag);
    write_uvarint(patch.path.len() as u64, out);
    for token in &patch.path {
        match token {
            PathToken::Key(k) => {
                out.push(TOKEN_KEY);
                write_str(k, out);
            }
            PathToken::Index(i) => {
                out.push(TOKEN_INDEX);
                write_uvarint(*i as u64, out);
            }
        }
    }
    match value {
        Some(v) => {
            out.push(1);
            write_value(v, out);
        }
        None => out.push(0),
    }
}

/// Writes one self-describing value (shared with the control-frame layer).
pub fn write_value(value: &Value, out: &mut Vec<u8>) {
    match value {
        Value::Null => out.push(TAG_NULL),
        Value::Bool(false) => out.push(TAG_FALSE),
        Value::Bool(true) => out.push(TAG_TRUE),
        Value::Int(n) => {
            out.push(TAG_INT);
            write_uvarint(zigzag(*n), out);
        }
        Value::Float(f) => {
            out.push(TAG_FLOAT);
            out.extend_from_slice(&f.to_le_bytes());
        }
        Value::Str(s) => {
            out.push(TAG_STR);
            write_str(s, out);
        }
        Value::Bytes(b) => {
            out.push(TAG_BYTES);
            write_uvarint(b.len() as u64, out);
            out.extend_from_slice(b);
        }
        Value::Array(items) => {
            out.push(TAG_ARRAY);
            write_uvarint(items.len() as u64, out);
            for item in items {
                write_value(item, out);
            }
        }
        Value::Object(map) => {
            out.push(TAG_OBJECT);
            write_uvarint(map.len() as u64, out);
            for (key, item) in map {
                write_str(key, out);
                write_value(item, out);
            }
        }
    }
}

/// Writes a length-prefixed UTF-8 string.
pub fn write_str(s: &str, out: &mut Vec<u8>) {
    write_uvarint(s.len() as u64, out);
    out.extend_from_slice(s.as_bytes());
}

/// Writes a LEB128 varint.
pub fn write_uvarint(mut n: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

fn zigzag(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

fn unzigzag(n: u64) -> i64 {
    ((n >> 1) as i64) ^ -((n & 1) as i64)
}

// --- Decoder --------------------------------------------------------------

/// Incremental reader over an encoded payload (shared with the
/// control-frame layer).
pub struct Reader<'a> {
    bytes: &'a [u8],
}

impl<'a> Reader<'a> {
    /// Wraps a byte slice.
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    /// True when every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// The unread remainder.
    pub fn remaining(&self) -> &'a [u8] {
        self.bytes
    }

    /// Reads one byte.
    pub fn take_u8(&mut self) -> Result<u8, CodecError> {
        let (&byte, rest) = self.bytes.split_first().ok_or(CodecError::Incomplete)?;
        self.bytes = rest;
        Ok(byte)
    }

    /// Reads `len` raw bytes.
    pub fn take_slice(&mut self, len: u64) -> Result<&'a [u8], CodecError> {
        if len > MAX_LEN {
            return Err(CodecError::LengthLimit(len));
        }
        let len = len as usize;
        if self.bytes.len() < len {
            return Err(CodecError::Incomplete);
        }
        let (head, rest) = self.bytes.split_at(len);
        self.bytes = rest;
        Ok(head)
    }

    /// Reads a LEB128 varint.
    pub fn take_uvarint(&mut self) -> Result<u64, CodecError> {
        let mut value: u64 = 0;
        for shift in (0..64).step_by(7) {
            let byte = self.take_u8()?;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CodecError::VarintOverflow)
    }

    /// Reads a length-prefixed UTF-8 string.
    pub fn take_str(&mut self) -> Result<String, CodecError> {
        let len = self.take_uvarint()?;
        let bytes = self.take_slice(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| CodecError::Utf8)
    }

    /// Reads one self-describing value.
    pub fn take_value(&mut self) -> Result<Value, CodecError> {
        match self.take_u8()? {
            TAG_NULL => Ok(Value::Null),
            TAG_FALSE => Ok(Value::Bool(false)),
            TAG_TRUE => Ok(Value::Bool(true)),
            TAG_INT => Ok(Value::Int(unzigzag(self.take_uvarint()?))),
            TAG_FLOAT => {
                let bytes = self.take_slice(8)?;
                let mut buf = [0u8; 8];
                buf.copy_from_slice(bytes);
                Ok(Value::Float(f64::from_le_bytes(buf)))
            }
            TAG_STR => Ok(Value::Str(self.take_str()?)),
            TAG_BYTES => {
                let len = self.take_uvarint()?;
                Ok(Value::Bytes(self.take_slice(len)?.to_vec()))
            }
            TAG_ARRAY => {
                let len = self.take_uvarint()?;
                if len > MAX_LEN {
                    return Err(CodecError::LengthLimit(len));
                }
                let mut items = Vec::with_capacity(len.min(4096) as usize);
                for _ in 0..len {
                    items.push(self.take_value()?);
                }
                Ok(Value::Array(items))
            }
            TAG_OBJECT => {
                let len = self.take_uvarint()?;
                if len > MAX_LEN {
                    return Err(CodecError::LengthLimit(len));
                }
                let mut map = std::collections::BTreeMap::new();
                for _ in 0..len {
                    let key = self.take_str()?;
                    let item = self.take_value()?;
                    map.insert(key, item);
                }
                Ok(Value::Object(map))
            }
            tag => Err(CodecError::UnknownTag { tag, what: "value" }),
        }
    }

    fn take_patch(&mut self) -> Result<Patch, CodecError> {
        let op_tag = self.take_u8()?;
        let path_len = self.take_uvarint()?;
        if path_len > MAX_LEN {
            return Err(CodecError::LengthLimit(path_len));
        }
        let mut path = Vec::with_capacity(path_len.min(4096) as usize);
        for _ in 0..path_len {
            match self.take_u8()? {
                TOKEN_KEY => path.push(PathToken::Key(self.take_str()?)),
                TOKEN_INDEX => path.push(PathToken::Index(self.take_uvarint()? as usize)),
                tag => return Err(CodecError::UnknownTag { tag, what: "path token" }),
            }
        }
        let value_present = self.take_u8()? != 0;
        let value = if value_present {
            Some(self.take_value()?)
        } else {
            None
        };
        let op = match (op_tag, value) {
            (OP_ADD, Some(v)) => PatchOp::Add(v),
            (OP_REPLACE, Some(v)) => PatchOp::Replace(v),
            (OP_REMOVE, None) => PatchOp::Remove,
            (OP_ADD | OP_REPLACE, None) => {
                return Err(CodecError::UnknownTag {
                    tag: 0,
                    what: "missing value for add/replace",
                })
            }
            (OP_REMOVE, Some(_)) => {
                return Err(CodecError::UnknownTag {
                    tag: OP_REMOVE,
                    what: "unexpected value for remove",
                })
            }
            (tag, _) => return Err(CodecError::UnknownTag { tag, what: "op" }),
        };
        Ok(Patch { path, op })
    }
}
