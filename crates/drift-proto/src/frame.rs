// SPDX-License-Identifier: Apache-2.0
//! Length-prefixed framing over a byte stream: `u32` big-endian payload
//! length, then the payload. One frame carries one encoded [`crate::Message`].

use thiserror::Error;

/// Frame header size in bytes.
pub const HEADER_BYTES: usize = 4;

/// Maximum payload a peer may declare.
pub const MAX_PAYLOAD: usize = 8 * 1024 * 1024;

/// Framing violation by the peer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// Declared payload length exceeded [`MAX_PAYLOAD`].
    #[error("declared payload of {0} bytes exceeds limit")]
    PayloadTooLarge(usize),
}

/// Prepends the length header to `payload`.
pub fn encode(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_BYTES + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

/// Drains one complete frame's payload from the front of `acc`, if present.
///
/// Returns `Ok(None)` while the accumulator holds only a partial frame;
/// errors leave the accumulator untouched so the caller can log and drop
/// the connection.
pub fn try_extract(acc: &mut Vec<u8>) -> Result<Option<Vec<u8>>, FrameError> {
    let Some(frame_len) = try_frame_len(acc)? else {
        return Ok(None);
    };
    if acc.len() < frame_len {
        return Ok(None);
    }
    let payload: Vec<u8> = acc.drain(..frame_len).skip(HEADER_BYTES).collect();
    Ok(Some(payload))
}

/// Total frame length (header + payload) declared by the buffered header,
/// or `None` while the header itself is incomplete.
fn try_frame_len(buf: &[u8]) -> Result<Option<usize>, FrameError> {
    if buf.len() < HEADER_BYTES {
        return Ok(None);
    }
    let payload_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(FrameError::PayloadTooLarge(payload_len));
    }
    Ok(Some(HEADER_BYTES + payload_len))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_drains_one_frame_and_preserves_remainder() {
        let f1 = encode(b"one");
        let f2 = encode(b"second");
        let mut acc = [f1, f2.clone()].concat();

        let p1 = try_extract(&mut acc).unwrap().expect("first frame");
        assert_eq!(p1, b"one");
        assert_eq!(acc, f2);

        let p2 = try_extract(&mut acc).unwrap().expect("second frame");
        assert_eq!(p2, b"second");
        assert!(acc.is_empty());
    }

    #[test]
    fn partial_header_yields_none() {
        let mut acc = vec![0u8; HEADER_BYTES - 1];
        assert_eq!(try_extract(&mut acc).unwrap(), None);
        assert_eq!(acc.len(), HEADER_BYTES - 1);
    }

    #[test]
    fn partial_payload_yields_none() {
        let full = encode(b"abc");
        let mut acc = full[..full.len() - 1].to_vec();
        assert_eq!(try_extract(&mut acc).unwrap(), None);
    }

    #[test]
    fn oversized_declaration_errors_without_draining() {
        let mut acc = ((MAX_PAYLOAD + 1) as u32).to_be_bytes().to_vec();
        let err = try_extract(&mut acc).unwrap_err();
        assert_eq!(err, FrameError::PayloadTooLarge(MAX_PAYLOAD + 1));
        assert_eq!(acc.len(), HEADER_BYTES);
    }

    #[test]
    fn empty_payload_round_trips() {
        let mut acc = encode(b"");
        assert_eq!(try_extract(&mut acc).unwrap(), Some(Vec::new()));
    }
}
