// SPDX-License-Identifier: Apache-2.0
//! Server-side error taxonomy.
//!
//! Propagation boundaries: an error on one session never touches another
//! session; an error in one document never touches another document; a hook
//! failure never aborts the tick that invoked it. The only fatal error is
//! losing the listening transport.

use drift_proto::wire::WireError;
use thiserror::Error;

/// Failure classes inside the hub.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Framing, codec, or I/O failure on one session.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// Malformed or out-of-order control message.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// The auth hook rejected a Hello or Subscribe.
    #[error("auth denied")]
    AuthDenied,
    /// Internal diff/apply inconsistency; forces a resync and is a bug.
    #[error("patch conflict: {0}")]
    PatchConflict(#[from] drift_core::PatchError),
    /// Store I/O failure or version conflict; retried, never fatal to the
    /// document.
    #[error("persistence error: {0}")]
    Persistence(#[from] drift_store::StoreError),
    /// An application hook failed; swallowed after logging.
    #[error("hook error: {0}")]
    Hook(String),
    /// Session missed two heartbeat replies.
    #[error("heartbeat timeout")]
    HeartbeatTimeout,
}

impl From<WireError> for ServerError {
    fn from(err: WireError) -> Self {
        ServerError::Protocol(err.to_string())
    }
}
