// SPDX-License-Identifier: Apache-2.0
//! Programmatic client for the Drift hub.
//!
//! Wraps a framed transport with the handshake, subscription bookkeeping,
//! and per-document replica maintenance: snapshots replace the local copy,
//! incrementals are applied in order, and a revision gap is an error rather
//! than silent divergence. Pings are answered automatically inside
//! [`DriftClient::recv`]. Tools and integration tests drive this; the hub
//! itself never depends on it.

use drift_core::codec::EncodeOptions;
use drift_core::{apply, BatchKind, PatchBatch, PatchError, PatchOp, Revision, Value};
use drift_proto::transport::{self, BoxedReader, BoxedWriter};
use drift_proto::{
    wire, Encoding, Hello, Message, Welcome, CAP_FAST_PATCH, PROTOCOL_VERSION,
};
use std::collections::HashMap;
use thiserror::Error;
use tokio::net::TcpStream;
use tracing::debug;

/// Client-side failure.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Transport I/O failed.
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    /// Server closed the stream mid-handshake or mid-batch.
    #[error("connection closed")]
    Closed,
    /// A frame failed to decode.
    #[error("wire error: {0}")]
    Wire(#[from] drift_proto::wire::WireError),
    /// The server answered the Hello with something other than Welcome.
    #[error("unexpected handshake reply: {0}")]
    Handshake(&'static str),
    /// An incremental batch did not line up with the local replica.
    #[error("revision gap for {document}: have {have}, batch base {base}")]
    RevisionGap {
        /// Document name.
        document: String,
        /// Local replica revision.
        have: Revision,
        /// Base revision the batch expected.
        base: Revision,
    },
    /// A batch failed to apply to the local replica.
    #[error("apply failed: {0}")]
    Apply(#[from] PatchError),
}

/// Local copy of one subscribed document.
#[derive(Debug)]
struct Replica {
    state: Value,
    revision: Revision,
}

/// A connected client session.
pub struct DriftClient {
    reader: BoxedReader,
    writer: BoxedWriter,
    encoding: Encoding,
    session_id: Option<u64>,
    capabilities: Vec<String>,
    replicas: HashMap<String, Replica>,
}

impl DriftClient {
    /// Wraps explicit transport halves (in-memory pairs in tests, bridged
    /// channels in tools).
    pub fn over(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader,
            writer,
            encoding: Encoding::Json,
            session_id: None,
            capabilities: Vec::new(),
            replicas: HashMap::new(),
        }
    }

    /// Connects over TCP to `addr` (the hub's length-prefixed framing).
    pub async fn connect_tcp(addr: &str) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        let (reader, writer) = transport::tcp_split(stream);
        Ok(Self::over(reader, writer))
    }

    /// Runs the Hello/Welcome exchange, offering `capabilities`.
    pub async fn hello(
        &mut self,
        capabilities: Vec<String>,
        auth_token: Option<String>,
    ) -> Result<Welcome, ClientError> {
        self.send(Message::Hello(Hello {
            protocol_version: PROTOCOL_VERSION,
            capabilities,
            auth_token,
        }))
        .await?;

        match self.recv_raw().await? {
            Some(Message::Welcome(welcome)) => {
                if welcome.capabilities.iter().any(|c| c == CAP_FAST_PATCH) {
                    self.encoding = Encoding::FastBinary;
                }
                self.session_id = Some(welcome.session_id);
                self.capabilities = welcome.capabilities.clone();
                debug!(session = welcome.session_id, encoding = ?self.encoding, "handshake complete");
                Ok(welcome)
            }
            Some(Message::Goodbye { .. }) => Err(ClientError::Handshake("goodbye")),
            Some(_) => Err(ClientError::Handshake("unexpected frame")),
            None => Err(ClientError::Closed),
        }
    }

    /// Session id assigned by the server, once the handshake is done.
    pub fn session_id(&self) -> Option<u64> {
        self.session_id
    }

    /// Capabilities the server granted.
    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    /// Subscribes to `document`. Batches start arriving via [`Self::recv`].
    pub async fn subscribe(&mut self, document: &str) -> Result<(), ClientError> {
        self.send(Message::Subscribe {
            document: document.to_owned(),
        })
        .await
    }

    /// Drops the subscription and the local replica.
    pub async fn unsubscribe(&mut self, document: &str) -> Result<(), ClientError> {
        self.replicas.remove(document);
        self.send(Message::Unsubscribe {
            document: document.to_owned(),
        })
        .await
    }

    /// Requests a one-off snapshot (requires the "sync" capability).
    pub async fn sync_request(&mut self, document: &str) -> Result<(), ClientError> {
        self.send(Message::SyncRequest {
            document: document.to_owned(),
        })
        .await
    }

    /// Sends an application payload.
    pub async fn send_message(&mut self, payload: Value) -> Result<(), ClientError> {
        self.send(Message::ClientMessage { payload }).await
    }

    /// Announces departure.
    pub async fn goodbye(&mut self, reason: drift_proto::GoodbyeReason) -> Result<(), ClientError> {
        self.send(Message::Goodbye { reason }).await
    }

    /// Next message from the server, with patch batches already applied to
    /// the local replica and pings answered transparently. Returns `None`
    /// on clean stream end.
    pub async fn recv(&mut self) -> Result<Option<Message>, ClientError> {
        loop {
            let Some(msg) = self.recv_raw().await? else {
                return Ok(None);
            };
            match msg {
                Message::Ping { nonce } => {
                    self.send(Message::Pong { nonce }).await?;
                    continue;
                }
                Message::Patch(ref batch) => {
                    self.ingest(batch)?;
                    return Ok(Some(msg));
                }
                other => return Ok(Some(other)),
            }
        }
    }

    /// Waits for the next batch of `document`, skipping unrelated messages.
    pub async fn next_batch(&mut self, document: &str) -> Result<PatchBatch, ClientError> {
        loop {
            match self.recv().await? {
                Some(Message::Patch(batch)) if batch.document == document => return Ok(batch),
                Some(_) => continue,
                None => return Err(ClientError::Closed),
            }
        }
    }

    /// Current replica of `document`, if any batch has arrived.
    pub fn replica(&self, document: &str) -> Option<&Value> {
        self.replicas.get(document).map(|replica| &replica.state)
    }

    /// Replica revision of `document`.
    pub fn revision(&self, document: &str) -> Option<Revision> {
        self.replicas.get(document).map(|replica| replica.revision)
    }

    /// Applies one batch to the local replica.
    fn ingest(&mut self, batch: &PatchBatch) -> Result<(), ClientError> {
        match batch.kind {
            BatchKind::Snapshot => {
                // A snapshot is a single root Replace with the full state.
                let state = match batch.ops.first().map(|op| &op.op) {
                    Some(PatchOp::Replace(value) | PatchOp::Add(value)) => value.clone(),
                    _ => Value::empty_object(),
                };
                self.replicas.insert(
                    batch.document.clone(),
                    Replica {
                        state,
                        revision: batch.new_revision,
                    },
                );
            }
            BatchKind::Incremental => {
                let replica = self.replicas.entry(batch.document.clone()).or_insert(Replica {
                    state: Value::empty_object(),
                    revision: 0,
                });
                if replica.revision != batch.base_revision {
                    return Err(ClientError::RevisionGap {
                        document: batch.document.clone(),
                        have: replica.revision,
                        base: batch.base_revision,
                    });
                }
                apply(&mut replica.state, &batch.ops)?;
                replica.revision = batch.new_revision;
            }
        }
        Ok(())
    }

    async fn send(&mut self, msg: Message) -> Result<(), ClientError> {
        let bytes = wire::encode_message(&msg, self.encoding, &EncodeOptions::default());
        self.writer.send(&bytes).await?;
        Ok(())
    }

    async fn recv_raw(&mut self) -> Result<Option<Message>, ClientError> {
        let Some(payload) = self.reader.recv().await? else {
            return Ok(None);
        };
        let encoding = wire::detect_encoding(&payload);
        Ok(Some(wire::decode_message(&payload, encoding)?))
    }
}
