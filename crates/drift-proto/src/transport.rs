// SPDX-License-Identifier: Apache-2.0
//! Framed transport abstraction.
//!
//! The hub sees every transport as an ordered, reliable, duplex stream of
//! whole frames. TCP (with the `u32` length prefix from `drift-proto`) is
//! the primary transport; the WebSocket gateway and any peer-to-peer data
//! channel bridge into the same TCP framing, so nothing in the core
//! distinguishes them. The in-memory pair exists for tests and supports
//! pausing the write side to provoke backpressure.

use async_trait::async_trait;
use crate::frame;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};

/// Receives whole frame payloads, in order.
#[async_trait]
pub trait FrameReader: Send {
    /// Next frame payload, or `None` on clean end-of-stream.
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>>;
}

/// Sends whole frame payloads, in order.
#[async_trait]
pub trait FrameWriter: Send {
    /// Blocks until the transport can take another frame. The session's
    /// writer calls this before committing to a frame so a stalled
    /// transport never holds a frame hostage across a resync.
    async fn ready(&mut self) {}

    /// Writes one frame payload.
    async fn send(&mut self, payload: &[u8]) -> io::Result<()>;
}

/// Boxed transport halves handed to a session.
pub type BoxedReader = Box<dyn FrameReader>;
/// Boxed writer half.
pub type BoxedWriter = Box<dyn FrameWriter>;

// --- TCP ------------------------------------------------------------------

/// Splits a TCP stream into framed halves.
pub fn tcp_split(stream: TcpStream) -> (BoxedReader, BoxedWriter) {
    let (read, write) = stream.into_split();
    (
        Box::new(TcpFrameReader {
            read,
            buf: vec![0u8; 16 * 1024],
            acc: Vec::with_capacity(32 * 1024),
        }),
        Box::new(TcpFrameWriter { write }),
    )
}

struct TcpFrameReader {
    read: OwnedReadHalf,
    buf: Vec<u8>,
    acc: Vec<u8>,
}

#[async_trait]
impl FrameReader for TcpFrameReader {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        loop {
            match frame::try_extract(&mut self.acc) {
                Ok(Some(payload)) => return Ok(Some(payload)),
                Ok(None) => {}
                Err(err) => return Err(io::Error::new(io::ErrorKind::InvalidData, err)),
            }
            let n = self.read.read(&mut self.buf).await?;
            if n == 0 {
                if self.acc.is_empty() {
                    return Ok(None);
                }
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended mid-frame",
                ));
            }
            self.acc.extend_from_slice(&self.buf[..n]);
        }
    }
}

struct TcpFrameWriter {
    write: OwnedWriteHalf,
}

#[async_trait]
impl FrameWriter for TcpFrameWriter {
    async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.write.write_all(&frame::encode(payload)).await
    }
}

// --- In-memory pair -------------------------------------------------------

/// Control handle for one direction of a memory transport.
#[derive(Clone)]
pub struct MemoryGate {
    paused: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl MemoryGate {
    fn new() -> Self {
        Self {
            paused: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Stalls the write side: `ready()` blocks until [`MemoryGate::resume`].
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Releases a paused write side.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    async fn wait(&self) {
        loop {
            if !self.paused.load(Ordering::SeqCst) {
                return;
            }
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so a concurrent resume() cannot
            // slip between the check and the await.
            notified.as_mut().enable();
            if !self.paused.load(Ordering::SeqCst) {
                return;
            }
            notified.await;
        }
    }
}

/// One endpoint of an in-memory duplex transport.
pub struct MemoryEndpoint {
    /// Reader half.
    pub reader: BoxedReader,
    /// Writer half.
    pub writer: BoxedWriter,
    /// Gate stalling this endpoint's writes.
    pub gate: MemoryGate,
}

/// Builds a connected pair of in-memory endpoints.
pub fn memory_pair() -> (MemoryEndpoint, MemoryEndpoint) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();
    let a_gate = MemoryGate::new();
    let b_gate = MemoryGate::new();
    (
        MemoryEndpoint {
            reader: Box::new(MemoryFrameReader { rx: b_rx }),
            writer: Box::new(MemoryFrameWriter {
                tx: a_tx,
                gate: a_gate.clone(),
            }),
            gate: a_gate,
        },
        MemoryEndpoint {
            reader: Box::new(MemoryFrameReader { rx: a_rx }),
            writer: Box::new(MemoryFrameWriter {
                tx: b_tx,
                gate: b_gate.clone(),
            }),
            gate: b_gate,
        },
    )
}

struct MemoryFrameReader {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameReader for MemoryFrameReader {
    async fn recv(&mut self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}

struct MemoryFrameWriter {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    gate: MemoryGate,
}

#[async_trait]
impl FrameWriter for MemoryFrameWriter {
    async fn ready(&mut self) {
        self.gate.wait().await;
    }

    async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.tx
            .send(payload.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_pair_delivers_frames_in_order() {
        let (mut a, mut b) = memory_pair();
        a.writer.send(b"one").await.unwrap();
        a.writer.send(b"two").await.unwrap();
        assert_eq!(b.reader.recv().await.unwrap().unwrap(), b"one");
        assert_eq!(b.reader.recv().await.unwrap().unwrap(), b"two");
    }

    #[tokio::test]
    async fn dropped_endpoint_reads_none() {
        let (a, mut b) = memory_pair();
        drop(a);
        assert!(b.reader.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn paused_gate_blocks_ready() {
        let (mut a, _b) = memory_pair();
        a.gate.pause();
        let gate = a.gate.clone();
        let unblocked = tokio::spawn(async move {
            a.writer.ready().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!unblocked.is_finished());
        gate.resume();
        tokio::time::timeout(std::time::Duration::from_secs(1), unblocked)
            .await
            .expect("ready released")
            .unwrap();
    }
}
