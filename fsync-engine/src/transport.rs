//! Transport seam for sync sessions.
//!
//! A session only needs a reliable, ordered, bidirectional frame pipe; how
//! the bytes move is the caller's business. [`StreamTransport`] adapts any
//! tokio byte stream, [`memory_pair`] wires two in-process endpoints together
//! for tests and same-process sync.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::trace;

use fsync_shared::{Message, MAX_FRAME_SIZE};

use crate::errors::{Result, SyncError};

/// Reliable, ordered frame pipe between the two sides of a session.
#[async_trait]
pub trait Transport: Send {
    /// Send one complete frame.
    async fn send(&mut self, frame: Bytes) -> Result<()>;

    /// Receive the next complete frame.
    async fn recv(&mut self) -> Result<Bytes>;

    /// Close the transport. Further operations fail.
    async fn close(&mut self) -> Result<()>;
}

/// Encode and send one protocol message.
pub async fn send_message(transport: &mut dyn Transport, message: &Message) -> Result<()> {
    trace!("send {:?}", message.kind());
    transport.send(message.encode()?).await
}

/// Receive and decode the next protocol message.
pub async fn recv_message(transport: &mut dyn Transport) -> Result<Message> {
    let frame = transport.recv().await?;
    let message = Message::decode(&frame)?;
    trace!("recv {:?}", message.kind());
    Ok(message)
}

/// Transport over any tokio byte stream, e.g. a TCP or TLS connection.
///
/// Frames already carry their own length prefix; reading re-parses it to
/// find the frame boundary in the stream.
pub struct StreamTransport<S> {
    stream: S,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl<S> Transport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        self.stream
            .write_all(&frame)
            .await
            .map_err(|e| SyncError::Transport(format!("write failed: {e}")))?;
        self.stream
            .flush()
            .await
            .map_err(|e| SyncError::Transport(format!("flush failed: {e}")))
    }

    async fn recv(&mut self) -> Result<Bytes> {
        let mut prefix = [0u8; 4];
        self.stream
            .read_exact(&mut prefix)
            .await
            .map_err(|e| SyncError::Transport(format!("connection lost: {e}")))?;

        let body_len = u32::from_be_bytes(prefix) as usize;
        if body_len > MAX_FRAME_SIZE {
            return Err(SyncError::Protocol(format!(
                "frame of {body_len} bytes exceeds limit"
            )));
        }

        let mut frame = vec![0u8; 4 + body_len];
        frame[..4].copy_from_slice(&prefix);
        self.stream
            .read_exact(&mut frame[4..])
            .await
            .map_err(|e| SyncError::Transport(format!("connection lost: {e}")))?;
        Ok(Bytes::from(frame))
    }

    async fn close(&mut self) -> Result<()> {
        self.stream
            .shutdown()
            .await
            .map_err(|e| SyncError::Transport(format!("shutdown failed: {e}")))
    }
}

/// In-process transport endpoint backed by channels.
pub struct MemoryTransport {
    tx: Option<mpsc::Sender<Bytes>>,
    rx: mpsc::Receiver<Bytes>,
}

/// Create a connected pair of in-memory endpoints.
pub fn memory_pair() -> (MemoryTransport, MemoryTransport) {
    let (a_tx, a_rx) = mpsc::channel(64);
    let (b_tx, b_rx) = mpsc::channel(64);
    (
        MemoryTransport {
            tx: Some(a_tx),
            rx: b_rx,
        },
        MemoryTransport {
            tx: Some(b_tx),
            rx: a_rx,
        },
    )
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&mut self, frame: Bytes) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| SyncError::Transport("transport closed".to_string()))?;
        tx.send(frame)
            .await
            .map_err(|_| SyncError::Transport("peer disconnected".to_string()))
    }

    async fn recv(&mut self) -> Result<Bytes> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| SyncError::Transport("peer disconnected".to_string()))
    }

    async fn close(&mut self) -> Result<()> {
        self.tx.take();
        Ok(())
    }
}
