//! In-process duplex connection
//!
//! [`duplex`] returns the relay's two halves plus a [`MemoryPeer`] that plays
//! the remote client. The peer can make the relay's writes fail or stall,
//! which is how broken pipes and unresponsive clients are reproduced without
//! a socket.

use crate::{Frame, FrameSink, FrameSource, TransportError, TransportResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct Shared {
    fail_writes: AtomicBool,
    stall_writes: AtomicBool,
    closed: AtomicBool,
}

/// Create a connected in-memory duplex; `capacity` bounds each direction
pub fn duplex(capacity: usize) -> (MemorySink, MemorySource, MemoryPeer) {
    let (to_peer_tx, to_peer_rx) = mpsc::channel(capacity);
    let (to_relay_tx, to_relay_rx) = mpsc::channel(capacity);
    let shared = Arc::new(Shared::default());

    (
        MemorySink {
            tx: to_peer_tx,
            shared: shared.clone(),
        },
        MemorySource { rx: to_relay_rx },
        MemoryPeer {
            tx: Some(to_relay_tx),
            rx: to_peer_rx,
            shared,
        },
    )
}

/// Relay-side write half
pub struct MemorySink {
    tx: mpsc::Sender<Frame>,
    shared: Arc<Shared>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> TransportResult<()> {
        if self.shared.stall_writes.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.shared.fail_writes.load(Ordering::SeqCst) {
            return Err(TransportError::IoError(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "broken pipe",
            )));
        }
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.tx
            .send(frame)
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> TransportResult<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _ = self.tx.try_send(Frame::Close(None));
        Ok(())
    }
}

/// Relay-side read half
pub struct MemorySource {
    rx: mpsc::Receiver<TransportResult<Frame>>,
}

#[async_trait]
impl FrameSource for MemorySource {
    async fn recv(&mut self) -> TransportResult<Option<Frame>> {
        match self.rx.recv().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// The remote end of an in-memory connection
pub struct MemoryPeer {
    tx: Option<mpsc::Sender<TransportResult<Frame>>>,
    rx: mpsc::Receiver<Frame>,
    shared: Arc<Shared>,
}

impl MemoryPeer {
    /// Deliver a frame to the relay's read half
    pub async fn send(&self, frame: Frame) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(Ok(frame))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    pub async fn send_text(&self, text: impl Into<String>) -> TransportResult<()> {
        self.send(Frame::Text(text.into())).await
    }

    /// Make the relay's next read fail with `error`
    pub async fn inject_read_error(&self, error: TransportError) -> TransportResult<()> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(Err(error))
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Next frame written by the relay, `None` once the write half is gone
    pub async fn recv(&mut self) -> Option<Frame> {
        self.rx.recv().await
    }

    /// Next text frame written by the relay, skipping control frames
    pub async fn recv_text(&mut self) -> Option<String> {
        loop {
            match self.rx.recv().await? {
                Frame::Text(text) => return Some(text),
                Frame::Close(_) => return None,
                _ => continue,
            }
        }
    }

    /// Go away without a close handshake; the relay reads end-of-stream
    pub fn disconnect(&mut self) {
        self.tx = None;
    }

    /// Every subsequent relay write fails with a broken pipe
    pub fn fail_writes(&self) {
        self.shared.fail_writes.store(true, Ordering::SeqCst);
    }

    /// Every subsequent relay write blocks forever
    pub fn stall_writes(&self) {
        self.shared.stall_writes.store(true, Ordering::SeqCst);
    }

    /// Whether the relay has closed its write half
    pub fn is_closed_by_relay(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_flow_both_ways() {
        let (mut sink, mut source, mut peer) = duplex(8);

        sink.send(Frame::text("to peer")).await.unwrap();
        assert_eq!(peer.recv().await, Some(Frame::text("to peer")));

        peer.send_text("to relay").await.unwrap();
        assert_eq!(source.recv().await.unwrap(), Some(Frame::text("to relay")));
    }

    #[tokio::test]
    async fn test_disconnect_reads_end_of_stream() {
        let (_sink, mut source, mut peer) = duplex(8);

        peer.disconnect();
        assert!(source.recv().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_read_error() {
        let (_sink, mut source, peer) = duplex(8);

        peer.inject_read_error(TransportError::Timeout).await.unwrap();
        assert!(matches!(source.recv().await, Err(TransportError::Timeout)));
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let (mut sink, _source, peer) = duplex(8);

        peer.fail_writes();
        assert!(matches!(
            sink.send(Frame::text("x")).await,
            Err(TransportError::IoError(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stall_writes() {
        let (mut sink, _source, peer) = duplex(8);

        peer.stall_writes();
        let result = tokio::time::timeout(
            std::time::Duration::from_secs(1),
            sink.send(Frame::text("x")),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (mut sink, _source, mut peer) = duplex(8);

        sink.close().await.unwrap();
        sink.close().await.unwrap();

        assert!(peer.is_closed_by_relay());
        assert_eq!(peer.recv().await, Some(Frame::Close(None)));
        assert!(matches!(
            sink.send(Frame::text("late")).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
