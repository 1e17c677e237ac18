//! Serialised writes to a tunnel connection
//!
//! A WebSocket tolerates one writer at a time. Every outbound frame for a
//! session (proxy requests, pings, pongs, the close handshake) goes through
//! one [`OutboundWriter`], whose mutex is held for exactly one frame.

use burrow_transport::{Frame, FrameSink, TransportError, TransportResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::trace;

pub struct OutboundWriter {
    sink: Mutex<Box<dyn FrameSink>>,
    closed: AtomicBool,
    write_timeout: Duration,
}

impl OutboundWriter {
    pub fn new<K: FrameSink>(sink: K, write_timeout: Duration) -> Self {
        Self {
            sink: Mutex::new(Box::new(sink)),
            closed: AtomicBool::new(false),
            write_timeout,
        }
    }

    /// Write one frame within the default write timeout
    pub async fn send(&self, frame: Frame) -> TransportResult<()> {
        self.send_within(frame, self.write_timeout).await
    }

    /// Write one frame; `deadline` covers waiting for the lock and the write
    pub async fn send_within(&self, frame: Frame, deadline: Duration) -> TransportResult<()> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        tokio::time::timeout(deadline, async {
            let mut sink = self.sink.lock().await;
            if self.is_closed() {
                return Err(TransportError::ConnectionClosed);
            }
            trace!("Writing {} frame", frame_kind(&frame));
            sink.send(frame).await
        })
        .await
        .map_err(|_| TransportError::Timeout)?
    }

    /// Close the write half. Only the first call does anything; later writes
    /// fail with [`TransportError::ConnectionClosed`].
    pub async fn close(&self, deadline: Duration) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        tokio::time::timeout(deadline, async { self.sink.lock().await.close().await })
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn frame_kind(frame: &Frame) -> &'static str {
    match frame {
        Frame::Text(_) => "text",
        Frame::Binary(_) => "binary",
        Frame::Ping(_) => "ping",
        Frame::Pong(_) => "pong",
        Frame::Close(_) => "close",
    }
}
