//! Transport abstraction layer for tunnel connections
//!
//! A tunnel connection is a message-oriented duplex stream (a WebSocket once
//! upgraded). It is split into a [`FrameSink`] for the single writer and a
//! [`FrameSource`] for the single reader, so the relay can own each half
//! independently.

pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// One frame on a tunnel connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Ping(Bytes),
    Pong(Bytes),
    /// Close handshake, with an optional human-readable reason
    Close(Option<String>),
}

impl Frame {
    pub fn text(text: impl Into<String>) -> Self {
        Frame::Text(text.into())
    }
}

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Write half of a tunnel connection
///
/// Implementations are not required to tolerate concurrent use; callers
/// serialise access.
#[async_trait]
pub trait FrameSink: Send + 'static {
    /// Write one complete frame
    async fn send(&mut self, frame: Frame) -> TransportResult<()>;

    /// Start the close handshake and release the write half
    async fn close(&mut self) -> TransportResult<()>;
}

/// Read half of a tunnel connection
#[async_trait]
pub trait FrameSource: Send + 'static {
    /// Next frame, or `Ok(None)` once the peer has gone away
    async fn recv(&mut self) -> TransportResult<Option<Frame>>;
}

#[async_trait]
impl FrameSink for Box<dyn FrameSink> {
    async fn send(&mut self, frame: Frame) -> TransportResult<()> {
        (**self).send(frame).await
    }

    async fn close(&mut self) -> TransportResult<()> {
        (**self).close().await
    }
}

#[async_trait]
impl FrameSource for Box<dyn FrameSource> {
    async fn recv(&mut self) -> TransportResult<Option<Frame>> {
        (**self).recv().await
    }
}
