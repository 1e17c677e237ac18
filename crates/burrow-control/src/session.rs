//! Tunnel session: one registered client connection

use crate::config::ControlConfig;
use crate::error::TunnelError;
use crate::pending_requests::{Delivery, PendingRequests};
use crate::writer::OutboundWriter;
use burrow_proto::{encode_request, ProxyRequest, ProxyResponse};
use burrow_transport::{Frame, FrameSink, TransportResult};
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Active,
            1 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// A registered tunnel connection and its in-flight request bookkeeping
pub struct TunnelSession {
    tunnel_id: String,
    /// Distinguishes this session from any later one under the same ID
    serial: u64,
    peer_addr: Option<SocketAddr>,
    connected_at: Instant,
    writer: OutboundWriter,
    pending: PendingRequests,
    state: AtomicU8,
    shutdown: CancellationToken,
    close_timeout: Duration,
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("tunnel_id", &self.tunnel_id)
            .field("serial", &self.serial)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl TunnelSession {
    pub fn new<K: FrameSink>(
        tunnel_id: String,
        sink: K,
        peer_addr: Option<SocketAddr>,
        config: &ControlConfig,
    ) -> Self {
        Self {
            tunnel_id,
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            peer_addr,
            connected_at: Instant::now(),
            writer: OutboundWriter::new(sink, config.write_timeout),
            pending: PendingRequests::new(config.max_pending),
            state: AtomicU8::new(SessionState::Active as u8),
            shutdown: CancellationToken::new(),
            close_timeout: config.health_probe_timeout,
        }
    }

    pub fn tunnel_id(&self) -> &str {
        &self.tunnel_id
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    pub fn uptime(&self) -> Duration {
        self.connected_at.elapsed()
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    pub fn is_active(&self) -> bool {
        self.state() == SessionState::Active
    }

    pub fn pending_count(&self) -> usize {
        self.pending.count()
    }

    pub fn has_pending(&self, request_id: &str) -> bool {
        self.pending.contains(request_id)
    }

    /// Serialise `request` and write it down the connection
    ///
    /// Serialisation failures are [`TunnelError::Internal`]; write failures
    /// are [`TunnelError::BadGateway`] and mean the connection is unusable.
    pub async fn submit_request(&self, request: &ProxyRequest) -> Result<(), TunnelError> {
        if !self.is_active() {
            return Err(TunnelError::SessionClosed("connection is closing".to_string()));
        }

        let text = encode_request(request).map_err(|e| TunnelError::Internal(e.to_string()))?;
        self.writer
            .send(Frame::Text(text))
            .await
            .map_err(|e| TunnelError::BadGateway(e.to_string()))
    }

    /// Insert a pending entry for `request_id`
    pub fn register_waiter(
        &self,
        request_id: &str,
    ) -> Result<oneshot::Receiver<Delivery>, TunnelError> {
        if !self.is_active() {
            return Err(TunnelError::SessionClosed("connection is closing".to_string()));
        }

        let rx = self.pending.register(request_id)?;

        // close() flips the state before draining, so an insert that raced
        // with it is either drained there or removed here.
        if !self.is_active() {
            self.pending.cancel(request_id);
            return Err(TunnelError::SessionClosed("connection is closing".to_string()));
        }
        Ok(rx)
    }

    /// Hand a response to its waiter; false if nobody is waiting for it
    pub fn deliver(&self, response: ProxyResponse) -> bool {
        let request_id = response.request_id.clone();
        self.pending.respond(&request_id, response)
    }

    /// Drop the pending entry for `request_id`, if still present
    pub fn cancel_waiter(&self, request_id: &str) -> bool {
        self.pending.cancel(request_id)
    }

    /// Liveness probe: one ping frame written within `deadline`
    pub async fn ping(&self, deadline: Duration) -> Result<(), TunnelError> {
        self.writer
            .send_within(Frame::Ping(Bytes::new()), deadline)
            .await
            .map_err(|e| TunnelError::HealthProbe(e.to_string()))
    }

    pub async fn pong(&self, payload: Bytes) -> TransportResult<()> {
        self.writer.send(Frame::Pong(payload)).await
    }

    /// Resolves once [`close`](Self::close) has started
    pub async fn closed(&self) {
        self.shutdown.cancelled().await
    }

    /// Close the connection and fail every pending request
    ///
    /// Idempotent: returns true only for the call that performed the close.
    pub async fn close(&self, reason: &str) -> bool {
        if self
            .state
            .compare_exchange(
                SessionState::Active as u8,
                SessionState::Closing as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }

        self.shutdown.cancel();
        let failed = self.pending.fail_all(reason);

        if let Err(e) = self.writer.close(self.close_timeout).await {
            debug!(
                "Close handshake for tunnel {} did not complete: {}",
                self.tunnel_id, e
            );
        }

        self.state.store(SessionState::Closed as u8, Ordering::SeqCst);
        info!(
            "Tunnel session {} closed: {} ({} pending requests failed)",
            self.tunnel_id, reason, failed
        );
        true
    }
}
