//! Tunnel connection handler
//!
//! Drives one upgraded connection through its whole life: the registration
//! handshake, the read loop that routes responses back to waiting callers,
//! and teardown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use burrow_proto::{decode_registration, decode_response, encode_error};
use burrow_transport::{Frame, FrameSink, FrameSource, TransportError, TransportResult};

use crate::config::ControlConfig;
use crate::error::TunnelError;
use crate::registry::TunnelRegistry;
use crate::session::TunnelSession;

/// Lifecycle of one inbound connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Registering,
    Active,
    Closing,
    Closed,
}

/// How a connection's handling ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// Registration failed; no session was created
    Rejected(TunnelError),
    /// The session ran and was torn down for the given reason
    Finished { tunnel_id: String, reason: String },
}

/// Handles tunnel connections from clients
pub struct ConnectionHandler {
    registry: Arc<TunnelRegistry>,
    config: ControlConfig,
}

struct Tracker {
    peer: String,
    state: ConnectionState,
}

impl Tracker {
    fn transition(&mut self, next: ConnectionState) {
        debug!("Connection {}: {:?} -> {:?}", self.peer, self.state, next);
        self.state = next;
    }
}

impl ConnectionHandler {
    pub fn new(registry: Arc<TunnelRegistry>, config: ControlConfig) -> Self {
        Self { registry, config }
    }

    pub fn registry(&self) -> &Arc<TunnelRegistry> {
        &self.registry
    }

    /// Run a connection to completion
    ///
    /// Returns once the session has been removed from the registry and
    /// closed, or immediately after a failed registration.
    pub async fn handle_connection<K, S>(
        &self,
        mut sink: K,
        mut source: S,
        peer_addr: Option<SocketAddr>,
    ) -> ConnectionOutcome
    where
        K: FrameSink,
        S: FrameSource,
    {
        let mut tracker = Tracker {
            peer: peer_addr
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "unknown".to_string()),
            state: ConnectionState::Connecting,
        };
        info!("New tunnel connection from {}", tracker.peer);

        tracker.transition(ConnectionState::Registering);
        let tunnel_id =
            match read_registration(&mut source, self.config.registration_timeout).await {
                Ok(tunnel_id) => tunnel_id,
                Err(e) => {
                    warn!("Rejecting connection from {}: {}", tracker.peer, e);
                    tracker.transition(ConnectionState::Closing);
                    reject(&mut sink, &e, self.config.health_probe_timeout).await;
                    tracker.transition(ConnectionState::Closed);
                    return ConnectionOutcome::Rejected(e);
                }
            };

        let session = Arc::new(TunnelSession::new(
            tunnel_id.clone(),
            sink,
            peer_addr,
            &self.config,
        ));
        if let Some(previous) = self.registry.register(session.clone()) {
            previous.close("replaced by new connection").await;
        }
        tracker.transition(ConnectionState::Active);
        info!("Tunnel {} active (peer {})", tunnel_id, tracker.peer);

        let reason = self.read_loop(&session, &mut source).await;

        tracker.transition(ConnectionState::Closing);
        self.registry.terminate(&session, &reason).await;
        tracker.transition(ConnectionState::Closed);

        ConnectionOutcome::Finished { tunnel_id, reason }
    }

    /// Route inbound frames until the connection ends or the session is
    /// closed from elsewhere. Returns the teardown reason.
    async fn read_loop<S: FrameSource>(&self, session: &TunnelSession, source: &mut S) -> String {
        let tunnel_id = session.tunnel_id();
        loop {
            let frame = tokio::select! {
                _ = session.closed() => return "session closed".to_string(),
                frame = source.recv() => frame,
            };

            match frame {
                Ok(Some(Frame::Text(text))) => self.route_response(session, text.as_bytes()),
                Ok(Some(Frame::Binary(data))) => self.route_response(session, &data),
                Ok(Some(Frame::Ping(payload))) => {
                    trace!("Ping from tunnel {}", tunnel_id);
                    // WebSocket servers may queue their own pong too; RFC 6455 allows the duplicate
                    if let Err(e) = session.pong(payload).await {
                        error!("Failed to answer ping from tunnel {}: {}", tunnel_id, e);
                        return "pong write failed".to_string();
                    }
                }
                Ok(Some(Frame::Pong(_))) => {
                    trace!("Pong from tunnel {}", tunnel_id);
                }
                Ok(Some(Frame::Close(reason))) => {
                    info!(
                        "Tunnel {} sent close: {}",
                        tunnel_id,
                        reason.as_deref().unwrap_or("no reason")
                    );
                    return "client closed connection".to_string();
                }
                Ok(None) => {
                    info!("Tunnel {} connection ended", tunnel_id);
                    return "connection ended".to_string();
                }
                Err(e) => {
                    error!("Read error on tunnel {}: {}", tunnel_id, e);
                    return format!("read error: {}", e);
                }
            }
        }
    }

    fn route_response(&self, session: &TunnelSession, payload: &[u8]) {
        match decode_response(payload) {
            Ok(response) => {
                let request_id = response.request_id.clone();
                if !session.deliver(response) {
                    warn!(
                        "Dropping response for unknown request {} on tunnel {}",
                        request_id,
                        session.tunnel_id()
                    );
                }
            }
            Err(e) => {
                warn!(
                    "Invalid response from tunnel {}: {}",
                    session.tunnel_id(),
                    e
                );
            }
        }
    }
}

/// Read the registration frame, skipping keepalives
async fn read_registration<S: FrameSource>(
    source: &mut S,
    deadline: Duration,
) -> Result<String, TunnelError> {
    let read = async {
        loop {
            let payload = match source.recv().await {
                Ok(Some(Frame::Text(text))) => text.into_bytes(),
                Ok(Some(Frame::Binary(data))) => data.to_vec(),
                Ok(Some(Frame::Ping(_))) | Ok(Some(Frame::Pong(_))) => continue,
                Ok(Some(Frame::Close(_))) | Ok(None) => {
                    return Err(TunnelError::Registration(
                        "connection closed before registration".to_string(),
                    ))
                }
                Err(e) => return Err(TunnelError::Registration(e.to_string())),
            };

            return decode_registration(&payload)
                .map(|message| message.tunnel_id)
                .map_err(|e| TunnelError::Registration(e.to_string()));
        }
    };

    tokio::time::timeout(deadline, read)
        .await
        .map_err(|_| TunnelError::Registration(format!("no registration within {:?}", deadline)))?
}

/// Best-effort error reply followed by close
async fn reject<K: FrameSink>(sink: &mut K, error: &TunnelError, deadline: Duration) {
    let reason = match error {
        TunnelError::Registration(reason) => reason.clone(),
        other => other.to_string(),
    };

    let result: TransportResult<()> = async {
        if let Ok(text) = encode_error(&format!("Send tunnelId first: {}", reason)) {
            tokio::time::timeout(deadline, sink.send(Frame::Text(text)))
                .await
                .map_err(|_| TransportError::Timeout)??;
        }
        tokio::time::timeout(deadline, sink.close())
            .await
            .map_err(|_| TransportError::Timeout)?
    }
    .await;

    if let Err(e) = result {
        debug!("Could not deliver registration error: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::ProxyRequest;
    use burrow_transport::memory::{self, MemoryPeer};
    use bytes::Bytes;

    fn handler() -> ConnectionHandler {
        ConnectionHandler::new(Arc::new(TunnelRegistry::new()), ControlConfig::default())
    }

    fn spawn_connection(
        handler: &Arc<ConnectionHandler>,
    ) -> (tokio::task::JoinHandle<ConnectionOutcome>, MemoryPeer) {
        let (sink, source, peer) = memory::duplex(32);
        let handler = handler.clone();
        let task =
            tokio::spawn(async move { handler.handle_connection(sink, source, None).await });
        (task, peer)
    }

    async fn wait_for_tunnel(registry: &TunnelRegistry, tunnel_id: &str) -> Arc<TunnelSession> {
        for _ in 0..100 {
            if let Some(session) = registry.lookup(tunnel_id) {
                return session;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("tunnel {} never registered", tunnel_id);
    }

    #[tokio::test]
    async fn test_registration_and_response_routing() {
        let handler = Arc::new(handler());
        let (task, mut peer) = spawn_connection(&handler);

        peer.send_text(r#"{"tunnelId":"abc"}"#).await.unwrap();
        let session = wait_for_tunnel(handler.registry(), "abc").await;

        let rx = session.register_waiter("r1").unwrap();
        peer.send_text(r#"{"requestId":"r1","statusCode":204,"headers":{}}"#)
            .await
            .unwrap();
        assert_eq!(rx.await.unwrap().unwrap().status_code, 204);

        peer.disconnect();
        let outcome = task.await.unwrap();
        assert_eq!(
            outcome,
            ConnectionOutcome::Finished {
                tunnel_id: "abc".to_string(),
                reason: "connection ended".to_string(),
            }
        );
        assert!(handler.registry().lookup("abc").is_none());
    }

    #[tokio::test]
    async fn test_invalid_registration_is_rejected() {
        let handler = Arc::new(handler());
        let (task, mut peer) = spawn_connection(&handler);

        peer.send_text(r#"{"hello":"world"}"#).await.unwrap();

        let reply = peer.recv_text().await.unwrap();
        assert!(reply.starts_with(r#"{"error":"Send tunnelId first"#));
        assert!(matches!(
            task.await.unwrap(),
            ConnectionOutcome::Rejected(TunnelError::Registration(_))
        ));
        assert!(peer.is_closed_by_relay());
        assert_eq!(handler.registry().count(), 0);
    }

    #[tokio::test]
    async fn test_empty_tunnel_id_is_rejected() {
        let handler = Arc::new(handler());
        let (task, peer) = spawn_connection(&handler);

        peer.send_text(r#"{"tunnelId":""}"#).await.unwrap();
        assert!(matches!(
            task.await.unwrap(),
            ConnectionOutcome::Rejected(_)
        ));
        assert_eq!(handler.registry().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registration_timeout() {
        let handler = Arc::new(handler());
        let (task, _peer) = spawn_connection(&handler);

        let outcome = task.await.unwrap();
        match outcome {
            ConnectionOutcome::Rejected(TunnelError::Registration(reason)) => {
                assert!(reason.contains("no registration"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_keepalive_before_registration_is_skipped() {
        let handler = Arc::new(handler());
        let (_task, peer) = spawn_connection(&handler);

        peer.send(Frame::Ping(Bytes::new())).await.unwrap();
        peer.send_text(r#"{"tunnelId":"early"}"#).await.unwrap();
        wait_for_tunnel(handler.registry(), "early").await;
    }

    #[tokio::test]
    async fn test_ping_answered_with_pong() {
        let handler = Arc::new(handler());
        let (_task, mut peer) = spawn_connection(&handler);

        peer.send_text(r#"{"tunnelId":"pinger"}"#).await.unwrap();
        wait_for_tunnel(handler.registry(), "pinger").await;

        peer.send(Frame::Ping(Bytes::from_static(b"hi"))).await.unwrap();
        assert_eq!(
            peer.recv().await,
            Some(Frame::Pong(Bytes::from_static(b"hi")))
        );
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_session() {
        let handler = Arc::new(handler());
        let (_task, peer) = spawn_connection(&handler);

        peer.send_text(r#"{"tunnelId":"sturdy"}"#).await.unwrap();
        let session = wait_for_tunnel(handler.registry(), "sturdy").await;
        let rx = session.register_waiter("ok").unwrap();

        peer.send_text("not json").await.unwrap();
        peer.send_text(r#"{"requestId":"","statusCode":200}"#).await.unwrap();
        peer.send_text(r#"{"requestId":"unknown","statusCode":200}"#)
            .await
            .unwrap();
        peer.send_text(r#"{"requestId":"ok","statusCode":200}"#)
            .await
            .unwrap();

        assert_eq!(rx.await.unwrap().unwrap().request_id, "ok");
        assert!(session.is_active());
    }

    #[tokio::test]
    async fn test_reregistration_closes_previous_session() {
        let handler = Arc::new(handler());
        let (first_task, first_peer) = spawn_connection(&handler);
        first_peer.send_text(r#"{"tunnelId":"dup"}"#).await.unwrap();
        let first = wait_for_tunnel(handler.registry(), "dup").await;
        let pending = first.register_waiter("stuck").unwrap();

        let (_second_task, second_peer) = spawn_connection(&handler);
        second_peer.send_text(r#"{"tunnelId":"dup"}"#).await.unwrap();

        assert!(matches!(
            pending.await.unwrap(),
            Err(TunnelError::SessionClosed(_))
        ));
        assert!(matches!(
            first_task.await.unwrap(),
            ConnectionOutcome::Finished { .. }
        ));

        let current = handler.registry().lookup("dup").unwrap();
        assert_ne!(current.serial(), first.serial());
        assert!(current.is_active());
    }

    #[tokio::test]
    async fn test_read_error_tears_down() {
        let handler = Arc::new(handler());
        let (task, peer) = spawn_connection(&handler);

        peer.send_text(r#"{"tunnelId":"flaky"}"#).await.unwrap();
        let session = wait_for_tunnel(handler.registry(), "flaky").await;
        let rx = session.register_waiter("r1").unwrap();

        peer.inject_read_error(TransportError::ConnectionError("reset".to_string()))
            .await
            .unwrap();

        assert!(matches!(
            task.await.unwrap(),
            ConnectionOutcome::Finished { .. }
        ));
        assert!(rx.await.unwrap().is_err());
        assert!(handler.registry().lookup("flaky").is_none());
    }

    #[tokio::test]
    async fn test_requests_reach_client() {
        let handler = Arc::new(handler());
        let (_task, mut peer) = spawn_connection(&handler);

        peer.send_text(r#"{"tunnelId":"echo"}"#).await.unwrap();
        let session = wait_for_tunnel(handler.registry(), "echo").await;

        let request = ProxyRequest {
            request_id: "r9".to_string(),
            method: "POST".to_string(),
            url: "/echo/items".to_string(),
            headers: Default::default(),
            body: b"payload".to_vec(),
        };
        session.submit_request(&request).await.unwrap();

        let sent: ProxyRequest = serde_json::from_str(&peer.recv_text().await.unwrap()).unwrap();
        assert_eq!(sent, request);
    }
}
