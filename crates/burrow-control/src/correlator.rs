//! Request correlation over a tunnel session
//!
//! Each proxied request gets a fresh request ID, a pending entry on the
//! session, and one write down the connection; the caller then waits for
//! whichever comes first: the matching response or the timeout.
//! Requests on the same session are independent of each other: responses
//! may arrive in any order.

use crate::error::TunnelError;
use crate::pending_requests::Delivery;
use crate::registry::TunnelRegistry;
use crate::request_id::generate_request_id;
use crate::session::TunnelSession;
use burrow_proto::{ProxyRequest, ProxyResponse};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

/// Attempts at finding a request ID not already pending on the session
const REQUEST_ID_ATTEMPTS: usize = 3;

pub struct RequestCorrelator {
    registry: Arc<TunnelRegistry>,
    timeout: Duration,
}

/// Removes the pending entry when the waiting future is dropped, so an
/// abandoned caller does not hold a slot until the timeout.
struct WaiterGuard<'a> {
    session: &'a TunnelSession,
    request_id: String,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.session.cancel_waiter(&self.request_id);
    }
}

impl RequestCorrelator {
    pub fn new(registry: Arc<TunnelRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `request` down `session` and wait for its response
    ///
    /// `request.request_id` is overwritten with a freshly generated ID.
    /// A failed write tears the session down (it is removed from the
    /// registry and every other pending request on it fails).
    pub async fn forward(
        &self,
        session: &TunnelSession,
        mut request: ProxyRequest,
    ) -> Result<ProxyResponse, TunnelError> {
        let (request_id, rx) = Self::register(session)?;
        let guard = WaiterGuard {
            session,
            request_id: request_id.clone(),
        };
        request.request_id = request_id.clone();

        debug!(
            "Forwarding {} {} to tunnel {} as request {}",
            request.method,
            request.url,
            session.tunnel_id(),
            request_id
        );

        match session.submit_request(&request).await {
            Ok(()) => {}
            Err(TunnelError::BadGateway(reason)) => {
                session.cancel_waiter(&request_id);
                error!(
                    "Failed to write request {} to tunnel {}: {}",
                    request_id,
                    session.tunnel_id(),
                    reason
                );
                self.registry
                    .terminate(session, "tunnel connection failed")
                    .await;
                return Err(TunnelError::BadGateway(reason));
            }
            Err(e) => return Err(e),
        }

        let outcome = self.wait(rx).await;
        if let Err(TunnelError::GatewayTimeout(_)) = &outcome {
            session.cancel_waiter(&request_id);
            warn!(
                "Request {} to tunnel {} timed out after {:?}",
                request_id,
                session.tunnel_id(),
                self.timeout
            );
        }
        drop(guard);
        outcome
    }

    fn register(
        session: &TunnelSession,
    ) -> Result<(String, oneshot::Receiver<Delivery>), TunnelError> {
        for _ in 0..REQUEST_ID_ATTEMPTS {
            let request_id = generate_request_id()?;
            match session.register_waiter(&request_id) {
                Ok(rx) => return Ok((request_id, rx)),
                Err(TunnelError::DuplicateRequest(id)) => {
                    warn!("Request ID collision on tunnel {}: {}", session.tunnel_id(), id);
                }
                Err(e) => return Err(e),
            }
        }
        Err(TunnelError::Internal(
            "could not allocate a unique request ID".to_string(),
        ))
    }

    async fn wait(&self, rx: oneshot::Receiver<Delivery>) -> Result<ProxyResponse, TunnelError> {
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(delivery)) => delivery,
            Ok(Err(_)) => Err(TunnelError::SessionClosed(
                "pending request was dropped".to_string(),
            )),
            Err(_) => Err(TunnelError::GatewayTimeout(self.timeout)),
        }
    }
}
