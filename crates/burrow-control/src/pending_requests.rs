//! Pending requests tracker
//!
//! Correlates request IDs written down a tunnel with the callers waiting for
//! the matching response. Every entry leaves the table exactly once: by
//! [`PendingRequests::respond`], [`PendingRequests::cancel`] or
//! [`PendingRequests::fail_all`]. `DashMap::remove` is the arbiter, so
//! whichever path removes an entry first wins and the others see nothing.

use crate::error::TunnelError;
use burrow_proto::ProxyResponse;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// What a waiter eventually receives
pub type Delivery = Result<ProxyResponse, TunnelError>;

struct PendingEntry {
    tx: oneshot::Sender<Delivery>,
    created_at: Instant,
}

/// Tracks requests awaiting responses on one session
#[derive(Clone)]
pub struct PendingRequests {
    requests: Arc<DashMap<String, PendingEntry>>,
    limit: usize,
}

impl PendingRequests {
    pub fn new(limit: usize) -> Self {
        Self {
            requests: Arc::new(DashMap::new()),
            limit,
        }
    }

    /// Register a new pending request
    /// Returns a receiver that will receive the response
    ///
    /// The limit is a soft bound: concurrent registrations racing past the
    /// length check may overshoot it by a few entries.
    pub fn register(&self, request_id: &str) -> Result<oneshot::Receiver<Delivery>, TunnelError> {
        if self.requests.len() >= self.limit {
            return Err(TunnelError::Overloaded(self.limit));
        }

        match self.requests.entry(request_id.to_string()) {
            Entry::Occupied(_) => Err(TunnelError::DuplicateRequest(request_id.to_string())),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingEntry {
                    tx,
                    created_at: Instant::now(),
                });
                debug!("Registered pending request {}", request_id);
                Ok(rx)
            }
        }
    }

    /// Send a response for a pending request
    /// Returns true if the response was delivered, false if the request wasn't found
    pub fn respond(&self, request_id: &str, response: ProxyResponse) -> bool {
        let Some((_, entry)) = self.requests.remove(request_id) else {
            return false;
        };

        debug!(
            "Routing response for request {} after {:?}",
            request_id,
            entry.created_at.elapsed()
        );
        if entry.tx.send(Ok(response)).is_err() {
            warn!(
                "Failed to deliver response for request {} - receiver dropped",
                request_id
            );
            return false;
        }
        true
    }

    /// Remove a pending request without answering it (timeout or abandoned caller)
    pub fn cancel(&self, request_id: &str) -> bool {
        if self.requests.remove(request_id).is_some() {
            debug!("Cancelled pending request {}", request_id);
            return true;
        }
        false
    }

    /// Fail every pending request with [`TunnelError::SessionClosed`]
    /// Returns how many waiters were failed
    pub fn fail_all(&self, reason: &str) -> usize {
        let ids: Vec<String> = self.requests.iter().map(|e| e.key().clone()).collect();

        let mut failed = 0;
        for id in ids {
            if let Some((_, entry)) = self.requests.remove(&id) {
                let _ = entry
                    .tx
                    .send(Err(TunnelError::SessionClosed(reason.to_string())));
                failed += 1;
            }
        }
        failed
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.requests.contains_key(request_id)
    }

    /// Get count of pending requests
    pub fn count(&self) -> usize {
        self.requests.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(request_id: &str, status_code: u16) -> ProxyResponse {
        ProxyResponse {
            request_id: request_id.to_string(),
            status_code,
            headers: Default::default(),
            body: String::new(),
            is_base64: false,
        }
    }

    #[tokio::test]
    async fn test_register_and_respond() {
        let tracker = PendingRequests::new(16);

        let rx = tracker.register("a").unwrap();
        assert_eq!(tracker.count(), 1);

        assert!(tracker.respond("a", response("a", 200)));
        assert_eq!(tracker.count(), 0);

        let received = rx.await.unwrap().unwrap();
        assert_eq!(received.status_code, 200);
    }

    #[tokio::test]
    async fn test_duplicate_register_rejected() {
        let tracker = PendingRequests::new(16);

        let _rx = tracker.register("dup").unwrap();
        let err = tracker.register("dup").unwrap_err();
        assert_eq!(err, TunnelError::DuplicateRequest("dup".to_string()));
        assert_eq!(tracker.count(), 1);
    }

    #[tokio::test]
    async fn test_limit() {
        let tracker = PendingRequests::new(2);

        let _a = tracker.register("a").unwrap();
        let _b = tracker.register("b").unwrap();
        assert_eq!(tracker.register("c").unwrap_err(), TunnelError::Overloaded(2));

        tracker.cancel("a");
        assert!(tracker.register("c").is_ok());
    }

    #[tokio::test]
    async fn test_respond_not_found() {
        let tracker = PendingRequests::new(16);
        assert!(!tracker.respond("missing", response("missing", 200)));
    }

    #[tokio::test]
    async fn test_respond_with_dropped_receiver() {
        let tracker = PendingRequests::new(16);

        let rx = tracker.register("gone").unwrap();
        drop(rx);

        assert!(!tracker.respond("gone", response("gone", 200)));
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test]
    async fn test_double_respond_same_request() {
        let tracker = PendingRequests::new(16);

        let rx = tracker.register("once").unwrap();
        assert!(tracker.respond("once", response("once", 200)));
        assert!(!tracker.respond("once", response("once", 500)));

        assert_eq!(rx.await.unwrap().unwrap().status_code, 200);
    }

    #[tokio::test]
    async fn test_cancel_then_respond_is_dropped() {
        let tracker = PendingRequests::new(16);

        let rx = tracker.register("late").unwrap();
        assert!(tracker.cancel("late"));
        assert!(!tracker.cancel("late"));
        assert!(!tracker.respond("late", response("late", 200)));

        // Sender dropped without a value
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_fail_all() {
        let tracker = PendingRequests::new(16);

        let receivers: Vec<_> = (0..5)
            .map(|i| tracker.register(&format!("r{}", i)).unwrap())
            .collect();

        assert_eq!(tracker.fail_all("connection closed"), 5);
        assert_eq!(tracker.count(), 0);

        for rx in receivers {
            assert_eq!(
                rx.await.unwrap().unwrap_err(),
                TunnelError::SessionClosed("connection closed".to_string())
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_respond_and_cancel_remove_once() {
        let tracker = PendingRequests::new(1024);

        for round in 0..200 {
            let id = format!("race-{}", round);
            let rx = tracker.register(&id).unwrap();

            let responder = {
                let tracker = tracker.clone();
                let id = id.clone();
                tokio::spawn(async move { tracker.respond(&id, response(&id, 200)) })
            };
            let canceller = {
                let tracker = tracker.clone();
                let id = id.clone();
                tokio::spawn(async move { tracker.cancel(&id) })
            };

            let delivered = responder.await.unwrap();
            let cancelled = canceller.await.unwrap();
            assert!(delivered ^ cancelled, "exactly one path must win");
            assert_eq!(rx.await.is_ok(), delivered);
        }

        assert_eq!(tracker.count(), 0);
    }
}
