//! Per-client-IP request rate limiting
//!
//! One governor token bucket per client IP: a burst of up to `rps` requests,
//! refilled at `rps` per second. Buckets that have refilled completely are
//! indistinguishable from new ones and get pruned periodically.

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use governor::clock::{Clock, DefaultClock};
use governor::middleware::NoOpMiddleware;
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter};
use std::net::{IpAddr, SocketAddr};
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Checks between two prunes of full buckets
const PRUNE_EVERY: u64 = 4096;

type KeyedLimiter<C> =
    RateLimiter<IpAddr, DefaultKeyedStateStore<IpAddr>, C, NoOpMiddleware<<C as Clock>::Instant>>;

pub struct IpRateLimiter<C: Clock = DefaultClock> {
    limiter: KeyedLimiter<C>,
    checks: AtomicU64,
}

impl IpRateLimiter {
    /// `None` when `requests_per_second` is 0, i.e. limiting is off
    pub fn new(requests_per_second: u32) -> Option<Self> {
        let quota = Quota::per_second(NonZeroU32::new(requests_per_second)?);
        Some(Self {
            limiter: RateLimiter::keyed(quota),
            checks: AtomicU64::new(0),
        })
    }
}

impl<C: Clock> IpRateLimiter<C> {
    #[cfg(test)]
    fn with_clock(requests_per_second: u32, clock: &C) -> Option<Self> {
        let quota = Quota::per_second(NonZeroU32::new(requests_per_second)?);
        Some(Self {
            limiter: RateLimiter::new(quota, DefaultKeyedStateStore::default(), clock),
            checks: AtomicU64::new(0),
        })
    }

    /// Count one request from `ip`; false if it is over its budget
    pub fn allow(&self, ip: IpAddr) -> bool {
        if self.checks.fetch_add(1, Ordering::Relaxed) % PRUNE_EVERY == PRUNE_EVERY - 1 {
            self.prune();
        }
        self.limiter.check_key(&ip).is_ok()
    }

    /// Drop the buckets of clients that have not been seen for a while
    pub fn prune(&self) {
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
    }

    pub fn tracked_clients(&self) -> usize {
        self.limiter.len()
    }
}

/// Middleware rejecting over-budget clients with 429
///
/// Requests without a peer address (not served through
/// `into_make_service_with_connect_info`) are let through.
pub async fn rate_limit(
    State(limiter): State<Arc<IpRateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    if let Some(ip) = peer {
        if !limiter.allow(ip) {
            debug!("Rate limit exceeded for {}", ip);
            return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
        }
    }

    next.run(request).await
}
