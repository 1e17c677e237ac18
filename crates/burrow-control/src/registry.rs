//! Tunnel registry: tunnel ID → live session
//!
//! Backed by a sharded `DashMap`, so lookups for unrelated tunnels never
//! contend on one lock. The registry is an ordinary value owned by whoever
//! builds the relay; there is no process-wide instance.

use crate::session::TunnelSession;
use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Shortest period the health sweeper will run at
pub const MIN_SWEEP_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Default)]
pub struct TunnelRegistry {
    sessions: DashMap<String, Arc<TunnelSession>>,
}

impl TunnelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session under its tunnel ID
    ///
    /// Returns the session it displaced, if any. The caller must close it;
    /// otherwise its connection and pending requests are orphaned.
    pub fn register(&self, session: Arc<TunnelSession>) -> Option<Arc<TunnelSession>> {
        let tunnel_id = session.tunnel_id().to_string();
        let previous = self.sessions.insert(tunnel_id.clone(), session);
        if previous.is_some() {
            info!("Tunnel {} re-registered, replacing previous session", tunnel_id);
        } else {
            info!("Tunnel registered: {}", tunnel_id);
        }
        previous
    }

    pub fn lookup(&self, tunnel_id: &str) -> Option<Arc<TunnelSession>> {
        self.sessions.get(tunnel_id).map(|entry| entry.value().clone())
    }

    /// Unconditionally remove whatever is registered under `tunnel_id`
    pub fn remove(&self, tunnel_id: &str) -> Option<Arc<TunnelSession>> {
        let removed = self.sessions.remove(tunnel_id).map(|(_, session)| session);
        if removed.is_some() {
            debug!("Tunnel unregistered: {}", tunnel_id);
        }
        removed
    }

    /// Remove `session` only if it is still the one registered under its ID
    ///
    /// Teardown of a replaced session must not evict its replacement.
    pub fn remove_session(&self, session: &TunnelSession) -> bool {
        let removed = self
            .sessions
            .remove_if(session.tunnel_id(), |_, current| {
                current.serial() == session.serial()
            })
            .is_some();
        if removed {
            debug!("Tunnel unregistered: {}", session.tunnel_id());
        }
        removed
    }

    /// Remove `session` from the registry (if still present) and close it
    ///
    /// Returns true if this call removed it from the registry.
    pub async fn terminate(&self, session: &TunnelSession, reason: &str) -> bool {
        let removed = self.remove_session(session);
        session.close(reason).await;
        removed
    }

    /// Sorted IDs of every registered tunnel
    pub fn list_active(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    fn snapshot(&self) -> Vec<Arc<TunnelSession>> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    /// Ping every registered session; tear down those whose ping is not
    /// written within `probe_timeout`.
    ///
    /// Probes run concurrently. Returns the IDs this sweep removed; a session
    /// that was unregistered or replaced while its probe ran is not counted.
    pub async fn health_sweep(&self, probe_timeout: Duration) -> Vec<String> {
        let sessions = self.snapshot();
        let probes = sessions.iter().map(|session| async move {
            let result = session.ping(probe_timeout).await;
            (session, result)
        });

        let mut removed = Vec::new();
        for (session, result) in join_all(probes).await {
            if let Err(e) = result {
                warn!("Tunnel {} failed health check: {}", session.tunnel_id(), e);
                if self.terminate(session, "health check failed").await {
                    removed.push(session.tunnel_id().to_string());
                }
            }
        }
        removed
    }

    /// Run [`health_sweep`](Self::health_sweep) every `interval` until aborted
    ///
    /// Intervals below [`MIN_SWEEP_INTERVAL`] are raised to it.
    pub fn spawn_health_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        probe_timeout: Duration,
    ) -> JoinHandle<()> {
        let interval = if interval < MIN_SWEEP_INTERVAL {
            warn!(
                "Health check interval {:?} too short, using {:?}",
                interval, MIN_SWEEP_INTERVAL
            );
            MIN_SWEEP_INTERVAL
        } else {
            interval
        };
        let registry = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                let removed = registry.health_sweep(probe_timeout).await;
                if removed.is_empty() {
                    debug!("Health check passed for {} tunnels", registry.count());
                } else {
                    info!(
                        "Health check removed {} tunnels: {}",
                        removed.len(),
                        removed.join(", ")
                    );
                }
            }
        })
    }

    /// Close every session; used on shutdown
    pub async fn close_all(&self, reason: &str) {
        for session in self.snapshot() {
            self.terminate(&session, reason).await;
        }
    }
}
