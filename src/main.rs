//! Burrow relay server
//!
//! Tunnel clients register over a WebSocket at `/tunnel`; public HTTP
//! requests to `/{tunnel_id}/...` are forwarded down the matching tunnel.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use burrow_control::{ControlConfig, TunnelRegistry};
use burrow_server_http::server::{bind, serve_router};
use burrow_server_http::{admin_router, HttpServer, HttpServerConfig};

/// Reverse-tunnel relay: exposes clients behind NAT at a public endpoint
#[derive(Parser, Debug)]
#[command(name = "burrow-relay")]
#[command(about = "Run a reverse-tunnel relay server", long_about = None)]
#[command(version)]
struct ServerArgs {
    /// Public HTTP port
    #[arg(long, env = "PORT", default_value_t = 80)]
    port: u16,

    /// Public domain; tunnel registrations from browsers must come from it
    #[arg(long, env = "DOMAIN", default_value = "servit.app")]
    domain: String,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Seconds a proxied request waits for the tunnel's response
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    request_timeout_secs: u64,

    /// Seconds between health sweeps over all tunnels
    #[arg(
        long,
        env = "HEALTH_CHECK_INTERVAL_SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    health_check_interval_secs: u64,

    /// Deadline in seconds for one liveness ping
    #[arg(long, env = "HEALTH_PROBE_TIMEOUT_SECS", default_value_t = 5)]
    health_probe_timeout_secs: u64,

    /// Deadline in seconds for writing a request down a tunnel
    #[arg(long, env = "WRITE_TIMEOUT_SECS", default_value_t = 30)]
    write_timeout_secs: u64,

    /// Seconds a new connection has to send its registration
    #[arg(long, env = "REGISTRATION_TIMEOUT_SECS", default_value_t = 10)]
    registration_timeout_secs: u64,

    /// In-flight requests allowed per tunnel before new ones get 503
    #[arg(long, env = "MAX_PENDING_PER_TUNNEL", default_value_t = 1024)]
    max_pending_per_tunnel: usize,

    /// Largest request body forwarded, in bytes
    #[arg(long, env = "MAX_BODY_BYTES", default_value_t = 16 * 1024 * 1024)]
    max_body_bytes: usize,

    /// Requests per second per client IP (0 disables rate limiting)
    #[arg(long, env = "RATE_LIMIT_RPS", default_value_t = 100)]
    rate_limit_rps: u32,

    /// Admin API bind address
    #[arg(long, env = "API_ADDR", default_value = "127.0.0.1:3080")]
    api_addr: SocketAddr,

    /// Disable the admin API
    #[arg(long)]
    no_api: bool,
}

impl ServerArgs {
    fn control_config(&self) -> ControlConfig {
        ControlConfig::default()
            .with_request_timeout(Duration::from_secs(self.request_timeout_secs))
            .with_health_check_interval(Duration::from_secs(self.health_check_interval_secs))
            .with_health_probe_timeout(Duration::from_secs(self.health_probe_timeout_secs))
            .with_write_timeout(Duration::from_secs(self.write_timeout_secs))
            .with_registration_timeout(Duration::from_secs(self.registration_timeout_secs))
            .with_max_pending(self.max_pending_per_tunnel)
    }

    fn http_config(&self) -> HttpServerConfig {
        HttpServerConfig::default()
            .with_bind_addr(SocketAddr::from(([0, 0, 0, 0], self.port)))
            .with_domain(self.domain.clone())
            .with_rate_limit(self.rate_limit_rps)
            .with_max_body_bytes(self.max_body_bytes)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = ServerArgs::parse();
    init_logging(&args.log_level)?;

    let control = args.control_config();
    let http = args.http_config();

    info!("Starting burrow relay");
    info!("Public HTTP: {}", http.bind_addr);
    info!("Public domain: {}", http.domain);
    info!(
        "Request timeout {:?}, health check every {:?}",
        control.request_timeout, control.health_check_interval
    );

    let registry = Arc::new(TunnelRegistry::new());
    let shutdown = CancellationToken::new();

    let sweeper =
        registry.spawn_health_sweeper(control.health_check_interval, control.health_probe_timeout);

    let public_listener = bind(http.bind_addr)
        .await
        .context("Failed to start public HTTP server")?;
    let public_router = HttpServer::new(http, registry.clone(), control).router();
    let http_handle = tokio::spawn(serve_router(
        public_listener,
        public_router,
        shutdown.clone().cancelled_owned(),
    ));

    let api_handle = if args.no_api {
        info!("Admin API disabled (--no-api flag)");
        None
    } else {
        let api_listener = bind(args.api_addr)
            .await
            .context("Failed to start admin API")?;
        info!("Admin API: {}", args.api_addr);
        Some(tokio::spawn(serve_router(
            api_listener,
            admin_router(registry.clone()),
            shutdown.clone().cancelled_owned(),
        )))
    };

    info!("Relay is running, press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, stopping servers..."),
        Err(err) => error!("Error listening for shutdown signal: {}", err),
    }

    shutdown.cancel();
    sweeper.abort();
    registry.close_all("server shutting down").await;

    match http_handle.await {
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Some(handle) = api_handle {
        if let Ok(Err(e)) = handle.await {
            error!("Admin API error: {}", e);
        }
    }

    info!("Relay stopped");
    Ok(())
}

fn init_logging(log_level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(log_level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = ServerArgs::try_parse_from(["burrow-relay"]).unwrap();
        let control = args.control_config();
        let http = args.http_config();

        assert_eq!(control.request_timeout, Duration::from_secs(30));
        assert_eq!(control.health_check_interval, Duration::from_secs(30));
        assert_eq!(control.health_probe_timeout, Duration::from_secs(5));
        assert_eq!(http.domain, "servit.app");
        assert_eq!(http.rate_limit_rps, 100);
        assert!(!args.no_api);
    }

    #[test]
    fn test_flags_override() {
        let args = ServerArgs::try_parse_from([
            "burrow-relay",
            "--port",
            "8080",
            "--domain",
            "tunnels.example.com",
            "--request-timeout-secs",
            "5",
            "--rate-limit-rps",
            "0",
            "--no-api",
        ])
        .unwrap();

        assert_eq!(args.http_config().bind_addr.port(), 8080);
        assert_eq!(args.http_config().domain, "tunnels.example.com");
        assert_eq!(args.control_config().request_timeout, Duration::from_secs(5));
        assert_eq!(args.http_config().rate_limit_rps, 0);
        assert!(args.no_api);
    }

    #[test]
    fn test_zero_health_check_interval_rejected() {
        let result =
            ServerArgs::try_parse_from(["burrow-relay", "--health-check-interval-secs", "0"]);
        assert!(result.is_err());

        let args =
            ServerArgs::try_parse_from(["burrow-relay", "--health-check-interval-secs", "1"])
                .unwrap();
        assert_eq!(
            args.control_config().health_check_interval,
            Duration::from_secs(1)
        );
    }
}
