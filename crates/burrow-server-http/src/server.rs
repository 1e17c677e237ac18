//! Public router and listener
//!
//! One axum router carries the registration endpoint and the gateway routes,
//! layered with per-IP rate limiting, CORS, request tracing and panic
//! recovery.

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::{ConnectInfo, FromRequestParts, Path, Request, State, WebSocketUpgrade};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::Router;
use burrow_control::{ConnectionHandler, ControlConfig, RequestCorrelator, TunnelRegistry};
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::gateway::HttpGateway;
use crate::rate_limit::{rate_limit, IpRateLimiter};
use crate::ws;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Server error: {0}")]
    Serve(#[from] std::io::Error),
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct HttpServerConfig {
    pub bind_addr: SocketAddr,
    /// Public domain; governs CORS and the registration origin check
    pub domain: String,
    /// Requests per second per client IP; 0 disables limiting
    pub rate_limit_rps: u32,
    pub max_body_bytes: usize,
    pub tunnel_path: String,
}

impl Default for HttpServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 80)),
            domain: "servit.app".to_string(),
            rate_limit_rps: 100,
            max_body_bytes: 16 * 1024 * 1024,
            tunnel_path: "/tunnel".to_string(),
        }
    }
}

impl HttpServerConfig {
    pub fn with_bind_addr(mut self, bind_addr: SocketAddr) -> Self {
        self.bind_addr = bind_addr;
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    pub fn with_rate_limit(mut self, requests_per_second: u32) -> Self {
        self.rate_limit_rps = requests_per_second;
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }
}

#[derive(Clone)]
struct AppState {
    handler: Arc<ConnectionHandler>,
    gateway: Arc<HttpGateway>,
    domain: Arc<str>,
}

/// Remote address of the caller, when the listener recorded one
pub struct PeerAddr(pub Option<SocketAddr>);

impl<S: Send + Sync> FromRequestParts<S> for PeerAddr {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(PeerAddr(
            parts
                .extensions
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| *addr),
        ))
    }
}

pub struct HttpServer {
    config: HttpServerConfig,
    registry: Arc<TunnelRegistry>,
    control: ControlConfig,
}

impl HttpServer {
    pub fn new(
        config: HttpServerConfig,
        registry: Arc<TunnelRegistry>,
        control: ControlConfig,
    ) -> Self {
        Self {
            config,
            registry,
            control,
        }
    }

    /// Build the public router
    pub fn router(&self) -> Router {
        let state = AppState {
            handler: Arc::new(ConnectionHandler::new(
                self.registry.clone(),
                self.control.clone(),
            )),
            gateway: Arc::new(HttpGateway::new(
                self.registry.clone(),
                RequestCorrelator::new(self.registry.clone(), self.control.request_timeout),
                self.config.max_body_bytes,
            )),
            domain: Arc::from(self.config.domain.as_str()),
        };

        let mut router = Router::new()
            .route(&self.config.tunnel_path, get(tunnel_upgrade))
            .route("/{tunnel_id}", any(proxy))
            .route("/{tunnel_id}/{*path}", any(proxy))
            .with_state(state);

        if let Some(limiter) = IpRateLimiter::new(self.config.rate_limit_rps) {
            router = router.layer(middleware::from_fn_with_state(Arc::new(limiter), rate_limit));
        }

        router
            .layer(TraceLayer::new_for_http())
            .layer(cors_layer(&self.config.domain))
            .layer(CatchPanicLayer::new())
    }
}

pub async fn bind(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

/// Serve `router` on `listener`, recording each caller's address
pub async fn serve_router<F>(
    listener: TcpListener,
    router: Router,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    Ok(())
}

fn cors_layer(domain: &str) -> CorsLayer {
    let apex = format!("https://{}", domain);
    let suffix = format!(".{}", domain);

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            let origin = origin.to_str().unwrap_or("");
            origin == apex
                || (origin.starts_with("https://")
                    && origin.ends_with(&suffix)
                    && origin.len() > "https://".len() + suffix.len())
        }))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(AllowHeaders::mirror_request())
        .allow_credentials(true)
        .max_age(Duration::from_secs(86400))
}

async fn tunnel_upgrade(
    State(state): State<AppState>,
    PeerAddr(peer): PeerAddr,
    headers: HeaderMap,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !ws::origin_allowed(origin, &state.domain) {
        warn!(
            "Rejected tunnel connection from {:?} with origin {:?}",
            peer, origin
        );
        return (StatusCode::FORBIDDEN, "Origin not allowed").into_response();
    }

    let upgrade = match upgrade {
        Ok(upgrade) => upgrade,
        Err(rejection) => return rejection.into_response(),
    };
    upgrade.on_upgrade(move |socket| async move {
        let (sink, source) = ws::split(socket);
        state.handler.handle_connection(sink, source, peer).await;
    })
}

async fn proxy(
    State(state): State<AppState>,
    PeerAddr(peer): PeerAddr,
    Path(params): Path<HashMap<String, String>>,
    request: Request,
) -> Response {
    let Some(tunnel_id) = params.get("tunnel_id") else {
        return (StatusCode::NOT_FOUND, "Tunnel not found").into_response();
    };
    state.gateway.handle(tunnel_id, request, peer).await
}
