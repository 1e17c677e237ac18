//! HTTP gateway: public request in, tunnel round trip, public response out

use axum::body::{to_bytes, Body};
use axum::extract::Request;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use burrow_control::{RequestCorrelator, TunnelError, TunnelRegistry};
use burrow_proto::{canonical_header_key, HeaderMultimap, ProxyRequest, ProxyResponse};
use http_body_util::LengthLimitError;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Response headers recomputed by the HTTP layer rather than copied through
const HOP_HEADERS: [&str; 3] = ["content-length", "transfer-encoding", "connection"];

/// Gateway failures, each mapped onto the status the public caller sees
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Tunnel(#[from] TunnelError),

    #[error("Request body exceeds {0} bytes")]
    BodyTooLarge(usize),

    #[error("Failed to read request body: {0}")]
    RequestBody(String),

    #[error("Invalid response from tunnel: {0}")]
    InvalidResponse(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Tunnel(e) => match e {
                TunnelError::NotFound(_) => StatusCode::NOT_FOUND,
                TunnelError::BadGateway(_) | TunnelError::SessionClosed(_) => {
                    StatusCode::BAD_GATEWAY
                }
                TunnelError::GatewayTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
                TunnelError::Overloaded(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            GatewayError::BodyTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::RequestBody(_) => StatusCode::BAD_REQUEST,
            GatewayError::InvalidResponse(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn public_message(&self) -> &'static str {
        match self.status() {
            StatusCode::NOT_FOUND => "Tunnel not found",
            StatusCode::BAD_GATEWAY => "Tunnel connection failed",
            StatusCode::GATEWAY_TIMEOUT => "Request timeout",
            StatusCode::SERVICE_UNAVAILABLE => "Tunnel overloaded",
            StatusCode::PAYLOAD_TOO_LARGE => "Request body too large",
            StatusCode::BAD_REQUEST => "Invalid request body",
            _ => "Internal server error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status(), self.public_message()).into_response()
    }
}

/// Forwards public HTTP requests down registered tunnels
pub struct HttpGateway {
    registry: Arc<TunnelRegistry>,
    correlator: RequestCorrelator,
    max_body_bytes: usize,
}

impl HttpGateway {
    pub fn new(
        registry: Arc<TunnelRegistry>,
        correlator: RequestCorrelator,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            registry,
            correlator,
            max_body_bytes,
        }
    }

    /// Handle one public request addressed to `tunnel_id`
    ///
    /// Never fails: every error becomes its HTTP status. One log line is
    /// written per request.
    pub async fn handle(
        &self,
        tunnel_id: &str,
        request: Request,
        remote_addr: Option<SocketAddr>,
    ) -> Response {
        let start = Instant::now();
        let method = request.method().clone();
        let path = request.uri().path().to_string();

        let response = match self.proxy(tunnel_id, request).await {
            Ok(response) => response,
            Err(e) => {
                if e.status().is_server_error() {
                    warn!("Request to tunnel {} failed: {}", tunnel_id, e);
                } else {
                    debug!("Request to tunnel {} rejected: {}", tunnel_id, e);
                }
                e.into_response()
            }
        };

        info!(
            "HTTP {} {} {} {} {:?}",
            method,
            path,
            remote_addr
                .map(|addr| addr.to_string())
                .unwrap_or_else(|| "-".to_string()),
            response.status().as_u16(),
            start.elapsed()
        );
        response
    }

    async fn proxy(&self, tunnel_id: &str, request: Request) -> Result<Response, GatewayError> {
        let session = self
            .registry
            .lookup(tunnel_id)
            .ok_or_else(|| TunnelError::NotFound(tunnel_id.to_string()))?;

        let proxy_request = self.to_proxy_request(request).await?;
        let proxy_response = self.correlator.forward(&session, proxy_request).await?;
        build_response(proxy_response)
    }

    async fn to_proxy_request(&self, request: Request) -> Result<ProxyRequest, GatewayError> {
        let (parts, body) = request.into_parts();
        let body = to_bytes(body, self.max_body_bytes).await.map_err(|e| {
            let inner = e.into_inner();
            if inner.is::<LengthLimitError>() {
                GatewayError::BodyTooLarge(self.max_body_bytes)
            } else {
                GatewayError::RequestBody(inner.to_string())
            }
        })?;

        let url = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| parts.uri.path().to_string());

        Ok(ProxyRequest {
            request_id: String::new(),
            method: parts.method.as_str().to_string(),
            url,
            headers: to_multimap(&parts.headers),
            body: body.to_vec(),
        })
    }
}

/// Group header values by canonical name, preserving value order
pub fn to_multimap(headers: &HeaderMap) -> HeaderMultimap {
    let mut multimap = HeaderMultimap::new();
    for (name, value) in headers {
        let Ok(value) = value.to_str() else {
            debug!("Skipping non-text value for header {}", name);
            continue;
        };
        multimap
            .entry(canonical_header_key(name.as_str()))
            .or_default()
            .push(value.to_string());
    }
    multimap
}

/// Turn a tunnel's answer into the public HTTP response
pub fn build_response(proxy_response: ProxyResponse) -> Result<Response, GatewayError> {
    let status = StatusCode::from_u16(proxy_response.status_code)
        .map_err(|e| GatewayError::InvalidResponse(e.to_string()))?;
    let body = proxy_response
        .body_bytes()
        .map_err(|e| GatewayError::InvalidResponse(format!("bad base64 body: {}", e)))?;

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;

    let headers = response.headers_mut();
    for (name, values) in &proxy_response.headers {
        let Ok(header_name) = HeaderName::from_bytes(name.as_bytes()) else {
            debug!("Skipping invalid response header name {:?}", name);
            continue;
        };
        if HOP_HEADERS.contains(&header_name.as_str()) {
            continue;
        }
        for value in values {
            match HeaderValue::from_str(value) {
                Ok(value) => {
                    headers.append(header_name.clone(), value);
                }
                Err(_) => debug!("Skipping invalid value for response header {}", name),
            }
        }
    }

    Ok(response)
}
