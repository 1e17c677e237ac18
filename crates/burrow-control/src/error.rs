//! Control plane errors

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TunnelError {
    #[error("Tunnel not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// A write to the tunnel connection failed; the session has been torn down
    #[error("Tunnel connection failed: {0}")]
    BadGateway(String),

    /// The session closed while the request was outstanding
    #[error("Tunnel connection closed: {0}")]
    SessionClosed(String),

    #[error("No response from tunnel within {0:?}")]
    GatewayTimeout(Duration),

    #[error("Too many pending requests (limit {0})")]
    Overloaded(usize),

    #[error("Request ID already pending: {0}")]
    DuplicateRequest(String),

    #[error("Registration failed: {0}")]
    Registration(String),

    #[error("Health probe failed: {0}")]
    HealthProbe(String),
}
