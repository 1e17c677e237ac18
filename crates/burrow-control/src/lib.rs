//! Control plane for tunnel sessions
//!
//! Owns everything between an upgraded tunnel connection and the HTTP
//! gateway: the registry of live sessions, per-session request correlation,
//! serialised writes, and the connection lifecycle.
pub mod config;
pub mod correlator;
pub mod error;
pub mod handler;
pub mod pending_requests;
pub mod registry;
pub mod request_id;
pub mod session;
pub mod writer;

pub use config::ControlConfig;
pub use correlator::RequestCorrelator;
pub use error::TunnelError;
pub use handler::{ConnectionHandler, ConnectionOutcome, ConnectionState};
pub use pending_requests::{Delivery, PendingRequests};
pub use registry::TunnelRegistry;
pub use request_id::generate_request_id;
pub use session::{SessionState, TunnelSession};
pub use writer::OutboundWriter;
