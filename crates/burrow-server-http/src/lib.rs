//! Public HTTP surface of the relay
//!
//! Serves three things on one listener: the WebSocket endpoint tunnel
//! clients register on, the gateway that forwards `/{tunnel_id}/...`
//! requests down the matching tunnel, and (on a separate listener) a small
//! admin API.
pub mod admin;
pub mod gateway;
pub mod rate_limit;
pub mod server;
pub mod ws;

pub use admin::admin_router;
pub use gateway::{GatewayError, HttpGateway};
pub use rate_limit::IpRateLimiter;
pub use server::{HttpServer, HttpServerConfig, ServerError};
pub use ws::{origin_allowed, WsSink, WsSource};
