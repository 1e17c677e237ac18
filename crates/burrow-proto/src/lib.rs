//! Tunnel Protocol Definitions
//!
//! JSON messages exchanged between the relay and a tunnel client, one message
//! per WebSocket frame:
//!
//! - client → relay, first frame only: [`RegisterMessage`]
//! - relay → client: [`ProxyRequest`]
//! - client → relay: [`ProxyResponse`]
//! - relay → client before closing a rejected connection: [`ErrorMessage`]

pub mod codec;
pub mod headers;
pub mod messages;

pub use codec::{
    decode_registration, decode_response, encode_error, encode_request, encode_response,
    CodecError,
};
pub use headers::canonical_header_key;
pub use messages::*;

/// Largest status code a client may report
pub const MAX_STATUS_CODE: u16 = 999;
