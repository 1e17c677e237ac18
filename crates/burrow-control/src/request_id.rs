//! Request ID generation

use crate::error::TunnelError;
use rand::rngs::OsRng;
use rand::RngCore;
use std::fmt::Write;

/// Random bytes per request ID (rendered as twice as many hex characters)
pub const REQUEST_ID_BYTES: usize = 8;

/// A fresh, unguessable request ID from the OS RNG
///
/// 64 random bits keep collisions among one session's in-flight requests
/// negligible, but callers still rely on the pending table rejecting
/// duplicates rather than assuming uniqueness.
pub fn generate_request_id() -> Result<String, TunnelError> {
    let mut bytes = [0u8; REQUEST_ID_BYTES];
    OsRng
        .try_fill_bytes(&mut bytes)
        .map_err(|e| TunnelError::Internal(format!("failed to generate request ID: {}", e)))?;

    let mut id = String::with_capacity(REQUEST_ID_BYTES * 2);
    for byte in bytes {
        let _ = write!(id, "{:02x}", byte);
    }
    Ok(id)
}
