//! JSON encoding and boundary validation for tunnel messages
//!
//! Decoding validates the envelope: a message that parses as JSON but is
//! missing the fields the relay depends on is rejected here rather than being
//! passed on half-populated.

use crate::messages::{ErrorMessage, ProxyRequest, ProxyResponse, RegisterMessage};
use crate::MAX_STATUS_CODE;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Missing or empty field: {0}")]
    MissingField(&'static str),

    #[error("Invalid status code: {0}")]
    InvalidStatus(u16),
}

/// Decode and validate the registration frame
pub fn decode_registration(payload: &[u8]) -> Result<RegisterMessage, CodecError> {
    let message: RegisterMessage = serde_json::from_slice(payload)?;
    if message.tunnel_id.is_empty() {
        return Err(CodecError::MissingField("tunnelId"));
    }
    Ok(message)
}

/// Decode and validate a response frame
pub fn decode_response(payload: &[u8]) -> Result<ProxyResponse, CodecError> {
    let response: ProxyResponse = serde_json::from_slice(payload)?;
    if response.request_id.is_empty() {
        return Err(CodecError::MissingField("requestId"));
    }
    if !(100..=MAX_STATUS_CODE).contains(&response.status_code) {
        return Err(CodecError::InvalidStatus(response.status_code));
    }
    Ok(response)
}

pub fn encode_request(request: &ProxyRequest) -> Result<String, CodecError> {
    Ok(serde_json::to_string(request)?)
}

pub fn encode_response(response: &ProxyResponse) -> Result<String, CodecError> {
    Ok(serde_json::to_string(response)?)
}

pub fn encode_error(reason: &str) -> Result<String, CodecError> {
    Ok(serde_json::to_string(&ErrorMessage {
        error: reason.to_string(),
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_registration() {
        let message = decode_registration(br#"{"tunnelId":"abc"}"#).unwrap();
        assert_eq!(message.tunnel_id, "abc");
    }

    #[test]
    fn test_decode_registration_ignores_extra_fields() {
        let message = decode_registration(br#"{"tunnelId":"abc","version":2}"#).unwrap();
        assert_eq!(message.tunnel_id, "abc");
    }

    #[test]
    fn test_decode_registration_rejects_missing_id() {
        let err = decode_registration(br#"{"name":"abc"}"#).unwrap_err();
        assert!(matches!(err, CodecError::MissingField("tunnelId")));

        let err = decode_registration(br#"{"tunnelId":""}"#).unwrap_err();
        assert!(matches!(err, CodecError::MissingField("tunnelId")));
    }

    #[test]
    fn test_decode_registration_rejects_garbage() {
        assert!(matches!(
            decode_registration(b"tunnelId=abc"),
            Err(CodecError::Json(_))
        ));
    }

    #[test]
    fn test_decode_response() {
        let response = decode_response(
            br#"{"requestId":"r1","statusCode":200,"headers":{"Content-Type":["application/json"]},"body":"eyJvayI6dHJ1ZX0=","isBase64":true}"#,
        )
        .unwrap();

        assert_eq!(response.request_id, "r1");
        assert_eq!(response.status_code, 200);
        assert_eq!(
            response.headers["Content-Type"],
            vec!["application/json".to_string()]
        );
        assert!(response.is_base64);
    }

    #[test]
    fn test_decode_response_requires_request_id() {
        let err = decode_response(br#"{"statusCode":200}"#).unwrap_err();
        assert!(matches!(err, CodecError::Json(_)));

        let err = decode_response(br#"{"requestId":"","statusCode":200}"#).unwrap_err();
        assert!(matches!(err, CodecError::MissingField("requestId")));
    }

    #[test]
    fn test_decode_response_rejects_bad_status() {
        let err = decode_response(br#"{"requestId":"r","statusCode":42}"#).unwrap_err();
        assert!(matches!(err, CodecError::InvalidStatus(42)));

        assert!(decode_response(br#"{"requestId":"r","statusCode":-1}"#).is_err());
    }

    #[test]
    fn test_encode_error() {
        let text = encode_error("Send tunnelId first").unwrap();
        assert_eq!(text, r#"{"error":"Send tunnelId first"}"#);
    }
}
