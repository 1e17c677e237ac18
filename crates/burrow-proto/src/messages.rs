//! Protocol message types

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Header name → every value sent under that name
pub type HeaderMultimap = BTreeMap<String, Vec<String>>;

/// Registration sent by a client as its very first frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegisterMessage {
    #[serde(rename = "tunnelId", default, deserialize_with = "null_as_default")]
    pub tunnel_id: String,
}

/// An inbound HTTP request forwarded down a tunnel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRequest {
    pub request_id: String,
    pub method: String,
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: HeaderMultimap,
    /// Raw body bytes, carried as standard base64 text and omitted when empty
    #[serde(
        default,
        with = "base64_bytes",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub body: Vec<u8>,
}

/// A client's answer to a [`ProxyRequest`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    pub request_id: String,
    pub status_code: u16,
    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: HeaderMultimap,
    #[serde(default, deserialize_with = "null_as_default")]
    pub body: String,
    /// When set, `body` is standard base64 and must be decoded before use
    #[serde(default, deserialize_with = "null_as_default")]
    pub is_base64: bool,
}

impl ProxyResponse {
    /// Body as raw bytes, decoding base64 when `is_base64` is set
    pub fn body_bytes(&self) -> Result<Vec<u8>, base64::DecodeError> {
        if self.is_base64 {
            STANDARD.decode(self.body.as_bytes())
        } else {
            Ok(self.body.as_bytes().to_vec())
        }
    }
}

/// Written to a connection whose registration was rejected
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ErrorMessage {
    pub error: String,
}

/// Clients written against loosely-typed encoders send `null` for empty maps
/// and strings; treat it the same as an absent field.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        match Option::<String>::deserialize(deserializer)? {
            Some(text) => STANDARD.decode(text.as_bytes()).map_err(de::Error::custom),
            None => Ok(Vec::new()),
        }
    }
}
