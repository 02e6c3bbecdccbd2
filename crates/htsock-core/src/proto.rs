//! Wire-level protocol pieces shared by both peers.
//!
//! The transport runs entirely over HTTP: `HEAD` opens a session, `PATCH`
//! carries client-to-server batches in its body and server-to-client batches
//! in its (possibly long-held) response, `DELETE` closes. Session identity
//! and close metadata ride in the headers defined here; message batches are
//! JSON arrays of opaque values.

use serde_json::Value;

/// Header carrying the session id on every poll and close request.
pub const SOCKET_ID: &str = "socket-id";
/// Handshake response header advertising the server's pool limit.
pub const MAX_POOL_SIZE: &str = "max-pool-size";
/// Close handshake header: decimal close code.
pub const CLOSE_CODE: &str = "close-code";
/// Close handshake header: human-readable close reason.
pub const CLOSE_REASON: &str = "close-reason";

/// Normal closure.
pub const CLOSE_NORMAL: u16 = 1000;
/// Endpoint is going away (e.g. process shutdown).
pub const CLOSE_GOING_AWAY: u16 = 1001;
/// Protocol or transport error.
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;

/// Close code + reason pair delivered on session termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
}

impl CloseInfo {
    pub fn new(code: u16, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }

    /// Normal closure with an empty reason.
    pub fn normal() -> Self {
        Self::new(CLOSE_NORMAL, "")
    }
}

/// Parse a `close-code` header value. Anything that is not a decimal
/// integer maps to [`CLOSE_NORMAL`].
pub fn parse_close_code(raw: &str) -> u16 {
    raw.trim().parse().unwrap_or(CLOSE_NORMAL)
}

/// Generate a random session id (hex-encoded, 16 bytes = 32 hex chars).
pub fn generate_session_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..16).map(|_| rng.gen()).collect();
    hex::encode(bytes)
}

/// Encode a message batch as a JSON array.
///
/// `Value` serialization cannot fail, so this is infallible.
pub fn encode_batch(batch: &[Value]) -> String {
    serde_json::to_string(batch).unwrap_or_else(|_| "[]".to_string())
}

/// Decode a request or response body into a message batch.
///
/// Returns `None` for empty bodies, non-UTF-8 bytes, invalid JSON, or JSON
/// that is not an array. Callers treat all of those as "no messages".
pub fn decode_batch(body: &[u8]) -> Option<Vec<Value>> {
    if body.is_empty() {
        return None;
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Array(items)) => Some(items),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn session_id_shape() {
        let id = generate_session_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(id, generate_session_id());
    }

    #[test]
    fn close_code_parsing() {
        assert_eq!(parse_close_code("1001"), 1001);
        assert_eq!(parse_close_code(" 1002 "), 1002);
        assert_eq!(parse_close_code("abc"), CLOSE_NORMAL);
        assert_eq!(parse_close_code(""), CLOSE_NORMAL);
        assert_eq!(parse_close_code("-5"), CLOSE_NORMAL);
        assert_eq!(parse_close_code("99999999"), CLOSE_NORMAL);
    }

    #[test]
    fn batch_round_trip() {
        let batch = vec![json!("a"), json!({"k": 1}), json!(null)];
        let encoded = encode_batch(&batch);
        assert_eq!(decode_batch(encoded.as_bytes()), Some(batch));
    }

    #[test]
    fn batch_tolerates_garbage() {
        assert_eq!(decode_batch(b""), None);
        assert_eq!(decode_batch(b"not json"), None);
        assert_eq!(decode_batch(b"{\"k\":1}"), None);
        assert_eq!(decode_batch(&[0xff, 0xfe]), None);
    }

    #[test]
    fn empty_batch_encodes_as_empty_array() {
        assert_eq!(encode_batch(&[]), "[]");
        assert_eq!(decode_batch(b"[]"), Some(vec![]));
    }
}
