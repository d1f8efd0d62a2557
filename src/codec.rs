//! Newline-delimited JSON wire codec.
//!
//! Every message is one JSON object followed by `\n`: a request carries
//! `{"service", "method", "payload"}`, a response carries `{"payload"}`.
//! Errors are carried in-band as `payload.error`; the codec itself never
//! decides to close a connection, it only translates bytes to/from the
//! framed types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// A single request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub service: String,
    pub method: String,
    pub payload: Value,
}

/// A single response frame. An error is carried as `payload["error"]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub payload: Value,
}

impl Response {
    pub fn ok(payload: Value) -> Self {
        Self { payload }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            payload: serde_json::json!({ "error": message.into() }),
        }
    }

    /// The in-band error message, if this response represents a failure.
    pub fn error_message(&self) -> Option<&str> {
        self.payload.get("error").and_then(Value::as_str)
    }
}

/// Encode a request as a single `\n`-terminated line.
pub fn encode_request(request: &Request) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(request).map_err(|e| CodecError::Malformed(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Decode a request from a single line (the trailing `\n` already stripped
/// by the reader).
pub fn decode_request(line: &str) -> Result<Request, CodecError> {
    serde_json::from_str(line).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Encode a response as a single `\n`-terminated line.
pub fn encode_response(response: &Response) -> Result<String, CodecError> {
    let mut line =
        serde_json::to_string(response).map_err(|e| CodecError::Malformed(e.to_string()))?;
    line.push('\n');
    Ok(line)
}

/// Decode a response from a single line.
pub fn decode_response(line: &str) -> Result<Response, CodecError> {
    serde_json::from_str(line).map_err(|e| CodecError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trips() {
        let req = Request {
            service: "RaftService".to_string(),
            method: "GetStatus".to_string(),
            payload: serde_json::json!({"requester_id": "pytest"}),
        };
        let line = encode_request(&req).unwrap();
        assert!(line.ends_with('\n'));
        let decoded = decode_request(line.trim_end()).unwrap();
        assert_eq!(decoded.service, "RaftService");
        assert_eq!(decoded.method, "GetStatus");
    }

    #[test]
    fn response_round_trips() {
        let resp = Response::ok(serde_json::json!({"success": true}));
        let line = encode_response(&resp).unwrap();
        let decoded = decode_response(line.trim_end()).unwrap();
        assert_eq!(decoded.payload["success"], true);
    }

    #[test]
    fn error_response_carries_in_band_error() {
        let resp = Response::error("method_not_found");
        assert_eq!(resp.error_message(), Some("method_not_found"));
    }

    #[test]
    fn decode_rejects_malformed_json() {
        assert!(decode_request("not json").is_err());
    }

    #[test]
    fn decode_rejects_missing_fields() {
        assert!(decode_request(r#"{"service": "X"}"#).is_err());
    }
}
