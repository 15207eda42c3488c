// SPDX-License-Identifier: MIT
//! JSON-RPC 2.0 wire codec.
//!
//! Every frame on a mesh socket is one of three shapes:
//!
//! - request — `{jsonrpc, method, params, id}`
//! - notification — `{jsonrpc, method, params}` (no `id`)
//! - response — `{jsonrpc, id, result}` or `{jsonrpc, id, error}`
//!
//! The `jsonrpc` version tag is mandatory. A response must carry exactly one
//! of `result`/`error`. Unknown fields are ignored for forward compatibility.
//! Frames that violate any of this are malformed, and the peer that sent them
//! gets its connection closed.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

/// Protocol version carried in every frame.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Default cap on a single text frame. Oversize frames close the connection.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

// ─── Error codes ─────────────────────────────────────────────────────────────

pub const PARSE_ERROR: i64 = -32700;
pub const INVALID_REQUEST: i64 = -32600;
pub const METHOD_NOT_FOUND: i64 = -32601;
pub const INVALID_PARAMS: i64 = -32602;
pub const INTERNAL_ERROR: i64 = -32603;

/// Why a frame could not be decoded.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("frame exceeds size cap: {size} bytes (max {max})")]
    Oversize { size: usize, max: usize },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing or mismatched protocol version")]
    BadVersion,

    #[error("frame matches no known shape")]
    UnknownShape,

    #[error("response carries both result and error")]
    ResultAndError,
}

/// Error object carried inside a response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// A decoded wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request {
        id: Value,
        method: String,
        params: Value,
    },
    Notification {
        method: String,
        params: Value,
    },
    Response {
        id: Value,
        result: Option<Value>,
        error: Option<RpcError>,
    },
}

impl Frame {
    /// Decode a text frame, enforcing the size cap and version tag.
    pub fn decode(text: &str, max_bytes: usize) -> Result<Frame, ProtocolError> {
        if text.len() > max_bytes {
            return Err(ProtocolError::Oversize {
                size: text.len(),
                max: max_bytes,
            });
        }

        let value: Value = serde_json::from_str(text)?;
        let obj = value.as_object().ok_or(ProtocolError::UnknownShape)?;

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(PROTOCOL_VERSION) => {}
            _ => return Err(ProtocolError::BadVersion),
        }

        if let Some(method) = obj.get("method") {
            let method = method
                .as_str()
                .ok_or(ProtocolError::UnknownShape)?
                .to_string();
            let params = obj.get("params").cloned().unwrap_or(Value::Null);
            return match obj.get("id") {
                Some(id) if !id.is_null() => Ok(Frame::Request {
                    id: id.clone(),
                    method,
                    params,
                }),
                _ => Ok(Frame::Notification { method, params }),
            };
        }

        let has_result = obj.contains_key("result");
        let has_error = obj.contains_key("error");
        if has_result || has_error {
            if has_result && has_error {
                return Err(ProtocolError::ResultAndError);
            }
            let id = obj.get("id").cloned().ok_or(ProtocolError::UnknownShape)?;
            let error = match obj.get("error") {
                Some(e) => Some(serde_json::from_value(e.clone())?),
                None => None,
            };
            return Ok(Frame::Response {
                id,
                result: obj.get("result").cloned(),
                error,
            });
        }

        Err(ProtocolError::UnknownShape)
    }
}

// ─── Encoders ────────────────────────────────────────────────────────────────

/// Encode a request frame.
pub fn request(id: &Value, method: &str, params: Value) -> String {
    json!({
        "jsonrpc": PROTOCOL_VERSION,
        "method": method,
        "params": params,
        "id": id,
    })
    .to_string()
}

/// Encode a notification frame (no response expected).
pub fn notification(method: &str, params: Value) -> String {
    json!({
        "jsonrpc": PROTOCOL_VERSION,
        "method": method,
        "params": params,
    })
    .to_string()
}

/// Encode a success response echoing the request id.
pub fn response(id: &Value, result: Value) -> String {
    json!({
        "jsonrpc": PROTOCOL_VERSION,
        "id": id,
        "result": result,
    })
    .to_string()
}

/// Encode an error response echoing the request id.
pub fn error_response(id: &Value, code: i64, message: &str) -> String {
    json!({
        "jsonrpc": PROTOCOL_VERSION,
        "id": id,
        "error": RpcError::new(code, message),
    })
    .to_string()
}
