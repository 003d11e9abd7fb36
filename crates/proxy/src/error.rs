//! Maps every proxy failure to the JSON-RPC error object sent to the client.
//!
//! | Failure                          | Code   |
//! |----------------------------------|--------|
//! | any [`AuthError`]                | -32603 |
//! | upstream 401 / 403               | -32002 |
//! | upstream 404                     | -32601 |
//! | other upstream 4xx               | -32602 |
//! | upstream 5xx, network, timeout   | -32603 |
//! | undecodable upstream body        | -32700 |
//! | malformed response envelope      | -32603 |
//! | panic inside the proxy           | -32603 |
//!
//! `data.kind` and `data.source` identify the failure. The bearer token never
//! appears in any field.

use idgate_types::{
    AuthError, ProtocolError, ProxyError, ShapeError, UpstreamError, jsonrpc::codes,
};
use serde_json::json;

/// Message used for every malformed upstream envelope.
pub const INVALID_RESPONSE_MESSAGE: &str = "Invalid response format from target server";

/// Translate a token acquisition failure.
#[must_use]
pub fn from_auth(e: &AuthError) -> ProtocolError {
    ProtocolError::new(codes::INTERNAL_ERROR, format!("Authentication failed: {e}")).with_data(
        json!({
            "source": "auth",
            "kind": e.kind(),
        }),
    )
}

/// Code for an upstream HTTP status that reached the error path.
#[must_use]
pub fn status_code(status: u16) -> i32 {
    match status {
        401 | 403 => codes::UPSTREAM_UNAUTHORIZED,
        404 => codes::METHOD_NOT_FOUND,
        400..=499 => codes::INVALID_PARAMS,
        _ => codes::INTERNAL_ERROR,
    }
}

/// Translate a transport failure.
#[must_use]
pub fn from_upstream(e: &UpstreamError) -> ProtocolError {
    let (code, message) = match e {
        UpstreamError::HttpStatus { status, .. } => (status_code(*status), format!("HTTP error: {e}")),
        UpstreamError::Network(m) => (codes::INTERNAL_ERROR, format!("Network error: {m}")),
        UpstreamError::Timeout(m) => (codes::INTERNAL_ERROR, format!("Request timeout: {m}")),
        UpstreamError::Parse(m) => (codes::PARSE_ERROR, format!("Parse error: {m}")),
    };
    let mut data = json!({
        "source": "upstream",
        "kind": e.kind(),
    });
    if let UpstreamError::HttpStatus { status, body } = e {
        data["status"] = json!(status);
        data["body"] = json!(body);
    }
    ProtocolError::new(code, message).with_data(data)
}

/// Translate a malformed upstream envelope; the raw payload is kept.
#[must_use]
pub fn from_shape(e: &ShapeError) -> ProtocolError {
    ProtocolError::new(codes::INTERNAL_ERROR, INVALID_RESPONSE_MESSAGE).with_data(json!({
        "source": "response",
        "kind": "invalid-response",
        "reason": e.reason,
        "payload": e.payload,
    }))
}

/// Translate a bug or panic.
#[must_use]
pub fn from_unexpected(detail: &str) -> ProtocolError {
    ProtocolError::new(codes::INTERNAL_ERROR, format!("Internal error: {detail}")).with_data(
        json!({
            "source": "internal",
            "kind": "internal",
        }),
    )
}

/// Translate any [`ProxyError`].
#[must_use]
pub fn translate(e: &ProxyError) -> ProtocolError {
    match e {
        ProxyError::Auth(e) => from_auth(e),
        ProxyError::Upstream(e) => from_upstream(e),
        ProxyError::Shape(e) => from_shape(e),
        ProxyError::Internal(detail) => from_unexpected(detail),
    }
}
