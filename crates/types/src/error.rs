//! Error taxonomy shared across idgate crates.

use serde_json::Value;
use thiserror::Error;

/// Failure to obtain an identity token.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No credential source could be found, or the one found cannot mint
    /// identity tokens.
    #[error("{0}")]
    NoCredentials(String),

    /// The audience is not an absolute `https` URL.
    #[error("{0}")]
    InvalidAudience(String),

    /// The credential source failed while minting a token.
    #[error("{0}")]
    TokenFetchFailed(String),

    /// A token was returned but is unusable.
    #[error("{0}")]
    InvalidToken(String),
}

impl AuthError {
    /// Stable machine-readable name of the variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NoCredentials(_) => "no-credentials",
            Self::InvalidAudience(_) => "invalid-audience",
            Self::TokenFetchFailed(_) => "token-fetch-failed",
            Self::InvalidToken(_) => "invalid-token",
        }
    }
}

/// Failure of the physical HTTP exchange with the upstream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    /// Connection, TLS or I/O failure.
    #[error("{0}")]
    Network(String),

    /// Deadline exceeded, or the caller cancelled the request.
    #[error("{0}")]
    Timeout(String),

    /// The upstream answered with a non-success status.
    #[error("{status} {}", reason_phrase(.status))]
    HttpStatus { status: u16, body: String },

    /// The body could not be decoded.
    #[error("{0}")]
    Parse(String),
}

impl UpstreamError {
    /// Stable machine-readable name of the variant.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Network(_) => "network",
            Self::Timeout(_) => "timeout",
            Self::HttpStatus { .. } => "http-status",
            Self::Parse(_) => "parse",
        }
    }

    /// HTTP status, for [`UpstreamError::HttpStatus`].
    #[must_use]
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether the upstream no longer recognises our session.
    #[must_use]
    pub fn is_session_gone(&self) -> bool {
        self.status() == Some(404)
    }
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn reason_phrase(status: &u16) -> &'static str {
    http::StatusCode::from_u16(*status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown Status")
}

/// The upstream body is not a JSON-RPC response to our request.
#[derive(Debug, Clone, PartialEq, Error)]
#[error("invalid response format: {reason}")]
pub struct ShapeError {
    pub reason: String,
    /// The payload exactly as received.
    pub payload: Value,
}

impl ShapeError {
    pub fn new(reason: impl Into<String>, payload: Value) -> Self {
        Self {
            reason: reason.into(),
            payload,
        }
    }
}

/// Every failure reachable while proxying a request.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProxyError {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Shape(#[from] ShapeError),

    /// A bug or panic inside the proxy.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Internal(e.to_string())
    }
}
