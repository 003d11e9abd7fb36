//! Async traits shared across all idgate crates.
//!
//! Every cross-crate abstraction is defined here so that higher layers depend
//! only on `idgate-types`, not on each other.

use crate::{AuthError, UpstreamError};
use async_trait::async_trait;
use http::HeaderMap;
use serde_json::Value;
use std::time::Duration;

/// Mints identity tokens for the audience it was created for.
#[async_trait]
pub trait IdTokenClient: Send + Sync {
    /// Mint a fresh token string.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::TokenFetchFailed`] if the credential source
    /// cannot produce a token.
    async fn fetch_id_token(&self) -> Result<String, AuthError>;

    /// Human-readable name of the credential source, for logs.
    fn source(&self) -> &'static str;
}

/// Locates credentials able to mint identity tokens.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Return a client that mints tokens for `audience`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NoCredentials`] if no usable credential source
    /// exists or the one found cannot mint identity tokens.
    async fn client_for(&self, audience: &str) -> Result<Box<dyn IdTokenClient>, AuthError>;
}

/// A single outbound POST.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Value,
    pub timeout: Duration,
}

/// A successful (2xx) upstream exchange.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Response headers; lookups are case-insensitive.
    pub headers: HeaderMap,
    /// Parsed JSON body, `null` when the body was empty.
    pub data: Value,
}

/// Performs the physical HTTP call to the upstream.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// POST `request.body` to `request.url`, honouring `request.timeout`.
    ///
    /// # Errors
    ///
    /// Returns an [`UpstreamError`] describing the network, timeout, status
    /// or decoding failure.
    async fn post(&self, request: UpstreamRequest) -> Result<UpstreamResponse, UpstreamError>;
}
