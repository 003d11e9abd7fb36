//! Service-account key files: identity tokens via the JWT-bearer grant.
//!
//! A self-signed RS256 assertion carrying `target_audience` is exchanged at
//! the key's `token_uri`; Google answers with an `id_token` scoped to that
//! audience.

use async_trait::async_trait;
use idgate_types::{AuthError, IdTokenClient, token::unix_now};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc};

/// Google's OAuth 2.0 token endpoint, used when the key file names none.
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: u64 = 3600;

/// The fields of a `service_account` key file we need.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
}

impl ServiceAccountKey {
    /// The token endpoint to exchange assertions at.
    #[must_use]
    pub fn token_uri(&self) -> &str {
        self.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI)
    }
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("private_key", &"<redacted>")
            .field("token_uri", &self.token_uri())
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct AssertionClaims {
    iss: String,
    sub: String,
    aud: String,
    iat: u64,
    exp: u64,
    target_audience: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    #[serde(default)]
    id_token: Option<String>,
}

/// Build the signed assertion for `audience` at time `now`.
///
/// # Errors
///
/// Returns [`AuthError::TokenFetchFailed`] if the private key cannot be
/// loaded or signing fails.
pub fn build_assertion(
    key: &ServiceAccountKey,
    audience: &str,
    now: u64,
) -> Result<String, AuthError> {
    let mut header = Header::new(Algorithm::RS256);
    header.kid.clone_from(&key.private_key_id);

    let claims = AssertionClaims {
        iss: key.client_email.clone(),
        sub: key.client_email.clone(),
        aud: key.token_uri().to_string(),
        iat: now,
        exp: now + ASSERTION_LIFETIME_SECS,
        target_audience: audience.to_string(),
    };

    let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(|e| {
        AuthError::TokenFetchFailed(format!(
            "invalid private key for {}: {e}",
            key.client_email
        ))
    })?;
    jsonwebtoken::encode(&header, &claims, &signing_key)
        .map_err(|e| AuthError::TokenFetchFailed(format!("failed to sign assertion: {e}")))
}

/// Mints identity tokens for one audience from a service-account key.
pub struct ServiceAccountClient {
    http: reqwest::Client,
    key: Arc<ServiceAccountKey>,
    audience: String,
}

impl ServiceAccountClient {
    pub fn new(http: reqwest::Client, key: Arc<ServiceAccountKey>, audience: &str) -> Self {
        Self {
            http,
            key,
            audience: audience.to_string(),
        }
    }
}

#[async_trait]
impl IdTokenClient for ServiceAccountClient {
    async fn fetch_id_token(&self) -> Result<String, AuthError> {
        let assertion = build_assertion(&self.key, &self.audience, unix_now())?;

        let resp = self
            .http
            .post(self.key.token_uri())
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(|e| {
                AuthError::TokenFetchFailed(format!("token endpoint request failed: {e}"))
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::TokenFetchFailed(format!(
                "token endpoint returned {status}: {body}"
            )));
        }

        let parsed: TokenResponse = resp.json().await.map_err(|e| {
            AuthError::TokenFetchFailed(format!("failed to parse token response: {e}"))
        })?;
        parsed.id_token.filter(|t| !t.is_empty()).ok_or_else(|| {
            AuthError::TokenFetchFailed("token response did not contain an id_token".into())
        })
    }

    fn source(&self) -> &'static str {
        "service_account"
    }
}
