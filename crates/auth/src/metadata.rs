//! GCE / Cloud Run metadata server: identity tokens for the attached
//! service account.

use async_trait::async_trait;
use idgate_types::{AuthError, IdTokenClient};
use std::time::Duration;

/// Host used when `GCE_METADATA_HOST` is unset.
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

/// Environment variable overriding the metadata host (`host[:port]`).
pub const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";

const FLAVOR_HEADER: &str = "Metadata-Flavor";
const FLAVOR_VALUE: &str = "Google";
const PROBE_TIMEOUT: Duration = Duration::from_secs(3);
const FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Handle on a metadata server endpoint.
#[derive(Debug, Clone)]
pub struct MetadataServer {
    http: reqwest::Client,
    base: String,
}

impl MetadataServer {
    /// Metadata server at `host` (`host[:port]`, no scheme).
    pub fn new(http: reqwest::Client, host: &str) -> Self {
        Self {
            http,
            base: format!("http://{host}/computeMetadata/v1"),
        }
    }

    /// Metadata server named by `GCE_METADATA_HOST`, or the default host.
    pub fn from_env(http: reqwest::Client) -> Self {
        let host = std::env::var(METADATA_HOST_ENV)
            .ok()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_METADATA_HOST.to_string());
        Self::new(http, &host)
    }

    /// Probe the server; `true` only if it answers as Google's metadata service.
    pub async fn is_available(&self) -> bool {
        let resp = self
            .http
            .get(format!("{}/", self.base))
            .header(FLAVOR_HEADER, FLAVOR_VALUE)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await;
        match resp {
            Ok(r) => r
                .headers()
                .get(FLAVOR_HEADER)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == FLAVOR_VALUE),
            Err(e) => {
                tracing::debug!(error = %e, "metadata server probe failed");
                false
            }
        }
    }

    /// A client minting tokens for `audience`.
    #[must_use]
    pub fn client_for(&self, audience: &str) -> MetadataIdTokenClient {
        MetadataIdTokenClient {
            server: self.clone(),
            audience: audience.to_string(),
        }
    }
}

/// Mints identity tokens for one audience via the metadata server.
pub struct MetadataIdTokenClient {
    server: MetadataServer,
    audience: String,
}

#[async_trait]
impl IdTokenClient for MetadataIdTokenClient {
    async fn fetch_id_token(&self) -> Result<String, AuthError> {
        let url = format!(
            "{}/instance/service-accounts/default/identity",
            self.server.base
        );
        let resp = self
            .server
            .http
            .get(url)
            .query(&[("audience", self.audience.as_str()), ("format", "full")])
            .header(FLAVOR_HEADER, FLAVOR_VALUE)
            .timeout(FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| AuthError::TokenFetchFailed(format!("metadata server request failed: {e}")))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| {
            AuthError::TokenFetchFailed(format!("failed to read metadata server response: {e}"))
        })?;
        if !status.is_success() {
            return Err(AuthError::TokenFetchFailed(format!(
                "metadata server returned {status}: {}",
                body.trim()
            )));
        }
        Ok(body.trim().to_string())
    }

    fn source(&self) -> &'static str {
        "metadata_server"
    }
}
