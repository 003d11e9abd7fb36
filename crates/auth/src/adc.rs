//! Application Default Credentials discovery.
//!
//! Sources are tried in order, first match wins:
//! 1. the key file named by `GOOGLE_APPLICATION_CREDENTIALS`;
//! 2. the gcloud well-known file;
//! 3. the GCE metadata server.
//!
//! A successful discovery is kept for the process lifetime. Failures are not,
//! so a later call retries discovery from scratch.

use crate::{
    metadata::MetadataServer,
    service_account::{ServiceAccountClient, ServiceAccountKey},
};
use async_trait::async_trait;
use idgate_types::{AuthError, CredentialProvider, IdTokenClient};
use serde_json::Value;
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::sync::OnceCell;

/// Environment variable naming an explicit key file.
pub const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

const WELL_KNOWN_FILE: &str = "application_default_credentials.json";

/// Where identity tokens will be minted from.
#[derive(Debug, Clone)]
pub enum CredentialSource {
    ServiceAccount(Arc<ServiceAccountKey>),
    MetadataServer(MetadataServer),
}

impl CredentialSource {
    fn client_for(&self, http: &reqwest::Client, audience: &str) -> Box<dyn IdTokenClient> {
        match self {
            Self::ServiceAccount(key) => Box::new(ServiceAccountClient::new(
                http.clone(),
                Arc::clone(key),
                audience,
            )),
            Self::MetadataServer(server) => Box::new(server.client_for(audience)),
        }
    }
}

/// The places discovery looks, resolved up front.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    /// Explicit key file; when set, it must be usable.
    pub explicit_file: Option<PathBuf>,
    /// gcloud's well-known file; skipped if it does not exist.
    pub well_known_file: Option<PathBuf>,
    /// Metadata server to probe last.
    pub metadata: Option<MetadataServer>,
}

impl Discovery {
    /// Resolve locations from the process environment.
    pub fn from_env(http: &reqwest::Client) -> Self {
        Self {
            explicit_file: std::env::var_os(CREDENTIALS_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            well_known_file: well_known_file(),
            metadata: Some(MetadataServer::from_env(http.clone())),
        }
    }

    async fn run(&self) -> Result<CredentialSource, AuthError> {
        if let Some(path) = &self.explicit_file {
            tracing::debug!(path = %path.display(), "using {CREDENTIALS_ENV}");
            return load_key_file(path);
        }
        if let Some(path) = self.well_known_file.as_deref().filter(|p| p.is_file()) {
            tracing::debug!(path = %path.display(), "using gcloud application default credentials");
            return load_key_file(path);
        }
        if let Some(server) = &self.metadata
            && server.is_available().await
        {
            tracing::debug!("using metadata server credentials");
            return Ok(CredentialSource::MetadataServer(server.clone()));
        }
        Err(AuthError::NoCredentials(format!(
            "could not find Application Default Credentials; set {CREDENTIALS_ENV} to a \
             service account key file, run `gcloud auth application-default login`, or run \
             on Google Cloud with an attached service account"
        )))
    }
}

/// Path of gcloud's application default credentials file.
///
/// `$CLOUDSDK_CONFIG` wins; otherwise `%APPDATA%\gcloud` on Windows and
/// `~/.config/gcloud` elsewhere.
#[must_use]
pub fn well_known_file() -> Option<PathBuf> {
    if let Some(dir) = std::env::var_os("CLOUDSDK_CONFIG").filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(dir).join(WELL_KNOWN_FILE));
    }
    let config_dir = if cfg!(windows) {
        PathBuf::from(std::env::var_os("APPDATA")?).join("gcloud")
    } else {
        PathBuf::from(std::env::var_os("HOME")?)
            .join(".config")
            .join("gcloud")
    };
    Some(config_dir.join(WELL_KNOWN_FILE))
}

/// Read and classify a credentials file.
///
/// # Errors
///
/// Returns [`AuthError::NoCredentials`] if the file cannot be read or parsed,
/// or holds a credential type that cannot mint identity tokens.
pub fn load_key_file(path: &Path) -> Result<CredentialSource, AuthError> {
    let raw = std::fs::read_to_string(path).map_err(|e| {
        AuthError::NoCredentials(format!(
            "cannot read credentials file {}: {e}",
            path.display()
        ))
    })?;
    parse_credentials(&raw).map_err(|e| match e {
        AuthError::NoCredentials(msg) => {
            AuthError::NoCredentials(format!("{}: {msg}", path.display()))
        }
        other => other,
    })
}

/// Classify the JSON content of a credentials file.
///
/// # Errors
///
/// See [`load_key_file`].
pub fn parse_credentials(raw: &str) -> Result<CredentialSource, AuthError> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| AuthError::NoCredentials(format!("malformed credentials file: {e}")))?;
    let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "service_account" => {
            let key: ServiceAccountKey = serde_json::from_value(value).map_err(|e| {
                AuthError::NoCredentials(format!("malformed service account key: {e}"))
            })?;
            Ok(CredentialSource::ServiceAccount(Arc::new(key)))
        }
        "authorized_user" => Err(AuthError::NoCredentials(
            "user credentials cannot mint identity tokens for an arbitrary audience; \
             use a service account key or run on Google Cloud"
                .into(),
        )),
        "" => Err(AuthError::NoCredentials(
            "credentials file has no \"type\" field".into(),
        )),
        other => Err(AuthError::NoCredentials(format!(
            "credential type {other:?} cannot mint identity tokens"
        ))),
    }
}

/// [`CredentialProvider`] backed by Application Default Credentials.
pub struct AdcProvider {
    http: reqwest::Client,
    discovery: Discovery,
    discovered: OnceCell<CredentialSource>,
}

impl AdcProvider {
    /// Provider that discovers credentials from the process environment.
    pub fn new(http: reqwest::Client) -> Self {
        let discovery = Discovery::from_env(&http);
        Self::with_discovery(http, discovery)
    }

    /// Provider searching the given locations.
    pub fn with_discovery(http: reqwest::Client, discovery: Discovery) -> Self {
        Self {
            http,
            discovery,
            discovered: OnceCell::new(),
        }
    }

    /// The discovered source, running discovery if it has not succeeded yet.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::NoCredentials`] when no usable source exists.
    pub async fn source(&self) -> Result<&CredentialSource, AuthError> {
        self.discovered
            .get_or_try_init(|| self.discovery.run())
            .await
    }
}

#[async_trait]
impl CredentialProvider for AdcProvider {
    async fn client_for(&self, audience: &str) -> Result<Box<dyn IdTokenClient>, AuthError> {
        let source = self.source().await?;
        Ok(source.client_for(&self.http, audience))
    }
}
