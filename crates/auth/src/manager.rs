//! Identity token lifecycle: validate, cache, fetch, refresh.
//!
//! Responsibilities:
//! - Reject audiences that are not absolute `https` URLs before any I/O.
//! - Serve cached tokens until they enter the five-minute refresh buffer.
//! - Coalesce concurrent misses for one audience into a single fetch.
//! - Expose an explicit refresh that evicts first.
use crate::cache::TokenCache;
use idgate_types::{AuthError, CredentialProvider, IdToken, token::unix_now};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use url::Url;

pub struct TokenManager {
    provider: Arc<dyn CredentialProvider>,
    cache: TokenCache,
    /// Per-audience fetch locks so only one mint runs at a time.
    fetching: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl TokenManager {
    pub fn new(provider: Arc<dyn CredentialProvider>) -> Self {
        Self {
            provider,
            cache: TokenCache::new(),
            fetching: Mutex::new(HashMap::new()),
        }
    }

    /// The underlying cache.
    #[must_use]
    pub fn cache(&self) -> &TokenCache {
        &self.cache
    }

    /// Retrieve a token for `audience`, minting one if the cached token is
    /// missing or inside the refresh buffer.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InvalidAudience`] for a malformed audience, or the
    /// credential provider's error if a fetch was needed and failed.
    pub async fn get_token(&self, audience: &str) -> Result<IdToken, AuthError> {
        validate_audience(audience)?;

        if let Some(token) = self.cache.get_fresh(audience) {
            return Ok(token);
        }

        let lock = self.fetch_lock(audience);
        let _guard = lock.lock().await;

        // Another caller may have finished the fetch while we waited.
        if let Some(token) = self.cache.get_fresh(audience) {
            return Ok(token);
        }
        self.fetch_and_store(audience).await
    }

    /// Evict the cached token for `audience` and mint a new one.
    ///
    /// # Errors
    ///
    /// Same as [`Self::get_token`].
    pub async fn refresh_token(&self, audience: &str) -> Result<IdToken, AuthError> {
        validate_audience(audience)?;
        self.cache.remove(audience);

        let lock = self.fetch_lock(audience);
        let _guard = lock.lock().await;
        self.fetch_and_store(audience).await
    }

    fn fetch_lock(&self, audience: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self.fetching.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(map.entry(audience.to_string()).or_default())
    }

    async fn fetch_and_store(&self, audience: &str) -> Result<IdToken, AuthError> {
        let client = self.provider.client_for(audience).await?;
        let raw = client.fetch_id_token().await?;
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(AuthError::TokenFetchFailed(format!(
                "{} returned an empty identity token",
                client.source()
            )));
        }

        let token = IdToken::from_minted(raw, unix_now());
        tracing::debug!(
            audience,
            source = client.source(),
            expires_in = token.remaining_at(unix_now()),
            "minted identity token"
        );
        self.cache.insert(audience, token.clone());
        Ok(token)
    }
}

/// Check that `audience` is an absolute `https` URL with a host.
///
/// # Errors
///
/// Returns [`AuthError::InvalidAudience`] otherwise.
pub fn validate_audience(audience: &str) -> Result<(), AuthError> {
    let url = Url::parse(audience)
        .map_err(|e| AuthError::InvalidAudience(format!("invalid audience {audience:?}: {e}")))?;
    if url.scheme() != "https" {
        return Err(AuthError::InvalidAudience(format!(
            "audience {audience:?} must use https"
        )));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(AuthError::InvalidAudience(format!(
            "audience {audience:?} has no host"
        )));
    }
    Ok(())
}
