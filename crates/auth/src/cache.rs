//! In-memory identity token cache backed by a `HashMap` behind a `Mutex`.

use idgate_types::IdToken;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Audience-keyed token cache shared by all in-flight calls.
///
/// Entries live for the process lifetime and are only replaced or evicted
/// explicitly; nothing sweeps them on a timer.
#[derive(Default)]
pub struct TokenCache {
    data: Mutex<HashMap<String, IdToken>>,
}

impl TokenCache {
    /// Creates a new empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, IdToken>> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the cached token for `audience`, fresh or not.
    #[must_use]
    pub fn get(&self, audience: &str) -> Option<IdToken> {
        self.lock().get(audience).cloned()
    }

    /// Returns the cached token for `audience` if it is outside the refresh buffer.
    #[must_use]
    pub fn get_fresh(&self, audience: &str) -> Option<IdToken> {
        self.lock()
            .get(audience)
            .filter(|t| t.is_fresh())
            .cloned()
    }

    /// Stores (or wholesale replaces) the token for `audience`.
    pub fn insert(&self, audience: &str, token: IdToken) {
        self.lock().insert(audience.to_string(), token);
    }

    /// Evicts the token for `audience`, returning it if present.
    pub fn remove(&self, audience: &str) -> Option<IdToken> {
        self.lock().remove(audience)
    }

    /// Number of cached audiences.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is cached.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
