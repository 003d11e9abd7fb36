//! State shared by every call through one proxy instance.

use crate::session::SessionManager;
use idgate_auth::TokenManager;
use idgate_types::HttpTransport;
use std::{sync::Arc, time::Duration};

/// Everything a call needs: the target, its credentials, the session and the
/// transport. Shared across tasks behind an `Arc`.
pub struct ProxyContext {
    pub(crate) target_url: String,
    pub(crate) timeout: Duration,
    pub(crate) tokens: Arc<TokenManager>,
    pub(crate) session: SessionManager,
    pub(crate) transport: Arc<dyn HttpTransport>,
}

impl ProxyContext {
    /// `target_url` doubles as the token audience.
    pub fn new(
        target_url: impl Into<String>,
        timeout: Duration,
        tokens: Arc<TokenManager>,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            target_url: target_url.into(),
            timeout,
            tokens,
            session: SessionManager::new(),
            transport,
        }
    }

    #[must_use]
    pub fn session(&self) -> &SessionManager {
        &self.session
    }
}
