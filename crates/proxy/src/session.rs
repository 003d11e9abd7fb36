//! The MCP session id negotiated during the `initialize` handshake.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Header carrying the session id, in both directions.
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Holder for the current session id.
///
/// Values are stored as received; the upstream owns their format.
#[derive(Debug, Default)]
pub struct SessionManager {
    id: Mutex<Option<String>>,
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<String>> {
        self.id.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The current session id, if one has been established.
    #[must_use]
    pub fn get(&self) -> Option<String> {
        self.lock().clone()
    }

    /// Replace the session id.
    pub fn set(&self, id: impl Into<String>) {
        *self.lock() = Some(id.into());
    }

    /// Forget the session id. Clearing an empty session is a no-op.
    pub fn clear(&self) {
        if let Some(old) = self.lock().take() {
            tracing::info!(session = %old, "session cleared");
        }
    }
}
