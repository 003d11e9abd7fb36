//! Identity token representation and expiry logic.

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Tokens expiring within this window are treated as stale and re-fetched.
///
/// Covers clock skew between us and the verifier plus the duration of the
/// request the token is about to be attached to.
pub const REFRESH_BUFFER: Duration = Duration::from_secs(5 * 60);

/// Validity assumed when a token's expiry cannot be decoded.
///
/// This is an approximation: Google-minted identity tokens live for one hour,
/// but nothing guarantees that for opaque tokens.
pub const DEFAULT_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// A short-lived identity token scoped to one audience.
///
/// The value is never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct IdToken {
    value: String,
    expires_at: u64,
}

impl IdToken {
    /// Create a token with an explicit expiry (unix seconds).
    pub fn new(value: impl Into<String>, expires_at: u64) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    /// Build a token from a freshly minted string, decoding its expiry.
    ///
    /// For three-segment JWTs the `exp` claim of the payload segment is used.
    /// Anything else falls back to [`DEFAULT_VALIDITY`] from `now`.
    pub fn from_minted(value: impl Into<String>, now: u64) -> Self {
        let value = value.into();
        let expires_at = jwt_expiry(&value).unwrap_or(now + DEFAULT_VALIDITY.as_secs());
        Self { value, expires_at }
    }

    /// The raw token string, suitable for a `Bearer` header.
    #[must_use]
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Expiry as unix seconds.
    #[must_use]
    pub fn expires_at(&self) -> u64 {
        self.expires_at
    }

    /// Seconds left before expiry at `now` (zero once expired).
    #[must_use]
    pub fn remaining_at(&self, now: u64) -> u64 {
        self.expires_at.saturating_sub(now)
    }

    /// Return `true` if the token is still usable for more than
    /// [`REFRESH_BUFFER`] at `now`.
    #[must_use]
    pub fn is_fresh_at(&self, now: u64) -> bool {
        self.remaining_at(now) > REFRESH_BUFFER.as_secs()
    }

    /// [`Self::is_fresh_at`] against the system clock.
    #[must_use]
    pub fn is_fresh(&self) -> bool {
        self.is_fresh_at(unix_now())
    }
}

impl fmt::Debug for IdToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdToken")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Current unix time in seconds.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Decode the `exp` claim of a compact JWT without verifying it.
fn jwt_expiry(token: &str) -> Option<u64> {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_sig), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return None;
    };
    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = claims.get("exp")?;
    exp.as_u64().or_else(|| {
        // Some issuers emit fractional seconds.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        exp.as_f64().filter(|f| *f > 0.0).map(|f| f as u64)
    })
}
