use chrono::{DateTime, TimeZone, Utc};

use crate::error::StoreError;
use crate::session::{Session, SessionKeys};

/// Returns true if a credential with the given expiration must be refreshed.
///
/// An absent timestamp counts as expired: a credential of unknown age is
/// refreshed eagerly. The boundary is inclusive.
///
/// ```
/// use chrono::{Duration, Utc};
/// use guard_bridge::credential::is_expired;
///
/// let now = Utc::now();
/// assert!(is_expired(None, now));
/// assert!(is_expired(Some(now), now));
/// assert!(!is_expired(Some(now + Duration::seconds(1)), now));
/// ```
pub fn is_expired(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    match expires_at {
        None => true,
        Some(at) => now >= at,
    }
}

/// Expiration of the credential held in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CredentialExpiration(Option<DateTime<Utc>>);

impl CredentialExpiration {
    /// Wraps an optional timestamp.
    pub fn new(at: Option<DateTime<Utc>>) -> Self {
        Self(at)
    }

    /// Reads the expiration from a session in one snapshot.
    ///
    /// The timestamp is treated as absent when the credential itself is
    /// missing, or when the timestamp key is missing or unparseable.
    pub fn from_session(session: &Session<'_>, keys: &SessionKeys) -> Result<Self, StoreError> {
        let values = session.get_many(&[keys.credential.as_str(), keys.refresh_at.as_str()])?;
        let at = match (values.first(), values.get(1)) {
            (Some(Some(_)), Some(Some(raw))) => parse_unix_seconds(raw),
            _ => None,
        };
        Ok(Self(at))
    }

    /// Returns the timestamp, if known.
    pub fn at(&self) -> Option<DateTime<Utc>> {
        self.0
    }

    /// See [`is_expired`].
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        is_expired(self.0, now)
    }
}

pub(crate) fn parse_unix_seconds(raw: &str) -> Option<DateTime<Utc>> {
    let secs = raw.trim().parse::<i64>().ok()?;
    Utc.timestamp_opt(secs, 0).single()
}
