//! Externally issued credentials stored in the session, and their refresh.
//!
//! - [`expiration`]: pure staleness check
//! - [`refresh`]: the outbound refresh call
//! - [`coordinator`]: lock, re-check, refresh, commit

pub mod coordinator;
pub mod expiration;
pub mod refresh;

pub use coordinator::{CredentialRefreshCoordinator, RefreshOutcome};
pub use expiration::{is_expired, CredentialExpiration};
pub use refresh::{HttpRefreshClient, RefreshClient, RefreshRequest, RefreshedCredential};

use std::fmt;

/// An externally issued credential.
///
/// `Debug` and `Display` never print the value; use [`Credential::expose`]
/// where the raw value is genuinely needed (writing it to the session).
//
// Do not derive Debug, Display or Serialize here: each would leak the value.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    inner: String,
}

impl Credential {
    /// Wraps a credential value.
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            inner: value.into(),
        }
    }

    /// Returns the raw value.
    pub fn expose(&self) -> &str {
        &self.inner
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for Credential {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Credential::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_redacts_debug_and_display() {
        let credential = Credential::new("sk-live-123");
        assert_eq!(format!("{:?}", credential), "[REDACTED]");
        assert_eq!(format!("{}", credential), "[REDACTED]");
        assert_eq!(credential.expose(), "sk-live-123");
    }

    #[test]
    fn credential_deserializes_from_string() {
        let credential: Credential = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(credential.expose(), "abc");
    }
}
