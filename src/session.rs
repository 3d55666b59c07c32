//! Server-side sessions shared across processes.
//!
//! A session is a string-to-string map addressed by an opaque token. The map
//! lives in a [`SessionStore`], which every process serving the client must be
//! able to reach. [`Session`] is a borrowed handle binding a store to one
//! token for the duration of a request.

mod store;

pub use store::{MemorySessionStore, SessionStore};

use serde::Deserialize;

use crate::error::StoreError;

/// Names of the session keys the credential machinery reads and writes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionKeys {
    /// Key holding the active credential
    pub credential: String,
    /// Key holding the next-refresh timestamp (unix seconds)
    pub refresh_at: String,
}

impl Default for SessionKeys {
    fn default() -> Self {
        Self {
            credential: "credential".to_string(),
            refresh_at: "credential_refresh_at".to_string(),
        }
    }
}

/// A request-scoped view of one session.
#[derive(Clone, Copy)]
pub struct Session<'a> {
    store: &'a dyn SessionStore,
    token: &'a str,
}

impl std::fmt::Debug for Session<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The token addresses the session; keep it out of logs.
        f.debug_struct("Session").field("token", &"[REDACTED]").finish()
    }
}

impl<'a> Session<'a> {
    /// Binds a store to a session token.
    pub fn new(store: &'a dyn SessionStore, token: &'a str) -> Self {
        Self { store, token }
    }

    /// Returns the session token.
    pub fn token(&self) -> &str {
        self.token
    }

    /// Reads one key.
    pub fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.store.get(self.token, key)
    }

    /// Reads several keys from one consistent snapshot.
    ///
    /// The result holds exactly one entry per key, in key order; a store
    /// answering with any other count is reported as `StoreError::ShortRead`.
    pub fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
        let values = self.store.get_many(self.token, keys)?;
        if values.len() != keys.len() {
            return Err(StoreError::ShortRead {
                requested: keys.len(),
                returned: values.len(),
            });
        }
        Ok(values)
    }

    /// Writes one key.
    pub fn set(&self, key: &str, value: impl Into<String>) -> Result<(), StoreError> {
        self.store.set(self.token, key, value.into())
    }

    /// Writes several keys atomically: readers see all of them or none.
    pub fn set_many(&self, entries: &[(&str, String)]) -> Result<(), StoreError> {
        self.store.set_many(self.token, entries)
    }

    /// Removes a key, returning its previous value.
    pub fn remove(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.store.remove(self.token, key)
    }

    /// Destroys the whole session.
    pub fn destroy(&self) -> Result<(), StoreError> {
        self.store.destroy(self.token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_handle_reads_and_writes_its_own_token() {
        let store = MemorySessionStore::new();
        let a = Session::new(&store, "tok-a");
        let b = Session::new(&store, "tok-b");

        a.set("credential", "abc").unwrap();
        assert_eq!(a.get("credential").unwrap().as_deref(), Some("abc"));
        assert_eq!(b.get("credential").unwrap(), None);
    }

    #[test]
    fn debug_redacts_token() {
        let store = MemorySessionStore::new();
        let session = Session::new(&store, "very-secret-token");
        let debug = format!("{:?}", session);
        assert!(!debug.contains("very-secret-token"));
    }

    /// Store whose batched read drops the last value.
    struct TruncatingStore(MemorySessionStore);

    impl SessionStore for TruncatingStore {
        fn get(&self, token: &str, key: &str) -> Result<Option<String>, StoreError> {
            self.0.get(token, key)
        }
        fn get_many(&self, token: &str, keys: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
            let mut values = self.0.get_many(token, keys)?;
            values.pop();
            Ok(values)
        }
        fn set(&self, token: &str, key: &str, value: String) -> Result<(), StoreError> {
            self.0.set(token, key, value)
        }
        fn set_many(&self, token: &str, entries: &[(&str, String)]) -> Result<(), StoreError> {
            self.0.set_many(token, entries)
        }
        fn remove(&self, token: &str, key: &str) -> Result<Option<String>, StoreError> {
            self.0.remove(token, key)
        }
        fn destroy(&self, token: &str) -> Result<(), StoreError> {
            self.0.destroy(token)
        }
    }

    #[test]
    fn short_batched_read_is_an_error() {
        let store = TruncatingStore(MemorySessionStore::new());
        let session = Session::new(&store, "tok");
        session.set("a", "1").unwrap();

        let err = session.get_many(&["a", "b"]).unwrap_err();
        assert!(matches!(err, StoreError::ShortRead { requested: 2, returned: 1 }));
        assert_eq!(err.to_string(), "session store returned 1 values for 2 keys");
    }

    #[test]
    fn default_keys() {
        let keys = SessionKeys::default();
        assert_eq!(keys.credential, "credential");
        assert_eq!(keys.refresh_at, "credential_refresh_at");
    }
}
