use std::collections::HashMap;

use parking_lot::RwLock;

use crate::error::StoreError;

/// Storage backend for sessions.
///
/// Implementations must be reachable from every process serving a client
/// (a shared cache or database in production). `set_many` must be atomic with
/// respect to `get_many`: a reader never observes half of a multi-key write.
pub trait SessionStore: Send + Sync {
    /// Reads one key. `Ok(None)` when the key or the session is absent.
    fn get(&self, token: &str, key: &str) -> Result<Option<String>, StoreError>;

    /// Reads several keys from one consistent snapshot.
    fn get_many(&self, token: &str, keys: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
        keys.iter().map(|key| self.get(token, key)).collect()
    }

    /// Writes one key, creating the session if needed.
    fn set(&self, token: &str, key: &str, value: String) -> Result<(), StoreError>;

    /// Writes several keys atomically.
    fn set_many(&self, token: &str, entries: &[(&str, String)]) -> Result<(), StoreError>;

    /// Removes one key, returning its previous value.
    fn remove(&self, token: &str, key: &str) -> Result<Option<String>, StoreError>;

    /// Destroys the session and all its keys.
    fn destroy(&self, token: &str) -> Result<(), StoreError>;
}

/// Process-local session store.
///
/// Share one instance between pipelines (via `Arc`) to simulate a fleet
/// served by the same external store.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<String, HashMap<String, String>>>,
}

impl MemorySessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a session exists for the token.
    pub fn contains_session(&self, token: &str) -> bool {
        self.sessions.read().contains_key(token)
    }

    /// Returns the number of live sessions.
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Returns true if no sessions exist.
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl SessionStore for MemorySessionStore {
    fn get(&self, token: &str, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .sessions
            .read()
            .get(token)
            .and_then(|data| data.get(key))
            .cloned())
    }

    fn get_many(&self, token: &str, keys: &[&str]) -> Result<Vec<Option<String>>, StoreError> {
        let sessions = self.sessions.read();
        let data = sessions.get(token);
        Ok(keys
            .iter()
            .map(|key| data.and_then(|d| d.get(*key)).cloned())
            .collect())
    }

    fn set(&self, token: &str, key: &str, value: String) -> Result<(), StoreError> {
        self.sessions
            .write()
            .entry(token.to_string())
            .or_default()
            .insert(key.to_string(), value);
        Ok(())
    }

    fn set_many(&self, token: &str, entries: &[(&str, String)]) -> Result<(), StoreError> {
        let mut sessions = self.sessions.write();
        let data = sessions.entry(token.to_string()).or_default();
        for (key, value) in entries {
            data.insert((*key).to_string(), value.clone());
        }
        Ok(())
    }

    fn remove(&self, token: &str, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .sessions
            .write()
            .get_mut(token)
            .and_then(|data| data.remove(key)))
    }

    fn destroy(&self, token: &str) -> Result<(), StoreError> {
        self.sessions.write().remove(token);
        Ok(())
    }
}
