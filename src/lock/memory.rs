use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use super::{LockBackend, LockName};
use crate::error::LockError;

#[derive(Debug)]
struct Lease {
    owner: String,
    expires_at: Instant,
}

/// Lock backend held in process memory.
///
/// Only excludes holders that share this instance; a fleet of processes
/// needs [`super::FileLockBackend`] or another external backend.
#[derive(Debug, Default)]
pub struct MemoryLockBackend {
    leases: Mutex<HashMap<String, Lease>>,
}

impl MemoryLockBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if `name` has a live lease.
    pub fn is_held(&self, name: &LockName) -> bool {
        self.leases
            .lock()
            .get(name.as_str())
            .is_some_and(|lease| lease.expires_at > Instant::now())
    }
}

impl LockBackend for MemoryLockBackend {
    fn try_acquire(&self, name: &LockName, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let now = Instant::now();
        let mut leases = self.leases.lock();
        if let Some(lease) = leases.get(name.as_str()) {
            if lease.expires_at > now && lease.owner != owner {
                return Ok(false);
            }
        }
        leases.insert(
            name.as_str().to_string(),
            Lease {
                owner: owner.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(true)
    }

    fn release(&self, name: &LockName, owner: &str) -> Result<bool, LockError> {
        let mut leases = self.leases.lock();
        match leases.get(name.as_str()) {
            Some(lease) if lease.owner == owner => {
                leases.remove(name.as_str());
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contended_lock_is_refused() {
        let backend = MemoryLockBackend::new();
        let name = LockName::new("a");

        assert!(backend.try_acquire(&name, "one", Duration::from_secs(10)).unwrap());
        assert!(!backend.try_acquire(&name, "two", Duration::from_secs(10)).unwrap());
        assert!(backend.is_held(&name));
    }

    #[test]
    fn expired_lease_can_be_taken_over() {
        let backend = MemoryLockBackend::new();
        let name = LockName::new("a");

        assert!(backend.try_acquire(&name, "crashed", Duration::from_millis(1)).unwrap());
        std::thread::sleep(Duration::from_millis(5));
        assert!(backend.try_acquire(&name, "next", Duration::from_secs(10)).unwrap());

        // The crashed holder's late release must not free the new lease.
        assert!(!backend.release(&name, "crashed").unwrap());
        assert!(backend.is_held(&name));
    }

    #[test]
    fn release_by_owner_frees_lock() {
        let backend = MemoryLockBackend::new();
        let name = LockName::new("a");
        backend.try_acquire(&name, "one", Duration::from_secs(10)).unwrap();

        assert!(backend.release(&name, "one").unwrap());
        assert!(!backend.is_held(&name));
        assert!(backend.try_acquire(&name, "two", Duration::from_secs(10)).unwrap());
    }
}
