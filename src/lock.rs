//! Named, TTL-bounded mutual exclusion shared by many processes.
//!
//! A [`DistributedRefreshLock`] polls a [`LockBackend`] until it acquires the
//! named lock or its bounded wait runs out. Acquisition yields a
//! [`LockGuard`]; the lock is released exactly once, either by
//! [`LockGuard::release`] or when the guard is dropped (including while
//! unwinding). A holder that crashes without releasing loses the lock when
//! its TTL lapses.
//!
//! Backends:
//! - [`FileLockBackend`]: lease files on a filesystem shared by all processes
//! - [`MemoryLockBackend`]: a single process (tests, single-node deployments)

mod file;
mod memory;

pub use file::FileLockBackend;
pub use memory::MemoryLockBackend;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::error::LockError;

/// Name of a lock.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockName(String);

impl LockName {
    /// Creates a lock name from an arbitrary string.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Name of the credential refresh lock for a principal within a tenant.
    /// An absent tenant maps to `default`.
    pub fn credential_refresh(principal_id: &str, tenant_id: Option<&str>) -> Self {
        Self(format!(
            "credential-refresh:{}:{}",
            principal_id,
            tenant_id.unwrap_or("default")
        ))
    }

    /// Returns the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Storage for lock ownership records.
///
/// Both operations must be atomic with respect to every process using the
/// same backend.
pub trait LockBackend: Send + Sync {
    /// Takes the lock for `owner` if it is free or its holder's TTL lapsed.
    /// Returns `Ok(false)` when another owner holds a live lease.
    fn try_acquire(&self, name: &LockName, owner: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Releases the lock if `owner` still holds it. Returns whether a lease
    /// owned by `owner` was removed.
    fn release(&self, name: &LockName, owner: &str) -> Result<bool, LockError>;
}

/// Timing parameters of a [`DistributedRefreshLock`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockSettings {
    /// Lease lifetime; must cover one refresh call
    pub ttl: Duration,
    /// Longest time `acquire` polls before giving up
    pub wait: Duration,
    /// Delay between polls
    pub poll_interval: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            wait: Duration::from_secs(2),
            poll_interval: Duration::from_millis(25),
        }
    }
}

/// A lock acquired with bounded wait and released exactly once.
#[derive(Clone)]
pub struct DistributedRefreshLock {
    backend: Arc<dyn LockBackend>,
    settings: LockSettings,
}

impl fmt::Debug for DistributedRefreshLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DistributedRefreshLock")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DistributedRefreshLock {
    /// Creates a lock over a backend.
    pub fn new(backend: Arc<dyn LockBackend>, settings: LockSettings) -> Self {
        Self { backend, settings }
    }

    /// Returns the timing parameters.
    pub fn settings(&self) -> LockSettings {
        self.settings
    }

    /// Acquires `name`, polling until the configured wait elapses.
    ///
    /// Returns `Ok(None)` if the lock stayed contended for the whole wait.
    ///
    /// # Errors
    ///
    /// Returns `LockError` if the backend fails.
    pub fn acquire(&self, name: &LockName) -> Result<Option<LockGuard>, LockError> {
        let owner = uuid::Uuid::new_v4().to_string();
        let start = Instant::now();
        loop {
            if self.backend.try_acquire(name, &owner, self.settings.ttl)? {
                tracing::debug!(lock = %name, "lock acquired");
                return Ok(Some(LockGuard {
                    backend: self.backend.clone(),
                    name: name.clone(),
                    owner,
                    released: false,
                }));
            }

            let elapsed = start.elapsed();
            if elapsed >= self.settings.wait {
                return Ok(None);
            }
            let remaining = self.settings.wait - elapsed;
            std::thread::sleep(self.settings.poll_interval.min(remaining));
        }
    }
}

/// Ownership of an acquired lock.
///
/// Dropping the guard releases the lock; [`LockGuard::release`] does the
/// same but reports backend errors.
pub struct LockGuard {
    backend: Arc<dyn LockBackend>,
    name: LockName,
    owner: String,
    released: bool,
}

impl fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .field("released", &self.released)
            .finish_non_exhaustive()
    }
}

impl LockGuard {
    /// Returns the lock name.
    pub fn name(&self) -> &LockName {
        &self.name
    }

    /// Releases the lock.
    ///
    /// # Errors
    ///
    /// Returns `LockError` if the backend fails; the lease then lapses with
    /// its TTL.
    pub fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        self.release_inner()
    }

    fn release_inner(&self) -> Result<(), LockError> {
        let removed = self.backend.release(&self.name, &self.owner)?;
        if !removed {
            tracing::warn!(lock = %self.name, "lease had already lapsed before release");
        }
        Ok(())
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.release_inner() {
            tracing::warn!(lock = %self.name, error = %err, "failed to release lock on drop");
        }
    }
}
