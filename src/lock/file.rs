//! Lease files on a shared filesystem.
//!
//! Each lock name owns two files in the lease directory:
//!
//! - `<name>.lock`: never removed; holds an exclusive `flock` while a
//!   process inspects or changes the lease
//! - `<name>.lease`: JSON with the owner token and expiry (unix
//!   milliseconds); present while the lock is held
//!
//! Every read, expiry check and rewrite of a lease happens under the
//! exclusive file lock, so two contenders can never both take over the same
//! expired lease. A process that dies mid-update drops its file lock with
//! its descriptors; its lease then lapses with the TTL.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use super::{LockBackend, LockName};
use crate::error::LockError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Lease {
    owner: String,
    expires_at_ms: i64,
}

enum LeaseState {
    Missing,
    Unreadable,
    Present(Lease),
}

/// Exclusive hold on a lock name's `.lock` file. Closing the file releases it.
struct Held {
    _file: File,
}

/// Lock backend storing leases as files in a directory shared by every
/// process (a local directory for one host, a shared mount for a fleet).
///
/// The filesystem must honour `flock` across every participating process.
#[derive(Debug, Clone)]
pub struct FileLockBackend {
    dir: PathBuf,
}

impl FileLockBackend {
    /// Creates a backend rooted at `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns `LockError::Io` if the directory cannot be created.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, LockError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| LockError::io(&dir.display().to_string(), e))?;
        Ok(Self { dir })
    }

    /// Returns the lease directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Returns the path of the lease file for `name`.
    pub fn lease_path(&self, name: &LockName) -> PathBuf {
        self.dir.join(format!("{}.lease", file_stem(name.as_str())))
    }

    fn lock_path(&self, name: &LockName) -> PathBuf {
        self.dir.join(format!("{}.lock", file_stem(name.as_str())))
    }

    /// Blocks until this process holds `name`'s file lock. The hold only
    /// spans one lease inspection or update.
    fn hold(&self, name: &LockName) -> Result<Held, LockError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(self.lock_path(name))
            .map_err(|e| LockError::io(name.as_str(), e))?;
        FileExt::lock_exclusive(&file).map_err(|e| LockError::io(name.as_str(), e))?;
        Ok(Held { _file: file })
    }

    fn read_lease(&self, name: &LockName, path: &Path) -> Result<LeaseState, LockError> {
        match fs::read_to_string(path) {
            Ok(raw) => Ok(match serde_json::from_str(&raw) {
                Ok(lease) => LeaseState::Present(lease),
                Err(_) => LeaseState::Unreadable,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LeaseState::Missing),
            Err(e) => Err(LockError::io(name.as_str(), e)),
        }
    }

    /// Replaces the lease through a temp file and `rename`, so a crash never
    /// leaves a half-written lease behind.
    fn write_lease(&self, name: &LockName, path: &Path, lease: &Lease) -> Result<(), LockError> {
        let tmp = path.with_extension(format!("{}.tmp", uuid::Uuid::new_v4().simple()));
        let body = serde_json::to_vec(lease).map_err(|e| LockError::io(name.as_str(), e.into()))?;

        let written = File::create(&tmp)
            .and_then(|mut file| file.write_all(&body).and_then(|()| file.sync_all()))
            .and_then(|()| fs::rename(&tmp, path));
        if let Err(e) = written {
            if let Err(cleanup) = fs::remove_file(&tmp) {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(lock = %name, error = %cleanup, "failed to remove lease temp file");
                }
            }
            return Err(LockError::io(name.as_str(), e));
        }
        Ok(())
    }
}

impl LockBackend for FileLockBackend {
    fn try_acquire(&self, name: &LockName, owner: &str, ttl: Duration) -> Result<bool, LockError> {
        let path = self.lease_path(name);
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let _held = self.hold(name)?;

        let now_ms = Utc::now().timestamp_millis();
        match self.read_lease(name, &path)? {
            LeaseState::Present(current) if current.owner != owner && current.expires_at_ms > now_ms => {
                return Ok(false);
            }
            LeaseState::Present(current) if current.owner != owner => {
                tracing::info!(lock = %name, "taking over expired lease");
            }
            LeaseState::Unreadable => {
                tracing::warn!(lock = %name, "replacing unreadable lease");
            }
            LeaseState::Present(_) | LeaseState::Missing => {}
        }

        self.write_lease(
            name,
            &path,
            &Lease {
                owner: owner.to_string(),
                expires_at_ms: now_ms.saturating_add(ttl_ms),
            },
        )?;
        Ok(true)
    }

    fn release(&self, name: &LockName, owner: &str) -> Result<bool, LockError> {
        let path = self.lease_path(name);
        let _held = self.hold(name)?;

        match self.read_lease(name, &path)? {
            LeaseState::Present(lease) if lease.owner == owner => match fs::remove_file(&path) {
                Ok(()) => Ok(true),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
                Err(e) => Err(LockError::io(name.as_str(), e)),
            },
            LeaseState::Present(_) | LeaseState::Missing => Ok(false),
            LeaseState::Unreadable => Err(LockError::CorruptLease {
                name: name.as_str().to_string(),
            }),
        }
    }
}

/// Maps a lock name to a portable file stem.
fn file_stem(name: &str) -> String {
    let mut stem = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            stem.push(byte as char);
        } else {
            stem.push_str(&format!("%{byte:02X}"));
        }
    }
    stem
}
