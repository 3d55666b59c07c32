//! Startup configuration.
//!
//! [`PipelineConfig`] is read from JSON (every field optional), then
//! overridden from `GUARD_*` environment variables, validated, and turned
//! into a [`PipelineBuilder`] with every collaborator wired. Durations are
//! milliseconds.
//!
//! ```
//! use guard_bridge::config::PipelineConfig;
//!
//! let config = PipelineConfig::from_json(r#"{
//!     "routes": [
//!         {"pattern": "/logout", "handler": "logout", "priority": 10},
//!         {"pattern": "/{path*}", "handler": "legacy_front", "kind": "legacy", "priority": -1}
//!     ],
//!     "lock_ttl_ms": 20000
//! }"#).unwrap();
//!
//! assert_eq!(config.lock_settings().ttl.as_secs(), 20);
//! assert_eq!(config.logout_path, "/logout");
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;

use crate::credential::{CredentialRefreshCoordinator, HttpRefreshClient};
use crate::error::ConfigError;
use crate::guard::{SessionValidityGuard, DEFAULT_EXCLUDED_HANDLERS};
use crate::legacy::{ContextIsolationExecutor, PartialOutputPolicy, Verbosity};
use crate::lock::{DistributedRefreshLock, FileLockBackend, LockBackend, LockSettings, MemoryLockBackend};
use crate::notice::{LogoutHandler, MemoryNoticeChannel};
use crate::pipeline::PipelineBuilder;
use crate::router::{RouteConfig, RouteTable};
use crate::session::{SessionKeys, SessionStore};

/// Pipeline configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    /// Route table, in declaration order
    pub routes: Vec<RouteConfig>,
    /// Reject a route table without a catch-all
    pub require_catch_all: bool,
    /// Where invalid sessions are redirected
    pub logout_path: String,
    /// Where the logout handler sends the user
    pub login_path: String,
    /// Query parameter carrying a notice token
    pub notice_param: String,
    /// How long an untaken notice stays readable
    pub notice_ttl_ms: u64,
    /// Keys a session must hold to pass the guard
    pub required_session_keys: Vec<String>,
    /// Handler ids the guard (and refresh) skip
    pub excluded_handlers: Vec<String>,
    /// Session keys for the credential and its refresh timestamp
    pub session_keys: SessionKeys,
    /// Refresh endpoint; refresh is disabled when absent
    pub refresh_endpoint: Option<String>,
    /// Timeout of one refresh call
    pub refresh_timeout_ms: u64,
    /// Refresh lock lease lifetime
    pub lock_ttl_ms: u64,
    /// Longest wait for the refresh lock
    pub lock_wait_ms: u64,
    /// Delay between lock polls
    pub lock_poll_ms: u64,
    /// Shared directory for lock leases; a process-local lock is used when absent
    pub lock_dir: Option<PathBuf>,
    /// Verbosity installed while a legacy handler runs
    pub legacy_verbosity: Verbosity,
    /// Working directory installed while a legacy handler runs
    pub legacy_root: PathBuf,
    /// Fate of output written before a legacy fault
    pub partial_output: PartialOutputPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let session_keys = SessionKeys::default();
        Self {
            routes: Vec::new(),
            require_catch_all: false,
            logout_path: "/logout".to_string(),
            login_path: "/login".to_string(),
            notice_param: "notice".to_string(),
            notice_ttl_ms: 300_000,
            required_session_keys: vec![session_keys.credential.clone(), session_keys.refresh_at.clone()],
            excluded_handlers: DEFAULT_EXCLUDED_HANDLERS.iter().map(|s| s.to_string()).collect(),
            session_keys,
            refresh_endpoint: None,
            refresh_timeout_ms: 10_000,
            lock_ttl_ms: 30_000,
            lock_wait_ms: 2_000,
            lock_poll_ms: 25,
            lock_dir: None,
            legacy_verbosity: Verbosity::Warning,
            legacy_root: PathBuf::from("/"),
            partial_output: PartialOutputPolicy::Discard,
        }
    }
}

impl PipelineConfig {
    /// Parses a JSON document. Missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::Parse` for invalid JSON or unknown fields.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Applies overrides from the process environment.
    ///
    /// # Recognized variables
    /// - `GUARD_REFRESH_ENDPOINT`
    /// - `GUARD_REFRESH_TIMEOUT_MS`
    /// - `GUARD_LOCK_TTL_MS`, `GUARD_LOCK_WAIT_MS`, `GUARD_LOCK_POLL_MS`
    /// - `GUARD_LOCK_DIR`
    /// - `GUARD_LOGOUT_PATH`, `GUARD_LOGIN_PATH`
    /// - `GUARD_LEGACY_ROOT`
    /// - `GUARD_LEGACY_VERBOSITY` (`fatal` .. `debug`)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable does not parse.
    pub fn with_env_overrides(self) -> Result<Self, ConfigError> {
        self.with_overrides(|name| std::env::var(name).ok())
    }

    /// Applies overrides from an arbitrary variable lookup.
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(endpoint) = lookup("GUARD_REFRESH_ENDPOINT") {
            self.refresh_endpoint = Some(endpoint);
        }
        if let Some(raw) = lookup("GUARD_REFRESH_TIMEOUT_MS") {
            self.refresh_timeout_ms = parse_ms("refresh_timeout_ms", &raw)?;
        }
        if let Some(raw) = lookup("GUARD_LOCK_TTL_MS") {
            self.lock_ttl_ms = parse_ms("lock_ttl_ms", &raw)?;
        }
        if let Some(raw) = lookup("GUARD_LOCK_WAIT_MS") {
            self.lock_wait_ms = parse_ms("lock_wait_ms", &raw)?;
        }
        if let Some(raw) = lookup("GUARD_LOCK_POLL_MS") {
            self.lock_poll_ms = parse_ms("lock_poll_ms", &raw)?;
        }
        if let Some(dir) = lookup("GUARD_LOCK_DIR") {
            self.lock_dir = Some(PathBuf::from(dir));
        }
        if let Some(path) = lookup("GUARD_LOGOUT_PATH") {
            self.logout_path = path;
        }
        if let Some(path) = lookup("GUARD_LOGIN_PATH") {
            self.login_path = path;
        }
        if let Some(root) = lookup("GUARD_LEGACY_ROOT") {
            self.legacy_root = PathBuf::from(root);
        }
        if let Some(raw) = lookup("GUARD_LEGACY_VERBOSITY") {
            self.legacy_verbosity =
                serde_json::from_value(serde_json::Value::String(raw.clone())).map_err(|_| {
                    ConfigError::InvalidValue {
                        key: "legacy_verbosity",
                        reason: format!("unknown verbosity '{}'", raw),
                    }
                })?;
        }
        Ok(self)
    }

    /// Checks cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` naming the first offending key.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, path) in [("logout_path", &self.logout_path), ("login_path", &self.login_path)] {
            if !path.starts_with('/') {
                return Err(invalid(key, format!("'{}' must start with '/'", path)));
            }
        }
        if self.notice_param.is_empty() {
            return Err(invalid("notice_param", "must not be empty".to_string()));
        }
        if self.notice_ttl_ms == 0 {
            return Err(invalid("notice_ttl_ms", "must be positive".to_string()));
        }
        if self.lock_poll_ms == 0 {
            return Err(invalid("lock_poll_ms", "must be positive".to_string()));
        }
        if self.refresh_timeout_ms == 0 {
            return Err(invalid("refresh_timeout_ms", "must be positive".to_string()));
        }
        // The lease must outlive one refresh call.
        if self.lock_ttl_ms <= self.refresh_timeout_ms {
            return Err(invalid(
                "lock_ttl_ms",
                format!(
                    "{} ms must exceed refresh_timeout_ms ({} ms)",
                    self.lock_ttl_ms, self.refresh_timeout_ms
                ),
            ));
        }
        Ok(())
    }

    /// Returns the lock timing.
    pub fn lock_settings(&self) -> LockSettings {
        LockSettings {
            ttl: Duration::from_millis(self.lock_ttl_ms),
            wait: Duration::from_millis(self.lock_wait_ms),
            poll_interval: Duration::from_millis(self.lock_poll_ms),
        }
    }

    /// Returns the refresh call timeout.
    pub fn refresh_timeout(&self) -> Duration {
        Duration::from_millis(self.refresh_timeout_ms)
    }

    /// Builds the compiled route table.
    ///
    /// # Errors
    ///
    /// See [`RouteTable::from_config`].
    pub fn route_table(&self) -> Result<RouteTable, ConfigError> {
        RouteTable::from_config(&self.routes, self.require_catch_all)
    }

    /// Builds the refresh coordinator, or `None` when no endpoint is set.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if the lock directory or HTTP
    /// client cannot be set up.
    pub fn refresh_coordinator(&self) -> Result<Option<CredentialRefreshCoordinator>, ConfigError> {
        let Some(endpoint) = &self.refresh_endpoint else {
            return Ok(None);
        };
        let client = HttpRefreshClient::new(endpoint.clone(), self.refresh_timeout())?;

        let backend: Arc<dyn LockBackend> = match &self.lock_dir {
            Some(dir) => Arc::new(
                FileLockBackend::new(dir.clone()).map_err(|err| invalid("lock_dir", err.to_string()))?,
            ),
            None => {
                tracing::warn!("no lock_dir configured; refresh lock only excludes this process");
                Arc::new(MemoryLockBackend::new())
            }
        };

        Ok(Some(CredentialRefreshCoordinator::new(
            Arc::new(client),
            DistributedRefreshLock::new(backend, self.lock_settings()),
            self.session_keys.clone(),
        )))
    }

    /// Validates the configuration and wires a [`PipelineBuilder`].
    ///
    /// The built-in [`LogoutHandler`] is registered under the id `logout`;
    /// register another handler with that id to replace it. Application
    /// handlers are registered on the returned builder.
    ///
    /// # Errors
    ///
    /// Returns the first `ConfigError` found.
    pub fn pipeline_builder(&self, sessions: Arc<dyn SessionStore>) -> Result<PipelineBuilder, ConfigError> {
        self.validate()?;
        let ttl_ms = i64::try_from(self.notice_ttl_ms).map_err(|_| invalid("notice_ttl_ms", "too large".to_string()))?;
        let notices = Arc::new(MemoryNoticeChannel::new(chrono::Duration::milliseconds(ttl_ms)));

        let guard = SessionValidityGuard::new(notices)
            .with_required_keys(self.required_session_keys.clone())
            .with_excluded_handlers(self.excluded_handlers.clone())
            .with_logout_path(self.logout_path.clone())
            .with_notice_param(self.notice_param.clone());

        let executor = ContextIsolationExecutor::new()
            .with_verbosity(self.legacy_verbosity)
            .with_root(self.legacy_root.clone())
            .with_partial_output(self.partial_output);

        let mut builder = PipelineBuilder::new(self.route_table()?, sessions, guard)
            .executor(executor)
            .modern("logout", LogoutHandler::new(self.login_path.clone(), self.notice_param.clone()));
        if let Some(coordinator) = self.refresh_coordinator()? {
            builder = builder.refresh(coordinator);
        }
        Ok(builder)
    }
}

fn parse_ms(key: &'static str, raw: &str) -> Result<u64, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| invalid(key, format!("'{}' is not a number of milliseconds", raw)))
}

fn invalid(key: &'static str, reason: String) -> ConfigError {
    ConfigError::InvalidValue { key, reason }
}
