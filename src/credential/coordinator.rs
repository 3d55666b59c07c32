//! Lazy, single-flight credential refresh.
//!
//! [`CredentialRefreshCoordinator::maybe_refresh`] runs on every
//! authenticated request but only does work when the session's credential is
//! stale:
//!
//! ```text
//! read expiration ── fresh ──────────────────────────────▶ Fresh
//!        │ stale
//!        ▼
//! acquire lock ─── contended / backend error ────────────▶ Deferred
//!        │ held
//!        ▼
//! re-read expiration ── fresh ───────────────────────────▶ AlreadyRefreshed
//!        │ stale
//!        ▼
//! refresh call ── error ─────────────────────────────────▶ Failed
//!        │ ok
//!        ▼
//! write credential + timestamp together ─────────────────▶ Refreshed
//! ```
//!
//! The lock is released on every path once acquired. A request that defers
//! keeps using the current credential; a later request picks up the refresh.

use std::sync::Arc;

use super::expiration::CredentialExpiration;
use super::refresh::{RefreshClient, RefreshRequest};
use crate::audit::{AuditEvent, AuditEventKind, AuditOutcome, AuditSink, TracingAuditSink};
use crate::clock::{Clock, SystemClock};
use crate::error::{RefreshError, StoreError};
use crate::lock::{DistributedRefreshLock, LockName};
use crate::logging::RequestLog;
use crate::request::Principal;
use crate::session::{Session, SessionKeys};

/// Result of one [`CredentialRefreshCoordinator::maybe_refresh`] call.
///
/// None of these abort the request; they describe what happened so callers
/// and tests can tell the paths apart.
#[derive(Debug)]
pub enum RefreshOutcome {
    /// The credential was not stale; nothing was locked
    Fresh,
    /// Another holder has the lock (or the lock backend failed)
    Deferred,
    /// The credential became fresh while waiting for the lock
    AlreadyRefreshed,
    /// A new credential was written to the session
    Refreshed,
    /// The refresh call failed; the session was left untouched
    Failed(RefreshError),
    /// The session store could not be read or written
    SessionUnavailable(StoreError),
}

impl RefreshOutcome {
    fn audit_outcome(&self) -> AuditOutcome {
        match self {
            RefreshOutcome::Fresh | RefreshOutcome::AlreadyRefreshed => AuditOutcome::Skipped,
            RefreshOutcome::Deferred => AuditOutcome::Deferred,
            RefreshOutcome::Refreshed => AuditOutcome::Success,
            RefreshOutcome::Failed(_) | RefreshOutcome::SessionUnavailable(_) => AuditOutcome::Error,
        }
    }
}

/// Refreshes a session's credential at most once concurrently per
/// `(principal, tenant)`.
pub struct CredentialRefreshCoordinator {
    client: Arc<dyn RefreshClient>,
    lock: DistributedRefreshLock,
    keys: SessionKeys,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for CredentialRefreshCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialRefreshCoordinator")
            .field("lock", &self.lock)
            .field("keys", &self.keys)
            .finish_non_exhaustive()
    }
}

impl CredentialRefreshCoordinator {
    /// Creates a coordinator using the system clock and tracing audit sink.
    pub fn new(client: Arc<dyn RefreshClient>, lock: DistributedRefreshLock, keys: SessionKeys) -> Self {
        Self {
            client,
            lock,
            keys,
            clock: Arc::new(SystemClock),
            audit: Arc::new(TracingAuditSink),
        }
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the audit sink.
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Returns the session keys this coordinator reads and writes.
    pub fn keys(&self) -> &SessionKeys {
        &self.keys
    }

    /// Refreshes the session's credential if it is stale.
    pub fn maybe_refresh(&self, principal: &Principal, session: &Session<'_>, log: RequestLog<'_>) -> RefreshOutcome {
        let tenant = principal.tenant_id.as_deref();

        match self.is_stale(session) {
            Ok(false) => return RefreshOutcome::Fresh,
            Ok(true) => {}
            Err(err) => {
                log.warn(format_args!("could not read credential expiration: {}", err));
                return self.finish(principal, log, RefreshOutcome::SessionUnavailable(err));
            }
        }

        self.audit.emit(&self.event(principal, log, AuditEventKind::RefreshAttempt, AuditOutcome::Attempted));

        let name = LockName::credential_refresh(&principal.id, tenant);
        let guard = match self.lock.acquire(&name) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                log.info(format_args!("credential refresh deferred: lock {} is held", name));
                return self.finish(principal, log, RefreshOutcome::Deferred);
            }
            Err(err) => {
                log.warn(format_args!("credential refresh deferred: lock backend failed: {}", err));
                return self.finish(principal, log, RefreshOutcome::Deferred);
            }
        };

        let outcome = self.refresh_locked(principal, session, log);

        if let Err(err) = guard.release() {
            log.warn(format_args!("failed to release {}: {}", name, err));
        }
        self.finish(principal, log, outcome)
    }

    fn refresh_locked(&self, principal: &Principal, session: &Session<'_>, log: RequestLog<'_>) -> RefreshOutcome {
        // Another process may have refreshed while we waited for the lock.
        match self.is_stale(session) {
            Ok(false) => return RefreshOutcome::AlreadyRefreshed,
            Ok(true) => {}
            Err(err) => return RefreshOutcome::SessionUnavailable(err),
        }

        let request = RefreshRequest {
            principal_id: &principal.id,
            tenant_id: principal.tenant_id.as_deref(),
        };
        let refreshed = match self.client.refresh(&request) {
            Ok(refreshed) => refreshed,
            Err(err) => {
                log.warn(format_args!("credential refresh failed, keeping current credential: {}", err));
                return RefreshOutcome::Failed(err);
            }
        };

        let entries = [
            (self.keys.credential.as_str(), refreshed.credential.expose().to_string()),
            (self.keys.refresh_at.as_str(), refreshed.next_refresh_at.timestamp().to_string()),
        ];
        match session.set_many(&entries) {
            Ok(()) => {
                log.info(format_args!(
                    "credential refreshed, next refresh at {}",
                    refreshed.next_refresh_at
                ));
                RefreshOutcome::Refreshed
            }
            Err(err) => {
                log.error(format_args!("refreshed credential could not be stored: {}", err));
                RefreshOutcome::SessionUnavailable(err)
            }
        }
    }

    fn is_stale(&self, session: &Session<'_>) -> Result<bool, StoreError> {
        let expiration = CredentialExpiration::from_session(session, &self.keys)?;
        Ok(expiration.is_expired(self.clock.now()))
    }

    fn finish(&self, principal: &Principal, log: RequestLog<'_>, outcome: RefreshOutcome) -> RefreshOutcome {
        let mut event = self.event(principal, log, AuditEventKind::RefreshOutcome, outcome.audit_outcome());
        match &outcome {
            RefreshOutcome::Failed(err) => event = event.with_detail(err.to_string()),
            RefreshOutcome::SessionUnavailable(err) => event = event.with_detail(err.to_string()),
            _ => {}
        }
        self.audit.emit(&event);
        outcome
    }

    fn event(
        &self,
        principal: &Principal,
        log: RequestLog<'_>,
        kind: AuditEventKind,
        outcome: AuditOutcome,
    ) -> AuditEvent {
        let event = AuditEvent::new(log.request_id(), Some(principal.id.as_str()), kind, outcome);
        event.with_tenant(principal.tenant_id.as_deref().unwrap_or("default"))
    }
}
