//! Audit event schema and types.

use std::fmt;

/// Kind of pipeline event being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEventKind {
    /// A session failed validation and the request was redirected
    SessionInvalid,
    /// A credential refresh was started
    RefreshAttempt,
    /// A credential refresh finished (see the outcome)
    RefreshOutcome,
    /// A legacy handler faulted and was contained
    LegacyFault,
}

impl fmt::Display for AuditEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditEventKind::SessionInvalid => write!(f, "session_invalid"),
            AuditEventKind::RefreshAttempt => write!(f, "refresh_attempt"),
            AuditEventKind::RefreshOutcome => write!(f, "refresh_outcome"),
            AuditEventKind::LegacyFault => write!(f, "legacy_fault"),
        }
    }
}

/// Outcome of an audited step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOutcome {
    /// The step started
    Attempted,
    /// The step completed and changed state
    Success,
    /// The request was redirected
    Redirected,
    /// Another request holds the refresh lock; this one deferred
    Deferred,
    /// Nothing needed doing after re-checking under the lock
    Skipped,
    /// The step failed; state was left untouched
    Error,
}

impl fmt::Display for AuditOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditOutcome::Attempted => write!(f, "attempted"),
            AuditOutcome::Success => write!(f, "success"),
            AuditOutcome::Redirected => write!(f, "redirected"),
            AuditOutcome::Deferred => write!(f, "deferred"),
            AuditOutcome::Skipped => write!(f, "skipped"),
            AuditOutcome::Error => write!(f, "error"),
        }
    }
}

/// A structured event containing only identifiers and outcomes.
///
/// # Example
///
/// ```
/// use guard_bridge::audit::{AuditEvent, AuditEventKind, AuditOutcome};
///
/// let event = AuditEvent::new(
///     "req-123",
///     Some("user-1"),
///     AuditEventKind::SessionInvalid,
///     AuditOutcome::Redirected,
/// )
/// .with_missing_keys(vec!["credential".to_string()]);
///
/// assert_eq!(event.principal(), Some("user-1"));
/// assert_eq!(event.missing_keys(), ["credential".to_string()]);
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    request_id: String,
    principal: Option<String>,
    tenant: Option<String>,
    kind: AuditEventKind,
    outcome: AuditOutcome,
    missing_keys: Vec<String>,
    handler: Option<String>,
    detail: Option<String>,
}

impl AuditEvent {
    /// Creates a new event.
    pub fn new(
        request_id: impl Into<String>,
        principal: Option<impl Into<String>>,
        kind: AuditEventKind,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            principal: principal.map(Into::into),
            tenant: None,
            kind,
            outcome,
            missing_keys: Vec::new(),
            handler: None,
            detail: None,
        }
    }

    /// Sets the tenant the event applies to.
    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// Sets the session keys found missing.
    pub fn with_missing_keys(mut self, keys: Vec<String>) -> Self {
        self.missing_keys = keys;
        self
    }

    /// Sets the handler id involved.
    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    /// Sets a free-form detail (error text, reason code).
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Returns the request id.
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Returns the principal id, if any.
    pub fn principal(&self) -> Option<&str> {
        self.principal.as_deref()
    }

    /// Returns the tenant id, if any.
    pub fn tenant(&self) -> Option<&str> {
        self.tenant.as_deref()
    }

    /// Returns the event kind.
    pub fn kind(&self) -> AuditEventKind {
        self.kind
    }

    /// Returns the outcome.
    pub fn outcome(&self) -> AuditOutcome {
        self.outcome
    }

    /// Returns the missing session keys (empty unless `SessionInvalid`).
    pub fn missing_keys(&self) -> &[String] {
        &self.missing_keys
    }

    /// Returns the handler id, if any.
    pub fn handler(&self) -> Option<&str> {
        self.handler.as_deref()
    }

    /// Returns the detail, if any.
    pub fn detail(&self) -> Option<&str> {
        self.detail.as_deref()
    }
}

impl fmt::Display for AuditEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "AuditEvent[kind={}, outcome={}, request_id={}, principal={}",
            self.kind,
            self.outcome,
            self.request_id,
            self.principal.as_deref().unwrap_or("<none>")
        )?;

        if let Some(tenant) = &self.tenant {
            write!(f, ", tenant={}", tenant)?;
        }
        if !self.missing_keys.is_empty() {
            write!(f, ", missing_keys={}", self.missing_keys.join(","))?;
        }
        if let Some(handler) = &self.handler {
            write!(f, ", handler={}", handler)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, ", detail={}", detail)?;
        }

        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_and_outcome_display() {
        assert_eq!(AuditEventKind::SessionInvalid.to_string(), "session_invalid");
        assert_eq!(AuditEventKind::RefreshOutcome.to_string(), "refresh_outcome");
        assert_eq!(AuditOutcome::Deferred.to_string(), "deferred");
        assert_eq!(AuditOutcome::Redirected.to_string(), "redirected");
    }

    #[test]
    fn builder_sets_every_field() {
        let event = AuditEvent::new(
            "req-1",
            Some("user-1"),
            AuditEventKind::RefreshOutcome,
            AuditOutcome::Error,
        )
        .with_tenant("store-2")
        .with_handler("dashboard")
        .with_detail("refresh endpoint timed out");

        assert_eq!(event.tenant(), Some("store-2"));
        assert_eq!(event.handler(), Some("dashboard"));
        assert_eq!(event.detail(), Some("refresh endpoint timed out"));
        assert!(event.missing_keys().is_empty());
    }

    #[test]
    fn display_lists_missing_keys() {
        let event = AuditEvent::new(
            "req-2",
            Some("user-2"),
            AuditEventKind::SessionInvalid,
            AuditOutcome::Redirected,
        )
        .with_missing_keys(vec!["credential".into(), "credential_refresh_at".into()]);

        let display = event.to_string();
        assert!(display.contains("session_invalid"));
        assert!(display.contains("missing_keys=credential,credential_refresh_at"));
    }

    #[test]
    fn display_without_principal() {
        let event = AuditEvent::new(
            "req-anon",
            None::<String>,
            AuditEventKind::LegacyFault,
            AuditOutcome::Error,
        );
        assert!(event.principal().is_none());
        assert!(event.to_string().contains("<none>"));
    }
}
