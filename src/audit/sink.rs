//! Audit sinks.

use super::AuditEvent;

/// Destination for pipeline audit events.
///
/// Implementations must be cheap and non-blocking; they run on the request
/// path.
pub trait AuditSink: Send + Sync {
    /// Emits one event.
    fn emit(&self, event: &AuditEvent);
}

/// Emits audit events as structured `tracing` records under the
/// `guard_audit` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn emit(&self, event: &AuditEvent) {
        emit_to_tracing(event);
    }
}

pub(crate) fn emit_to_tracing(event: &AuditEvent) {
    tracing::info!(
        target: "guard_audit",
        request_id = %event.request_id(),
        principal_id = ?event.principal(),
        tenant_id = ?event.tenant(),
        kind = %event.kind(),
        outcome = %event.outcome(),
        missing_keys = ?event.missing_keys(),
        handler = ?event.handler(),
        detail = ?event.detail(),
        "audit event"
    );
}
