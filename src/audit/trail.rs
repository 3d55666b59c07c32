//! In-memory audit trail recorder.

use parking_lot::Mutex;

use super::sink::emit_to_tracing;
use super::{AuditEvent, AuditEventKind, AuditSink};

/// In-memory recorder for audit events.
///
/// Records every event it receives (and forwards it to tracing). Safe to share
/// across request threads.
///
/// # Example
///
/// ```
/// use guard_bridge::audit::{AuditEvent, AuditEventKind, AuditOutcome, AuditSink, AuditTrail};
///
/// let trail = AuditTrail::new();
///
/// trail.emit(&AuditEvent::new(
///     "req-123",
///     Some("user-1"),
///     AuditEventKind::RefreshAttempt,
///     AuditOutcome::Attempted,
/// ));
///
/// assert_eq!(trail.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct AuditTrail {
    events: Mutex<Vec<AuditEvent>>,
}

impl AuditTrail {
    /// Creates a new empty audit trail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a snapshot of all recorded events.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().clone()
    }

    /// Returns the recorded events of one kind.
    pub fn events_of(&self, kind: AuditEventKind) -> Vec<AuditEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    /// Returns the number of recorded events.
    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    /// Returns true if no events have been recorded.
    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Clears all recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl AuditSink for AuditTrail {
    fn emit(&self, event: &AuditEvent) {
        emit_to_tracing(event);
        self.events.lock().push(event.clone());
    }
}
