//! Structured pipeline events.
//!
//! This module provides:
//! - `AuditEvent`: structured event schema for guard and refresh decisions
//! - `AuditSink`: destination for events
//! - `TracingAuditSink`: emits events as `tracing` records
//! - `AuditTrail`: in-memory recorder that also emits through tracing
//!
//! Events carry identifiers and outcomes only. Credentials never appear in
//! an event.

mod event;
mod sink;
mod trail;

pub use event::{AuditEvent, AuditEventKind, AuditOutcome};
pub use sink::{AuditSink, TracingAuditSink};
pub use trail::AuditTrail;
