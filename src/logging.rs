use std::fmt;

/// A request-scoped logger.
///
/// `RequestLog` is borrowed from the request it describes and stamps every
/// record with that request's id (and principal, once known), so stages never
/// have to repeat the correlation fields by hand.
#[derive(Debug, Clone, Copy)]
pub struct RequestLog<'a> {
    request_id: &'a str,
    principal_id: Option<&'a str>,
}

impl<'a> RequestLog<'a> {
    /// Creates a logger for a request.
    pub fn new(request_id: &'a str) -> Self {
        Self {
            request_id,
            principal_id: None,
        }
    }

    /// Returns a copy of this logger that also records the principal id.
    pub fn with_principal(self, principal_id: &'a str) -> Self {
        Self {
            principal_id: Some(principal_id),
            ..self
        }
    }

    /// Returns the request ID associated with this logger.
    pub fn request_id(&self) -> &str {
        self.request_id
    }

    /// Logs an info-level message.
    pub fn info(&self, args: fmt::Arguments<'_>) {
        tracing::info!(request_id = %self.request_id, principal_id = ?self.principal_id, "{}", args);
    }

    /// Logs a warning-level message.
    pub fn warn(&self, args: fmt::Arguments<'_>) {
        tracing::warn!(request_id = %self.request_id, principal_id = ?self.principal_id, "{}", args);
    }

    /// Logs an error-level message.
    pub fn error(&self, args: fmt::Arguments<'_>) {
        tracing::error!(request_id = %self.request_id, principal_id = ?self.principal_id, "{}", args);
    }

    /// Logs a debug-level message.
    pub fn debug(&self, args: fmt::Arguments<'_>) {
        tracing::debug!(request_id = %self.request_id, principal_id = ?self.principal_id, "{}", args);
    }
}
