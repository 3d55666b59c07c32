//! Session invariant enforcement.
//!
//! Each request moves through `Unchecked -> {Excluded, Valid, Invalid}`:
//!
//! - `Excluded`: the handler is on the exclusion list (the pages a user with
//!   a broken session must still reach) or nobody is authenticated
//! - `Valid`: every required session key is present
//! - `Invalid`: at least one is missing, or the session could not be read
//!
//! An invalid session is never repaired in place. The guard issues a
//! single-use [`Notice`](crate::notice::Notice), records an audit event and
//! redirects to the logout path with the notice token in the query string,
//! so the message survives the logout that destroys the session.

use std::collections::HashSet;
use std::sync::Arc;

use crate::audit::{AuditEvent, AuditEventKind, AuditOutcome, AuditSink, TracingAuditSink};
use crate::logging::RequestLog;
use crate::notice::{NoticeChannel, ReasonCode};
use crate::pipeline::{Flow, HandlerContext, Stage};
use crate::request::Principal;
use crate::response::Response;
use crate::session::{Session, SessionKeys};

/// Handler ids excluded from the guard unless configured otherwise.
pub const DEFAULT_EXCLUDED_HANDLERS: [&str; 3] = ["logout", "login", "tenant_picker"];

/// Outcome of evaluating one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardDecision {
    /// The guard does not apply to this request
    Excluded,
    /// All required keys are present
    Valid,
    /// The session must be discarded
    Invalid {
        /// Required keys that were absent (all of them if unreadable)
        missing: Vec<String>,
        /// Why the session was rejected
        reason: ReasonCode,
    },
}

/// Redirects requests whose session lacks any required key.
pub struct SessionValidityGuard {
    required_keys: Vec<String>,
    excluded: HashSet<String>,
    logout_path: String,
    notice_param: String,
    notices: Arc<dyn NoticeChannel>,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for SessionValidityGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionValidityGuard")
            .field("required_keys", &self.required_keys)
            .field("excluded", &self.excluded)
            .field("logout_path", &self.logout_path)
            .finish_non_exhaustive()
    }
}

impl SessionValidityGuard {
    /// Creates a guard requiring the default credential keys, excluding the
    /// default handlers and redirecting to `/logout`.
    pub fn new(notices: Arc<dyn NoticeChannel>) -> Self {
        let keys = SessionKeys::default();
        Self {
            required_keys: vec![keys.credential, keys.refresh_at],
            excluded: DEFAULT_EXCLUDED_HANDLERS.iter().map(|s| s.to_string()).collect(),
            logout_path: "/logout".to_string(),
            notice_param: "notice".to_string(),
            notices,
            audit: Arc::new(TracingAuditSink),
        }
    }

    /// Sets the required session keys.
    pub fn with_required_keys<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_keys = keys.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the excluded handler ids.
    pub fn with_excluded_handlers<I, S>(mut self, handlers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.excluded = handlers.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the logout path redirected to.
    pub fn with_logout_path(mut self, path: impl Into<String>) -> Self {
        self.logout_path = path.into();
        self
    }

    /// Sets the query parameter carrying the notice token.
    pub fn with_notice_param(mut self, param: impl Into<String>) -> Self {
        self.notice_param = param.into();
        self
    }

    /// Replaces the audit sink.
    pub fn with_audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Returns the required session keys.
    pub fn required_keys(&self) -> &[String] {
        &self.required_keys
    }

    /// Returns true if `handler_id` bypasses the guard.
    pub fn is_excluded(&self, handler_id: &str) -> bool {
        self.excluded.contains(handler_id)
    }

    /// Returns the notice channel invalid sessions are reported through.
    pub fn notices(&self) -> &Arc<dyn NoticeChannel> {
        &self.notices
    }

    /// Classifies a request without side effects.
    ///
    /// A missing session (no token) or a store failure makes an
    /// authenticated request invalid.
    pub fn evaluate(
        &self,
        handler_id: &str,
        principal: Option<&Principal>,
        session: Option<&Session<'_>>,
        log: RequestLog<'_>,
    ) -> GuardDecision {
        if self.is_excluded(handler_id) || principal.is_none() {
            return GuardDecision::Excluded;
        }

        let Some(session) = session else {
            return GuardDecision::Invalid {
                missing: self.required_keys.clone(),
                reason: ReasonCode::SessionIncomplete,
            };
        };

        let keys: Vec<&str> = self.required_keys.iter().map(String::as_str).collect();
        match session.get_many(&keys) {
            Ok(values) => {
                let missing = missing_keys(&self.required_keys, &values);
                if missing.is_empty() {
                    GuardDecision::Valid
                } else {
                    GuardDecision::Invalid {
                        missing,
                        reason: ReasonCode::SessionIncomplete,
                    }
                }
            }
            Err(err) => {
                log.error(format_args!("session store read failed, treating session as invalid: {}", err));
                GuardDecision::Invalid {
                    missing: self.required_keys.clone(),
                    reason: ReasonCode::SessionUnreadable,
                }
            }
        }
    }

    /// Evaluates a request and, if its session is invalid, returns the
    /// redirect that replaces the handler's response.
    pub fn check(
        &self,
        handler_id: &str,
        principal: Option<&Principal>,
        session: Option<&Session<'_>>,
        log: RequestLog<'_>,
    ) -> Option<Response> {
        match self.evaluate(handler_id, principal, session, log) {
            GuardDecision::Excluded | GuardDecision::Valid => None,
            GuardDecision::Invalid { missing, reason } => Some(self.reject(principal, &missing, reason, log)),
        }
    }

    fn reject(&self, principal: Option<&Principal>, missing: &[String], reason: ReasonCode, log: RequestLog<'_>) -> Response {
        let mut event = AuditEvent::new(
            log.request_id(),
            principal.map(|p| p.id.as_str()),
            AuditEventKind::SessionInvalid,
            AuditOutcome::Redirected,
        )
        .with_missing_keys(missing.to_vec())
        .with_detail(reason.as_str());
        if let Some(tenant) = principal.and_then(|p| p.tenant_id.as_deref()) {
            event = event.with_tenant(tenant);
        }
        self.audit.emit(&event);

        match self.notices.issue(reason) {
            Ok(token) => Response::redirect(format!(
                "{}?{}={}",
                self.logout_path,
                self.notice_param,
                urlencoding::encode(&token)
            )),
            Err(err) => {
                log.error(format_args!("could not issue session notice: {}", err));
                Response::redirect(self.logout_path.clone())
            }
        }
    }
}

impl Stage for SessionValidityGuard {
    fn name(&self) -> &'static str {
        "session_validity_guard"
    }

    fn run(&self, cx: &HandlerContext<'_>) -> Flow {
        let session = cx.session();
        match self.check(cx.handler_id(), cx.principal(), session.as_ref(), cx.log()) {
            Some(redirect) => Flow::Respond(redirect),
            None => Flow::Continue,
        }
    }
}

/// Returns the required keys whose values are absent.
pub(crate) fn missing_keys(required: &[String], values: &[Option<String>]) -> Vec<String> {
    required
        .iter()
        .zip(values)
        .filter(|(_, value)| value.is_none())
        .map(|(key, _)| key.clone())
        .collect()
}
