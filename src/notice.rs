//! Single-use notices carried across a session-invalidating redirect.
//!
//! When the session guard rejects a request it cannot leave its message in
//! the session: the logout that follows destroys the session. Instead the
//! guard issues a notice into a [`NoticeChannel`] (a store outside the
//! session) and puts the notice's unguessable token in the redirect URL. The
//! [`LogoutHandler`] forwards the token to the login page, and the login
//! handler calls [`take_login_notice`], which removes the notice as it reads
//! it. A second read of the same token finds nothing.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

use crate::clock::{Clock, SystemClock};
use crate::error::StoreError;
use crate::pipeline::{Handler, HandlerContext};
use crate::request::InboundRequest;
use crate::response::Response;

/// Why a notice was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonCode {
    /// The session was missing required keys
    SessionIncomplete,
    /// The session could not be read
    SessionUnreadable,
}

impl ReasonCode {
    /// Stable code for logs and templates.
    pub fn as_str(self) -> &'static str {
        match self {
            ReasonCode::SessionIncomplete => "session_incomplete",
            ReasonCode::SessionUnreadable => "session_unreadable",
        }
    }

    /// User-facing message for the login page.
    pub fn message(self) -> &'static str {
        match self {
            ReasonCode::SessionIncomplete => {
                "Your session was incomplete and you have been signed out. Please sign in again."
            }
            ReasonCode::SessionUnreadable => {
                "We could not verify your session. Please sign in again."
            }
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A one-shot notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    reason: ReasonCode,
    issued_at: DateTime<Utc>,
}

impl Notice {
    /// Returns the reason code.
    pub fn reason(&self) -> ReasonCode {
        self.reason
    }

    /// Returns the user-facing message.
    pub fn message(&self) -> &'static str {
        self.reason.message()
    }

    /// Returns when the notice was issued.
    pub fn issued_at(&self) -> DateTime<Utc> {
        self.issued_at
    }
}

/// Store of single-use notices, shared by every process serving a client.
pub trait NoticeChannel: Send + Sync {
    /// Stores a notice and returns its token.
    fn issue(&self, reason: ReasonCode) -> Result<String, StoreError>;

    /// Removes and returns the notice for `token`. `Ok(None)` if it was never
    /// issued, already taken, or expired.
    fn take(&self, token: &str) -> Result<Option<Notice>, StoreError>;
}

/// Process-local notice channel with a time-to-live.
pub struct MemoryNoticeChannel {
    notices: Mutex<HashMap<String, Notice>>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for MemoryNoticeChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryNoticeChannel")
            .field("pending", &self.notices.lock().len())
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl MemoryNoticeChannel {
    /// Creates a channel whose notices expire after `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self::with_clock(ttl, Arc::new(SystemClock))
    }

    /// Creates a channel with an explicit clock.
    pub fn with_clock(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            notices: Mutex::new(HashMap::new()),
            ttl,
            clock,
        }
    }

    /// Returns the number of notices not yet taken (expired ones included
    /// until the next issue prunes them).
    pub fn pending(&self) -> usize {
        self.notices.lock().len()
    }
}

impl NoticeChannel for MemoryNoticeChannel {
    fn issue(&self, reason: ReasonCode) -> Result<String, StoreError> {
        let now = self.clock.now();
        let token = uuid::Uuid::new_v4().simple().to_string();

        let mut notices = self.notices.lock();
        notices.retain(|_, n| now - n.issued_at < self.ttl);
        notices.insert(
            token.clone(),
            Notice {
                reason,
                issued_at: now,
            },
        );
        Ok(token)
    }

    fn take(&self, token: &str) -> Result<Option<Notice>, StoreError> {
        let now = self.clock.now();
        let taken = self.notices.lock().remove(token);
        Ok(taken.filter(|n| now - n.issued_at < self.ttl))
    }
}

/// Reads (and consumes) the notice referenced by the request's `param`
/// query parameter. Store failures are logged and treated as "no notice".
pub fn take_login_notice(
    channel: &dyn NoticeChannel,
    request: &InboundRequest,
    param: &str,
) -> Option<Notice> {
    let token = request.query_param(param)?;
    match channel.take(token) {
        Ok(notice) => notice,
        Err(err) => {
            tracing::warn!(request_id = %request.request_id(), error = %err, "notice channel read failed");
            None
        }
    }
}

/// Destroys the caller's session and redirects to the login page, forwarding
/// any notice token it was given.
#[derive(Debug, Clone)]
pub struct LogoutHandler {
    login_path: String,
    notice_param: String,
}

impl LogoutHandler {
    /// Creates a logout handler.
    pub fn new(login_path: impl Into<String>, notice_param: impl Into<String>) -> Self {
        Self {
            login_path: login_path.into(),
            notice_param: notice_param.into(),
        }
    }
}

impl Handler for LogoutHandler {
    fn handle(&self, cx: &HandlerContext<'_>) -> Response {
        let log = cx.log();
        if let Some(session) = cx.session() {
            if let Err(err) = session.destroy() {
                log.warn(format_args!("failed to destroy session on logout: {}", err));
            }
        }

        let location = match cx.request().query_param(&self.notice_param) {
            Some(token) => format!(
                "{}?{}={}",
                self.login_path,
                self.notice_param,
                urlencoding::encode(token)
            ),
            None => self.login_path.clone(),
        };
        log.debug(format_args!("logout complete, redirecting to {}", self.login_path));
        Response::redirect(location)
    }
}
