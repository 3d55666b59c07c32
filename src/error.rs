//! Error taxonomy for the guard-and-bridge pipeline.
//!
//! Every failure is an explicit value. Callers branch on the variant rather
//! than on where an error was raised:
//!
//! - [`ConfigError`]: fatal at startup, never produced at request time
//! - [`StoreError`]: the session store could not be read or written
//! - [`LockError`]: the lock backend failed (treated as a deferral by callers)
//! - [`RefreshError`]: the external refresh call failed
//! - [`LegacyExecutionFault`]: a legacy handler faulted and was contained

use std::io;

/// A configuration problem detected while building the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A route pattern could not be parsed.
    #[error("malformed route pattern '{pattern}': {reason}")]
    MalformedPattern {
        /// The offending pattern
        pattern: String,
        /// Why it was rejected
        reason: &'static str,
    },
    /// A catch-all route is not ranked strictly below a specific route.
    #[error(
        "catch-all route '{catch_all}' (priority {catch_all_priority}) must rank below \
         specific route '{specific}' (priority {specific_priority})"
    )]
    CatchAllPriority {
        /// The catch-all pattern
        catch_all: String,
        /// Its priority
        catch_all_priority: i32,
        /// The specific pattern it collides with
        specific: String,
        /// That route's priority
        specific_priority: i32,
    },
    /// Two routes have the same shape and the same priority.
    #[error("routes '{first}' and '{second}' are ambiguous at priority {priority}")]
    AmbiguousRoutes {
        /// The route declared first
        first: String,
        /// The route declared second
        second: String,
        /// Their shared priority
        priority: i32,
    },
    /// The configuration requires a catch-all route but none was declared.
    #[error("no catch-all route declared")]
    MissingCatchAll,
    /// A route references a handler that was never registered.
    #[error("route '{pattern}' references unregistered handler '{handler}'")]
    UnknownHandler {
        /// The route pattern
        pattern: String,
        /// The handler id it names
        handler: String,
    },
    /// A handler is registered with a different kind than the route declares.
    #[error("handler '{handler}' is registered as {registered} but routed as {routed}")]
    HandlerKindMismatch {
        /// The handler id
        handler: String,
        /// Kind it was registered with
        registered: &'static str,
        /// Kind the route table declares
        routed: &'static str,
    },
    /// A configuration value is out of range or unparseable.
    #[error("invalid configuration value for '{key}': {reason}")]
    InvalidValue {
        /// The configuration key
        key: &'static str,
        /// Why it was rejected
        reason: String,
    },
    /// The configuration document could not be parsed.
    #[error("could not parse configuration: {0}")]
    Parse(String),
}

impl From<serde_json::Error> for ConfigError {
    fn from(err: serde_json::Error) -> Self {
        ConfigError::Parse(err.to_string())
    }
}

/// A session store failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing store is unreachable or refused the operation.
    #[error("session store unavailable: {0}")]
    Unavailable(String),
    /// A batched read returned fewer or more values than keys requested.
    #[error("session store returned {returned} values for {requested} keys")]
    ShortRead {
        /// Number of keys asked for
        requested: usize,
        /// Number of values the store produced
        returned: usize,
    },
}

/// A lock backend failure. Not a contention signal: contention is `Ok(None)`.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// Filesystem error while manipulating a lease.
    #[error("lock backend I/O error on '{name}': {source}")]
    Io {
        /// Lock name
        name: String,
        /// Underlying error
        #[source]
        source: io::Error,
    },
    /// A lease file exists but could not be understood.
    #[error("corrupt lease for lock '{name}'")]
    CorruptLease {
        /// Lock name
        name: String,
    },
}

impl LockError {
    pub(crate) fn io(name: &str, source: io::Error) -> Self {
        LockError::Io {
            name: name.to_string(),
            source,
        }
    }
}

/// Failure of the outbound credential refresh call.
#[derive(Debug, thiserror::Error)]
pub enum RefreshError {
    /// The endpoint did not answer within the configured timeout.
    #[error("refresh endpoint timed out")]
    Timeout,
    /// Connection or protocol failure.
    #[error("refresh transport failure: {0}")]
    Transport(String),
    /// The endpoint answered with a non-success status.
    #[error("refresh endpoint returned status {0}")]
    Status(u16),
    /// The endpoint answered with an unexpected body.
    #[error("refresh endpoint returned a malformed response: {0}")]
    MalformedResponse(String),
}

/// A fault raised inside a legacy handler, contained by the executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("legacy handler '{handler}' faulted: {reason}")]
pub struct LegacyExecutionFault {
    /// Handler id that faulted
    pub handler: String,
    /// Human-readable fault description
    pub reason: String,
    /// Output buffered before the fault, when the policy keeps it
    pub partial_output: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_error_messages_name_the_routes() {
        let err = ConfigError::CatchAllPriority {
            catch_all: "/{rest*}".to_string(),
            catch_all_priority: 0,
            specific: "/users/{id}".to_string(),
            specific_priority: 0,
        };
        let msg = err.to_string();
        assert!(msg.contains("/{rest*}"));
        assert!(msg.contains("/users/{id}"));
    }

    #[test]
    fn serde_errors_become_parse_errors() {
        let err: ConfigError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
