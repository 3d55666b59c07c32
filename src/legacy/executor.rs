use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;

use serde::Deserialize;

use super::context::{AmbientState, ExecutionContext, LegacyEnv, Verbosity};
use crate::error::LegacyExecutionFault;
use crate::request::InboundRequest;

/// A fault raised by a legacy handler.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct LegacyFault {
    reason: String,
}

impl LegacyFault {
    /// Creates a fault with a reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }

    /// Returns the reason.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// A handler written against ambient state and global-style request tables.
pub trait LegacyHandler: Send + Sync {
    /// Runs the handler, writing its response body to `env`.
    fn run(&self, env: &mut LegacyEnv<'_>) -> Result<(), LegacyFault>;
}

impl<F> LegacyHandler for F
where
    F: Fn(&mut LegacyEnv<'_>) -> Result<(), LegacyFault> + Send + Sync,
{
    fn run(&self, env: &mut LegacyEnv<'_>) -> Result<(), LegacyFault> {
        self(env)
    }
}

/// What happens to output written before a legacy handler faulted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartialOutputPolicy {
    /// Drop it
    #[default]
    Discard,
    /// Attach it to the [`LegacyExecutionFault`]
    Keep,
}

/// Restores a worker's ambient state when dropped.
struct AmbientScope<'a> {
    ambient: &'a mut AmbientState,
    saved: Option<AmbientState>,
}

impl<'a> AmbientScope<'a> {
    fn install(ambient: &'a mut AmbientState, installed: AmbientState) -> Self {
        let saved = std::mem::replace(ambient, installed);
        Self {
            ambient,
            saved: Some(saved),
        }
    }
}

impl Drop for AmbientScope<'_> {
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            *self.ambient = saved;
        }
    }
}

/// Runs legacy handlers inside an isolated ambient context.
///
/// Every run installs the legacy verbosity and working directory, captures
/// output into a buffer and restores the worker's prior ambient state on
/// every exit path: normal return, returned fault, or panic.
///
/// # Example
///
/// ```
/// use std::collections::HashMap;
/// use std::io::Write;
/// use guard_bridge::legacy::{AmbientState, ContextIsolationExecutor, LegacyEnv, LegacyFault, Verbosity};
/// use guard_bridge::{HttpMethod, InboundRequest};
///
/// let executor = ContextIsolationExecutor::new().with_verbosity(Verbosity::Warning);
/// let mut ambient = AmbientState::default();
/// let before = ambient.clone();
///
/// let handler = |env: &mut LegacyEnv<'_>| -> Result<(), LegacyFault> {
///     env.chdir("/tmp");
///     let name = env.query("name").unwrap_or("world").to_string();
///     write!(env, "hello {}", name).map_err(|e| LegacyFault::new(e.to_string()))
/// };
/// let request = InboundRequest::new("req-1", HttpMethod::Get, "/hello.php?name=ada");
///
/// let body = executor.run(&mut ambient, "hello", &handler, &request, &HashMap::new()).unwrap();
/// assert_eq!(body, b"hello ada");
/// assert_eq!(ambient, before);
/// ```
#[derive(Debug, Clone)]
pub struct ContextIsolationExecutor {
    verbosity: Verbosity,
    root: PathBuf,
    partial_output: PartialOutputPolicy,
}

impl Default for ContextIsolationExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextIsolationExecutor {
    /// Creates an executor that installs `Warning` verbosity and `/` as the
    /// working directory, discarding partial output on faults.
    pub fn new() -> Self {
        Self {
            verbosity: Verbosity::Warning,
            root: PathBuf::from("/"),
            partial_output: PartialOutputPolicy::Discard,
        }
    }

    /// Sets the verbosity installed for legacy handlers.
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Sets the working directory installed for legacy handlers.
    pub fn with_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.root = root.into();
        self
    }

    /// Sets the partial output policy.
    pub fn with_partial_output(mut self, policy: PartialOutputPolicy) -> Self {
        self.partial_output = policy;
        self
    }

    /// Runs `handler` against `request` and returns its captured output.
    ///
    /// `ambient` is the calling worker's state; it holds exactly its prior
    /// value when this returns, whatever the handler did.
    ///
    /// # Errors
    ///
    /// Returns `LegacyExecutionFault` if the handler returned a fault or
    /// panicked.
    pub fn run(
        &self,
        ambient: &mut AmbientState,
        handler_id: &str,
        handler: &dyn LegacyHandler,
        request: &InboundRequest,
        params: &HashMap<String, String>,
    ) -> Result<Vec<u8>, LegacyExecutionFault> {
        let mut scope = AmbientScope::install(
            ambient,
            AmbientState {
                verbosity: self.verbosity,
                working_dir: self.root.clone(),
            },
        );
        let mut env = LegacyEnv::new(
            ExecutionContext::from_request(request, params),
            &mut *scope.ambient,
            handler_id,
        );

        let result = panic::catch_unwind(AssertUnwindSafe(|| handler.run(&mut env)));
        let (output, suppressed) = env.into_output();
        drop(scope);

        if suppressed > 0 {
            tracing::debug!(
                request_id = %request.request_id(),
                handler = handler_id,
                suppressed,
                "legacy diagnostics suppressed"
            );
        }

        let reason = match result {
            Ok(Ok(())) => return Ok(output),
            Ok(Err(fault)) => fault.reason().to_string(),
            Err(payload) => panic_message(payload.as_ref()),
        };

        tracing::error!(
            request_id = %request.request_id(),
            handler = handler_id,
            reason = %reason,
            partial_bytes = output.len(),
            "legacy handler faulted"
        );
        Err(LegacyExecutionFault {
            handler: handler_id.to_string(),
            reason,
            partial_output: match self.partial_output {
                PartialOutputPolicy::Discard => None,
                PartialOutputPolicy::Keep => Some(output),
            },
        })
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {}", s)
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {}", s)
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::HttpMethod;
    use proptest::prelude::*;
    use std::io::Write;

    fn request() -> InboundRequest {
        InboundRequest::new("req-1", HttpMethod::Get, "/legacy/page.php?x=1")
    }

    fn baseline() -> AmbientState {
        AmbientState {
            verbosity: Verbosity::Debug,
            working_dir: PathBuf::from("/srv/app"),
        }
    }

    #[test]
    fn installs_legacy_state_and_restores_after() {
        let executor = ContextIsolationExecutor::new().with_root("/srv/legacy");
        let mut ambient = baseline();

        let handler = |env: &mut LegacyEnv<'_>| -> Result<(), LegacyFault> {
            assert_eq!(env.verbosity(), Verbosity::Warning);
            assert_eq!(env.cwd(), std::path::Path::new("/srv/legacy"));
            assert_eq!(env.query("x"), Some("1"));
            env.set_verbosity(Verbosity::Debug);
            env.chdir("includes");
            env.write_all(b"ok").map_err(|e| LegacyFault::new(e.to_string()))
        };

        let out = executor
            .run(&mut ambient, "page", &handler, &request(), &HashMap::new())
            .unwrap();
        assert_eq!(out, b"ok");
        assert_eq!(ambient, baseline());
    }

    #[test]
    fn returned_fault_is_contained_and_restores() {
        let executor = ContextIsolationExecutor::new();
        let mut ambient = baseline();

        let handler = |env: &mut LegacyEnv<'_>| -> Result<(), LegacyFault> {
            env.chdir("/elsewhere");
            env.write_all(b"partial").map_err(|e| LegacyFault::new(e.to_string()))?;
            Err(LegacyFault::new("database unreachable"))
        };

        let fault = executor
            .run(&mut ambient, "page", &handler, &request(), &HashMap::new())
            .unwrap_err();
        assert_eq!(fault.handler, "page");
        assert_eq!(fault.reason, "database unreachable");
        assert_eq!(fault.partial_output, None);
        assert_eq!(ambient, baseline());
    }

    #[test]
    fn panic_is_contained_and_partial_output_kept_when_configured() {
        let executor = ContextIsolationExecutor::new().with_partial_output(PartialOutputPolicy::Keep);
        let mut ambient = baseline();

        let handler = |env: &mut LegacyEnv<'_>| -> Result<(), LegacyFault> {
            env.set_verbosity(Verbosity::Fatal);
            let _ = env.write_all(b"<html>");
            panic!("undefined function");
        };

        let fault = executor
            .run(&mut ambient, "page", &handler, &request(), &HashMap::new())
            .unwrap_err();
        assert!(fault.reason.contains("undefined function"));
        assert_eq!(fault.partial_output.as_deref(), Some(&b"<html>"[..]));
        assert_eq!(ambient, baseline());
    }

    #[test]
    fn fault_displays_reason() {
        let fault = LegacyFault::new("x");
        assert_eq!(fault.to_string(), "x");
    }

    #[derive(Debug, Clone)]
    enum Step {
        Verbosity(Verbosity),
        Chdir(String),
        Write(Vec<u8>),
    }

    fn verbosity() -> impl Strategy<Value = Verbosity> {
        prop_oneof![
            Just(Verbosity::Fatal),
            Just(Verbosity::Error),
            Just(Verbosity::Warning),
            Just(Verbosity::Notice),
            Just(Verbosity::Info),
            Just(Verbosity::Debug),
        ]
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            verbosity().prop_map(Step::Verbosity),
            "(\\.\\.|[a-z]{1,6})(/[a-z]{1,6}){0,3}".prop_map(Step::Chdir),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Step::Write),
        ]
    }

    proptest! {
        #[test]
        fn proptest_ambient_state_always_restored(
            steps in proptest::collection::vec(step(), 0..12),
            ending in 0u8..3,
            start in verbosity(),
        ) {
            let executor = ContextIsolationExecutor::new();
            let original = AmbientState { verbosity: start, working_dir: PathBuf::from("/home/app") };
            let mut ambient = original.clone();

            let handler = move |env: &mut LegacyEnv<'_>| -> Result<(), LegacyFault> {
                for step in &steps {
                    match step {
                        Step::Verbosity(v) => env.set_verbosity(*v),
                        Step::Chdir(p) => env.chdir(p),
                        Step::Write(bytes) => { let _ = env.write_all(bytes); }
                    }
                }
                match ending {
                    0 => Ok(()),
                    1 => Err(LegacyFault::new("fault")),
                    _ => panic!("boom"),
                }
            };

            let _ = executor.run(&mut ambient, "prop", &handler, &request(), &HashMap::new());
            prop_assert_eq!(ambient, original);
        }
    }
}
