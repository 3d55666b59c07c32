//! The ambient state a legacy handler sees, and the view of the request it
//! expects.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;

use crate::request::{InboundRequest, UploadedFile};

/// Diagnostic verbosity, most severe first.
///
/// A threshold admits every level at or above its own severity: `Warning`
/// admits `Fatal`, `Error` and `Warning`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    /// Unrecoverable conditions; never suppressed
    Fatal,
    /// Errors
    Error,
    /// Warnings
    Warning,
    /// Notices about questionable but valid code paths
    Notice,
    /// Informational messages
    Info,
    /// Debug chatter
    Debug,
}

impl Verbosity {
    /// Returns true if a diagnostic at `level` passes this threshold.
    pub fn admits(self, level: Verbosity) -> bool {
        level == Verbosity::Fatal || level <= self
    }
}

impl fmt::Display for Verbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Verbosity::Fatal => "fatal",
            Verbosity::Error => "error",
            Verbosity::Warning => "warning",
            Verbosity::Notice => "notice",
            Verbosity::Info => "info",
            Verbosity::Debug => "debug",
        };
        f.write_str(s)
    }
}

/// Per-worker ambient state that legacy code mutates freely.
///
/// Each worker owns one; it is never shared between threads, so a legacy
/// handler running on one worker cannot observe another's changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmbientState {
    /// Current diagnostic threshold
    pub verbosity: Verbosity,
    /// Current working directory (virtual; the process cwd is never changed)
    pub working_dir: PathBuf,
}

impl Default for AmbientState {
    fn default() -> Self {
        Self {
            verbosity: Verbosity::Debug,
            working_dir: PathBuf::from("/"),
        }
    }
}

/// A request-serving worker and the ambient state it owns.
#[derive(Debug, Default)]
pub struct Worker {
    ambient: AmbientState,
}

impl Worker {
    /// Creates a worker with the given baseline ambient state.
    pub fn new(ambient: AmbientState) -> Self {
        Self { ambient }
    }

    /// Returns the worker's current ambient state.
    pub fn ambient(&self) -> &AmbientState {
        &self.ambient
    }

    pub(crate) fn ambient_mut(&mut self) -> &mut AmbientState {
        &mut self.ambient
    }
}

/// The request, re-exposed as the global-style tables legacy code reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Query string parameters
    pub query: HashMap<String, String>,
    /// Form body fields
    pub form: HashMap<String, String>,
    /// Uploaded files
    pub files: Vec<UploadedFile>,
    /// Cookies
    pub cookies: HashMap<String, String>,
    /// Server variables: `REQUEST_METHOD`, `REQUEST_URI`, `REQUEST_ID`,
    /// one `HTTP_*` entry per header, and one `ROUTE_*` entry per matched
    /// route parameter
    pub server: HashMap<String, String>,
}

impl ExecutionContext {
    /// Builds the legacy view of a request.
    pub fn from_request(request: &InboundRequest, params: &HashMap<String, String>) -> Self {
        let mut server = HashMap::new();
        server.insert("REQUEST_METHOD".to_string(), request.method().to_string());
        server.insert("REQUEST_URI".to_string(), request.path().to_string());
        server.insert("REQUEST_ID".to_string(), request.request_id().to_string());
        for (name, value) in request.headers() {
            server.insert(format!("HTTP_{}", server_key(name)), value.clone());
        }
        for (name, value) in params {
            server.insert(format!("ROUTE_{}", server_key(name)), value.clone());
        }

        Self {
            query: request.query_params().clone(),
            form: request.form_fields().clone(),
            files: request.files().to_vec(),
            cookies: request.cookies().clone(),
            server,
        }
    }
}

fn server_key(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

/// What a legacy handler runs against: the request view, a captured output
/// buffer, and the installed ambient state.
///
/// Output written through [`io::Write`] goes to the buffer, never to the
/// process's stdout.
pub struct LegacyEnv<'a> {
    context: ExecutionContext,
    ambient: &'a mut AmbientState,
    output: Vec<u8>,
    handler: &'a str,
    suppressed: usize,
}

impl fmt::Debug for LegacyEnv<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LegacyEnv")
            .field("handler", &self.handler)
            .field("ambient", &self.ambient)
            .field("output_len", &self.output.len())
            .finish_non_exhaustive()
    }
}

impl<'a> LegacyEnv<'a> {
    pub(crate) fn new(context: ExecutionContext, ambient: &'a mut AmbientState, handler: &'a str) -> Self {
        Self {
            context,
            ambient,
            output: Vec::new(),
            handler,
            suppressed: 0,
        }
    }

    /// Returns the request view.
    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Returns a query parameter.
    pub fn query(&self, key: &str) -> Option<&str> {
        self.context.query.get(key).map(String::as_str)
    }

    /// Returns a form field.
    pub fn form(&self, key: &str) -> Option<&str> {
        self.context.form.get(key).map(String::as_str)
    }

    /// Returns a server variable.
    pub fn server(&self, key: &str) -> Option<&str> {
        self.context.server.get(key).map(String::as_str)
    }

    /// Returns the current diagnostic threshold.
    pub fn verbosity(&self) -> Verbosity {
        self.ambient.verbosity
    }

    /// Changes the diagnostic threshold for the rest of this execution.
    pub fn set_verbosity(&mut self, verbosity: Verbosity) {
        self.ambient.verbosity = verbosity;
    }

    /// Returns the current working directory.
    pub fn cwd(&self) -> &Path {
        &self.ambient.working_dir
    }

    /// Changes the working directory. Relative paths resolve against the
    /// current one; `..` never climbs above `/`.
    pub fn chdir(&mut self, path: impl AsRef<Path>) {
        self.ambient.working_dir = self.resolve(path);
    }

    /// Resolves a path against the current working directory.
    pub fn resolve(&self, path: impl AsRef<Path>) -> PathBuf {
        normalize(&self.ambient.working_dir.join(path))
    }

    /// Raises a diagnostic. It is logged under the `legacy` target only if
    /// the current threshold admits it.
    pub fn diagnostic(&mut self, level: Verbosity, message: &str) {
        if !self.ambient.verbosity.admits(level) {
            self.suppressed += 1;
            return;
        }
        let handler = self.handler;
        match level {
            Verbosity::Fatal | Verbosity::Error => {
                tracing::error!(target: "legacy", handler, level = %level, "{}", message)
            }
            Verbosity::Warning => tracing::warn!(target: "legacy", handler, level = %level, "{}", message),
            Verbosity::Notice | Verbosity::Info => {
                tracing::info!(target: "legacy", handler, level = %level, "{}", message)
            }
            Verbosity::Debug => tracing::debug!(target: "legacy", handler, level = %level, "{}", message),
        }
    }

    /// Returns how many diagnostics the threshold has suppressed so far.
    pub fn suppressed(&self) -> usize {
        self.suppressed
    }

    /// Returns the output captured so far.
    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub(crate) fn into_output(self) -> (Vec<u8>, usize) {
        (self.output, self.suppressed)
    }
}

impl io::Write for LegacyEnv<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.output.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Lexically normalizes an absolute path.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::from("/");
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => {
                out.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    out
}
