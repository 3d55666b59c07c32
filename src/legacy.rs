//! Isolated execution of handlers that depend on ambient global state.
//!
//! Legacy handlers expect process-wide settings (diagnostic verbosity, a
//! working directory) and request data in global-style tables. Here that
//! state is an [`AmbientState`] owned by each [`Worker`]; the
//! [`ContextIsolationExecutor`] installs the legacy view for the duration of
//! one handler and puts the worker's own state back afterwards, however the
//! handler exits.

mod context;
mod executor;

pub use context::{AmbientState, ExecutionContext, LegacyEnv, Verbosity, Worker};
pub use executor::{ContextIsolationExecutor, LegacyFault, LegacyHandler, PartialOutputPolicy};
