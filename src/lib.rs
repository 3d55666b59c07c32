//! Request-time guard-and-bridge pipeline.
//!
//! This crate sits in front of business handlers and, on every request:
//! - **Routes** the path to a modern handler or a legacy one
//! - **Guards** the session: a session missing required keys is discarded
//!   through a redirect to logout, with a one-shot notice for the login page
//! - **Refreshes** an externally issued credential held in the session,
//!   at most once concurrently per principal and tenant across every process
//! - **Isolates** legacy handlers that depend on ambient state, restoring the
//!   worker's state however the handler exits
//!
//! It is framework-agnostic: an integration converts its native request into
//! an [`InboundRequest`] and the returned [`Response`] back.
//!
//! # Core Types
//!
//! - [`Pipeline`]: the assembled chain, built once with [`PipelineBuilder`]
//!   or from a [`PipelineConfig`]
//! - [`router::RouteTable`]: compiled, read-only routes
//! - [`guard::SessionValidityGuard`]: session invariant enforcement
//! - [`credential::CredentialRefreshCoordinator`]: single-flight refresh over a
//!   [`lock::DistributedRefreshLock`]
//! - [`legacy::ContextIsolationExecutor`]: scoped ambient state for legacy code
//!
//! # Examples
//!
//! ```
//! use std::sync::Arc;
//! use guard_bridge::session::MemorySessionStore;
//! use guard_bridge::{HttpMethod, InboundRequest, PipelineConfig, Principal, Response, Worker};
//! use guard_bridge::pipeline::HandlerContext;
//!
//! let config = PipelineConfig::from_json(r#"{
//!     "routes": [
//!         {"pattern": "/logout", "handler": "logout", "priority": 10},
//!         {"pattern": "/dashboard", "handler": "dashboard", "priority": 10}
//!     ]
//! }"#).unwrap();
//!
//! let sessions = Arc::new(MemorySessionStore::new());
//! let pipeline = config
//!     .pipeline_builder(sessions.clone())
//!     .unwrap()
//!     .modern("dashboard", |_: &HandlerContext<'_>| Response::ok("welcome"))
//!     .build()
//!     .unwrap();
//!
//! // An authenticated request whose session has no credential is sent to logout.
//! let mut request = InboundRequest::new("req-1", HttpMethod::Get, "/dashboard");
//! request.set_principal(Some(Principal::new("user-1", "Ada")));
//! request.set_session_token(Some("tok".to_string()));
//!
//! let mut worker = Worker::default();
//! let response = pipeline.handle(&mut worker, &request);
//! assert_eq!(response.status(), 302);
//! assert!(response.location().unwrap().starts_with("/logout?notice="));
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod clock;
pub mod config;
pub mod credential;
mod error;
pub mod guard;
pub mod legacy;
pub mod lock;
mod logging;
pub mod notice;
pub mod pipeline;
mod request;
mod response;
pub mod router;
pub mod session;

pub use config::PipelineConfig;
pub use error::{ConfigError, LegacyExecutionFault, LockError, RefreshError, StoreError};
pub use legacy::Worker;
pub use logging::RequestLog;
pub use pipeline::{Pipeline, PipelineBuilder};
pub use request::{HttpMethod, InboundRequest, Principal, UploadedFile};
pub use response::Response;
