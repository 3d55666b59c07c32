//! The request pipeline: route, guard, refresh, dispatch.
//!
//! A [`Pipeline`] is assembled once at startup by [`PipelineBuilder`] and is
//! read-only afterwards; share it between request threads with `Arc`. Each
//! thread owns a [`Worker`] carrying its ambient state.
//!
//! Stages run in a fixed order that is part of the pipeline's contract:
//!
//! 1. [`SessionValidityGuard`](crate::guard::SessionValidityGuard): may
//!    answer with a redirect
//! 2. credential refresh (when a coordinator is configured): never answers
//!
//! Then the matched handler runs: modern handlers directly, legacy handlers
//! through the [`ContextIsolationExecutor`].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::audit::{AuditEvent, AuditEventKind, AuditOutcome, AuditSink, TracingAuditSink};
use crate::credential::CredentialRefreshCoordinator;
use crate::error::{ConfigError, LegacyExecutionFault};
use crate::guard::SessionValidityGuard;
use crate::legacy::{ContextIsolationExecutor, LegacyHandler, Worker};
use crate::logging::RequestLog;
use crate::notice::NoticeChannel;
use crate::request::{InboundRequest, Principal};
use crate::response::Response;
use crate::router::{HandlerKind, RouteMatch, RouteTable};
use crate::session::{Session, SessionStore};

/// A handler that takes its inputs explicitly.
pub trait Handler: Send + Sync {
    /// Produces the response for a request that passed every stage.
    fn handle(&self, cx: &HandlerContext<'_>) -> Response;
}

impl<F> Handler for F
where
    F: Fn(&HandlerContext<'_>) -> Response + Send + Sync,
{
    fn handle(&self, cx: &HandlerContext<'_>) -> Response {
        self(cx)
    }
}

/// Source of the authenticated principal for a request.
pub trait PrincipalSource: Send + Sync {
    /// Returns the principal, or `None` for an unauthenticated request.
    fn principal(&self, request: &InboundRequest) -> Option<Principal>;
}

/// Uses the principal the authentication layer attached to the request.
#[derive(Debug, Default, Clone, Copy)]
pub struct AttachedPrincipal;

impl PrincipalSource for AttachedPrincipal {
    fn principal(&self, request: &InboundRequest) -> Option<Principal> {
        request.principal().cloned()
    }
}

/// Everything a stage or handler may read about the current request.
#[derive(Debug)]
pub struct HandlerContext<'a> {
    request: &'a InboundRequest,
    route: &'a RouteMatch<'a>,
    principal: Option<&'a Principal>,
    session: Option<Session<'a>>,
    log: RequestLog<'a>,
    excluded: bool,
}

impl<'a> HandlerContext<'a> {
    pub(crate) fn new(
        request: &'a InboundRequest,
        route: &'a RouteMatch<'a>,
        principal: Option<&'a Principal>,
        session: Option<Session<'a>>,
        excluded: bool,
    ) -> Self {
        let mut log = RequestLog::new(request.request_id());
        if let Some(principal) = principal {
            log = log.with_principal(&principal.id);
        }
        Self {
            request,
            route,
            principal,
            session,
            log,
            excluded,
        }
    }

    /// Returns the request.
    pub fn request(&self) -> &'a InboundRequest {
        self.request
    }

    /// Returns the id of the matched handler.
    pub fn handler_id(&self) -> &'a str {
        self.route.handler().id()
    }

    /// Returns a matched path parameter.
    pub fn param(&self, name: &str) -> Option<&str> {
        self.route.param(name)
    }

    /// Returns all matched path parameters.
    pub fn params(&self) -> &HashMap<String, String> {
        self.route.params()
    }

    /// Returns the authenticated principal, if any.
    pub fn principal(&self) -> Option<&'a Principal> {
        self.principal
    }

    /// Returns the caller's session, if the request carried a token.
    pub fn session(&self) -> Option<Session<'a>> {
        self.session
    }

    /// Returns the request-scoped logger.
    pub fn log(&self) -> RequestLog<'a> {
        self.log
    }

    /// Returns true if the handler is exempt from session enforcement (and
    /// therefore from credential refresh).
    pub fn is_excluded(&self) -> bool {
        self.excluded
    }
}

/// Result of one stage.
#[derive(Debug)]
pub enum Flow {
    /// Run the next stage
    Continue,
    /// Answer with this response; later stages and the handler do not run
    Respond(Response),
}

/// One step of the pipeline's middleware chain.
pub trait Stage: Send + Sync {
    /// Stage name for logs.
    fn name(&self) -> &'static str;

    /// Runs the stage.
    fn run(&self, cx: &HandlerContext<'_>) -> Flow;
}

impl Stage for CredentialRefreshCoordinator {
    fn name(&self) -> &'static str {
        "credential_refresh"
    }

    fn run(&self, cx: &HandlerContext<'_>) -> Flow {
        if cx.is_excluded() {
            return Flow::Continue;
        }
        if let (Some(principal), Some(session)) = (cx.principal(), cx.session()) {
            let outcome = self.maybe_refresh(principal, &session, cx.log());
            cx.log().debug(format_args!("credential refresh outcome: {:?}", outcome));
        }
        Flow::Continue
    }
}

#[derive(Clone)]
enum RegisteredHandler {
    Modern(Arc<dyn Handler>),
    Legacy(Arc<dyn LegacyHandler>),
}

impl RegisteredHandler {
    fn kind(&self) -> HandlerKind {
        match self {
            RegisteredHandler::Modern(_) => HandlerKind::Modern,
            RegisteredHandler::Legacy(_) => HandlerKind::Legacy,
        }
    }
}

/// Assembles a [`Pipeline`].
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use guard_bridge::guard::SessionValidityGuard;
/// use guard_bridge::notice::MemoryNoticeChannel;
/// use guard_bridge::pipeline::{HandlerContext, PipelineBuilder};
/// use guard_bridge::router::{HandlerDescriptor, RouteTableBuilder};
/// use guard_bridge::session::MemorySessionStore;
/// use guard_bridge::{HttpMethod, InboundRequest, Response, Worker};
///
/// let routes = RouteTableBuilder::new()
///     .route("/health", HandlerDescriptor::modern("health"), 0)
///     .build()
///     .unwrap();
/// let notices = Arc::new(MemoryNoticeChannel::new(chrono::Duration::minutes(5)));
///
/// let pipeline = PipelineBuilder::new(routes, Arc::new(MemorySessionStore::new()), SessionValidityGuard::new(notices))
///     .modern("health", |_: &HandlerContext<'_>| Response::ok("ok"))
///     .build()
///     .unwrap();
///
/// let mut worker = Worker::default();
/// let response = pipeline.handle(&mut worker, &InboundRequest::new("req-1", HttpMethod::Get, "/health"));
/// assert_eq!(response.body(), b"ok");
/// ```
pub struct PipelineBuilder {
    routes: RouteTable,
    sessions: Arc<dyn SessionStore>,
    guard: SessionValidityGuard,
    refresh: Option<CredentialRefreshCoordinator>,
    executor: ContextIsolationExecutor,
    principals: Arc<dyn PrincipalSource>,
    audit: Arc<dyn AuditSink>,
    handlers: HashMap<String, RegisteredHandler>,
}

impl PipelineBuilder {
    /// Starts a pipeline over a route table, session store and guard.
    pub fn new(routes: RouteTable, sessions: Arc<dyn SessionStore>, guard: SessionValidityGuard) -> Self {
        Self {
            routes,
            sessions,
            guard,
            refresh: None,
            executor: ContextIsolationExecutor::new(),
            principals: Arc::new(AttachedPrincipal),
            audit: Arc::new(TracingAuditSink),
            handlers: HashMap::new(),
        }
    }

    /// Registers a modern handler.
    pub fn modern(mut self, id: impl Into<String>, handler: impl Handler + 'static) -> Self {
        self.handlers
            .insert(id.into(), RegisteredHandler::Modern(Arc::new(handler)));
        self
    }

    /// Registers a legacy handler.
    pub fn legacy(mut self, id: impl Into<String>, handler: impl LegacyHandler + 'static) -> Self {
        self.handlers
            .insert(id.into(), RegisteredHandler::Legacy(Arc::new(handler)));
        self
    }

    /// Enables opportunistic credential refresh.
    pub fn refresh(mut self, coordinator: CredentialRefreshCoordinator) -> Self {
        self.refresh = Some(coordinator);
        self
    }

    /// Replaces the legacy executor.
    pub fn executor(mut self, executor: ContextIsolationExecutor) -> Self {
        self.executor = executor;
        self
    }

    /// Replaces the principal source.
    pub fn principal_source(mut self, source: Arc<dyn PrincipalSource>) -> Self {
        self.principals = source;
        self
    }

    /// Replaces the audit sink used for legacy faults.
    pub fn audit_sink(mut self, audit: Arc<dyn AuditSink>) -> Self {
        self.audit = audit;
        self
    }

    /// Returns the guard's notice channel, for wiring the login handler
    /// before the pipeline is built.
    pub fn notice_channel(&self) -> Arc<dyn NoticeChannel> {
        self.guard.notices().clone()
    }

    /// Validates handler registration against the route table.
    ///
    /// # Errors
    ///
    /// - `ConfigError::UnknownHandler` if a route names an unregistered handler
    /// - `ConfigError::HandlerKindMismatch` if a route's kind differs from
    ///   the registered handler's
    pub fn build(self) -> Result<Pipeline, ConfigError> {
        for route in self.routes.routes() {
            let descriptor = route.handler();
            let registered = self
                .handlers
                .get(descriptor.id())
                .ok_or_else(|| ConfigError::UnknownHandler {
                    pattern: route.pattern().as_str().to_string(),
                    handler: descriptor.id().to_string(),
                })?;
            if registered.kind() != descriptor.kind() {
                return Err(ConfigError::HandlerKindMismatch {
                    handler: descriptor.id().to_string(),
                    registered: registered.kind().as_str(),
                    routed: descriptor.kind().as_str(),
                });
            }
        }

        let guard = Arc::new(self.guard);
        let mut stages: Vec<Arc<dyn Stage>> = vec![guard.clone()];
        if let Some(refresh) = self.refresh {
            stages.push(Arc::new(refresh));
        }

        tracing::info!(
            routes = self.routes.routes().len(),
            handlers = self.handlers.len(),
            stages = ?stages.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "pipeline built"
        );

        Ok(Pipeline {
            routes: self.routes,
            sessions: self.sessions,
            guard,
            stages,
            executor: self.executor,
            principals: self.principals,
            audit: self.audit,
            handlers: self.handlers,
        })
    }
}

/// The assembled, read-only request pipeline.
pub struct Pipeline {
    routes: RouteTable,
    sessions: Arc<dyn SessionStore>,
    guard: Arc<SessionValidityGuard>,
    stages: Vec<Arc<dyn Stage>>,
    executor: ContextIsolationExecutor,
    principals: Arc<dyn PrincipalSource>,
    audit: Arc<dyn AuditSink>,
    handlers: HashMap<String, RegisteredHandler>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("routes", &self.routes.routes().len())
            .field("stages", &self.stages.iter().map(|s| s.name()).collect::<Vec<_>>())
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Returns the route table.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Returns the notice channel, for the login handler to read notices.
    pub fn notice_channel(&self) -> &Arc<dyn NoticeChannel> {
        self.guard.notices()
    }

    /// Returns the names of the stages in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.stages.iter().map(|s| s.name()).collect()
    }

    /// Serves one request on `worker`.
    ///
    /// Never fails: unknown paths answer 404, invalid sessions a redirect
    /// and faulting legacy handlers 500.
    pub fn handle(&self, worker: &mut Worker, request: &InboundRequest) -> Response {
        let route = match self.routes.resolve(request.path()) {
            Ok(route) => route,
            Err(not_found) => {
                RequestLog::new(request.request_id()).debug(format_args!("{}", not_found));
                return Response::not_found();
            }
        };

        let principal = self.principals.principal(request);
        let session = request
            .session_token()
            .map(|token| Session::new(self.sessions.as_ref(), token));
        let excluded = self.guard.is_excluded(route.handler().id());
        let cx = HandlerContext::new(request, &route, principal.as_ref(), session, excluded);

        for stage in &self.stages {
            if let Flow::Respond(response) = stage.run(&cx) {
                cx.log().debug(format_args!("stage {} answered {}", stage.name(), response.status()));
                return response;
            }
        }

        self.dispatch(worker, &cx)
    }

    fn dispatch(&self, worker: &mut Worker, cx: &HandlerContext<'_>) -> Response {
        // Registration was checked against every route at build time.
        let Some(handler) = self.handlers.get(cx.handler_id()) else {
            cx.log().error(format_args!("no handler registered for {}", cx.handler_id()));
            return Response::internal_error("internal error");
        };

        match handler {
            RegisteredHandler::Modern(handler) => handler.handle(cx),
            RegisteredHandler::Legacy(handler) => {
                match self.executor.run(
                    worker.ambient_mut(),
                    cx.handler_id(),
                    handler.as_ref(),
                    cx.request(),
                    cx.params(),
                ) {
                    Ok(body) => Response::ok(body).with_header("content-type", "text/html; charset=utf-8"),
                    Err(fault) => self.legacy_fault(cx, fault),
                }
            }
        }
    }

    fn legacy_fault(&self, cx: &HandlerContext<'_>, fault: LegacyExecutionFault) -> Response {
        let mut event = AuditEvent::new(
            cx.request().request_id(),
            cx.principal().map(|p| p.id.as_str()),
            AuditEventKind::LegacyFault,
            AuditOutcome::Error,
        )
        .with_handler(fault.handler.clone())
        .with_detail(fault.reason.clone());
        if let Some(tenant) = cx.principal().and_then(|p| p.tenant_id.as_deref()) {
            event = event.with_tenant(tenant);
        }
        self.audit.emit(&event);

        match fault.partial_output {
            Some(partial) => Response::internal_error(partial),
            None => Response::internal_error("internal error"),
        }
    }
}
