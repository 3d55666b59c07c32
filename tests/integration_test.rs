//! End-to-end flows through an assembled pipeline.

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::Utc;
use guard_bridge::audit::{AuditEventKind, AuditTrail};
use guard_bridge::credential::{
    Credential, CredentialRefreshCoordinator, RefreshClient, RefreshRequest, RefreshedCredential,
};
use guard_bridge::legacy::{AmbientState, LegacyEnv, LegacyFault, Verbosity};
use guard_bridge::lock::{DistributedRefreshLock, LockSettings, MemoryLockBackend};
use guard_bridge::notice::take_login_notice;
use guard_bridge::pipeline::{HandlerContext, PipelineBuilder};
use guard_bridge::session::{MemorySessionStore, SessionKeys, SessionStore};
use guard_bridge::{
    HttpMethod, InboundRequest, Pipeline, PipelineConfig, Principal, RefreshError, Response, Worker,
};

const CONFIG: &str = r#"{
    "routes": [
        {"pattern": "/logout", "handler": "logout", "priority": 10},
        {"pattern": "/login", "handler": "login", "priority": 10},
        {"pattern": "/dashboard", "handler": "dashboard", "priority": 10},
        {"pattern": "/legacy/{path*}", "handler": "bridge", "kind": "legacy", "priority": 0}
    ],
    "legacy_root": "/srv/legacy"
}"#;

fn dashboard(cx: &HandlerContext<'_>) -> Response {
    let name = cx.principal().map(|p| p.name.as_str()).unwrap_or("guest");
    Response::ok(format!("hello {}", name))
}

fn legacy_bridge(env: &mut LegacyEnv<'_>) -> Result<(), LegacyFault> {
    env.set_verbosity(Verbosity::Debug);
    env.chdir("includes");
    env.diagnostic(Verbosity::Notice, "undefined index: page");
    match env.server("ROUTE_PATH") {
        Some("crash.php") => panic!("call to undefined function"),
        Some("fault.php") => Err(LegacyFault::new("mysql server has gone away")),
        Some(page) => {
            let page = page.to_string();
            let cwd = env.cwd().display().to_string();
            write!(env, "{} from {}", page, cwd).map_err(|e| LegacyFault::new(e.to_string()))
        }
        None => Err(LegacyFault::new("no page")),
    }
}

fn with_handlers(builder: PipelineBuilder) -> PipelineBuilder {
    let notices = builder.notice_channel();
    builder
        .modern("login", move |cx: &HandlerContext<'_>| {
            match take_login_notice(notices.as_ref(), cx.request(), "notice") {
                Some(notice) => Response::ok(notice.message()),
                None => Response::ok("please sign in"),
            }
        })
        .modern("dashboard", dashboard)
        .legacy("bridge", legacy_bridge)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn pipeline(sessions: Arc<MemorySessionStore>) -> Pipeline {
    init_tracing();
    let builder = PipelineConfig::from_json(CONFIG)
        .unwrap()
        .pipeline_builder(sessions)
        .unwrap();
    with_handlers(builder).build().unwrap()
}

fn authed(id: &str, target: &str) -> InboundRequest {
    let mut request = InboundRequest::new(id, HttpMethod::Get, target);
    request.set_principal(Some(Principal::new("user-1", "Ada")));
    request.set_session_token(Some("tok".to_string()));
    request
}

fn seed_complete(store: &MemorySessionStore) {
    let refresh_at = (Utc::now().timestamp() + 3_600).to_string();
    store
        .set_many(
            "tok",
            &[("credential", "abc".to_string()), ("credential_refresh_at", refresh_at)],
        )
        .unwrap();
}

#[test]
fn invalid_session_notice_survives_logout_and_shows_once() {
    let sessions = Arc::new(MemorySessionStore::new());
    sessions.set("tok", "theme", "dark".to_string()).unwrap();
    let pipeline = pipeline(sessions.clone());
    let mut worker = Worker::default();

    // 1. The guard sends the incomplete session to logout.
    let response = pipeline.handle(&mut worker, &authed("req-1", "/dashboard"));
    assert_eq!(response.status(), 302);
    let to_logout = response.location().unwrap().to_string();
    assert!(to_logout.starts_with("/logout?notice="));

    // 2. Logout destroys the session and forwards the notice token.
    let response = pipeline.handle(&mut worker, &authed("req-2", &to_logout));
    assert_eq!(response.status(), 302);
    let to_login = response.location().unwrap().to_string();
    assert!(to_login.starts_with("/login?notice="));
    assert!(!sessions.contains_session("tok"));

    // 3. The login page shows the message once.
    let anonymous = InboundRequest::new("req-3", HttpMethod::Get, &to_login);
    let response = pipeline.handle(&mut worker, &anonymous);
    assert_eq!(response.status(), 200);
    assert!(String::from_utf8_lossy(response.body()).contains("signed out"));

    // 4. Reloading the same URL shows nothing.
    let again = InboundRequest::new("req-4", HttpMethod::Get, &to_login);
    let response = pipeline.handle(&mut worker, &again);
    assert_eq!(response.body(), b"please sign in");
}

#[test]
fn complete_session_passes_untouched() {
    let sessions = Arc::new(MemorySessionStore::new());
    seed_complete(&sessions);
    sessions.set("tok", "cart", "3 items".to_string()).unwrap();
    let before = sessions
        .get_many("tok", &["credential", "credential_refresh_at", "cart"])
        .unwrap();
    let pipeline = pipeline(sessions.clone());

    let response = pipeline.handle(&mut Worker::default(), &authed("req-1", "/dashboard"));
    assert_eq!(response.status(), 200);
    assert_eq!(response.body(), b"hello Ada");

    let after = sessions
        .get_many("tok", &["credential", "credential_refresh_at", "cart"])
        .unwrap();
    assert_eq!(before, after);
}

#[test]
fn anonymous_request_is_not_guarded() {
    let pipeline = pipeline(Arc::new(MemorySessionStore::new()));
    let request = InboundRequest::new("req-1", HttpMethod::Get, "/dashboard");
    let response = pipeline.handle(&mut Worker::default(), &request);
    assert_eq!(response.body(), b"hello guest");
}

#[test]
fn unknown_path_is_not_found() {
    let pipeline = pipeline(Arc::new(MemorySessionStore::new()));
    let response = pipeline.handle(&mut Worker::default(), &authed("req-1", "/admin"));
    assert_eq!(response.status(), 404);
}

#[test]
fn legacy_handlers_leave_worker_state_alone() {
    let sessions = Arc::new(MemorySessionStore::new());
    seed_complete(&sessions);
    let pipeline = pipeline(sessions);
    let mut worker = Worker::new(AmbientState {
        verbosity: Verbosity::Info,
        working_dir: "/home/app".into(),
    });
    let baseline = worker.ambient().clone();

    let response = pipeline.handle(&mut worker, &authed("req-1", "/legacy/report.php"));
    assert_eq!(response.status(), 200);
    assert_eq!(response.body(), b"report.php from /srv/legacy/includes");
    assert_eq!(worker.ambient(), &baseline);

    let response = pipeline.handle(&mut worker, &authed("req-2", "/legacy/crash.php"));
    assert_eq!(response.status(), 500);
    assert_eq!(worker.ambient(), &baseline);

    let response = pipeline.handle(&mut worker, &authed("req-3", "/legacy/fault.php"));
    assert_eq!(response.status(), 500);
    assert_eq!(response.body(), b"internal error");
    assert_eq!(worker.ambient(), &baseline);

    // The worker keeps serving normally afterwards.
    let response = pipeline.handle(&mut worker, &authed("req-4", "/legacy/index.php"));
    assert_eq!(response.status(), 200);
}

#[test]
fn legacy_partial_output_kept_when_configured() {
    let sessions = Arc::new(MemorySessionStore::new());
    seed_complete(&sessions);
    let mut config = PipelineConfig::from_json(CONFIG).unwrap();
    config.partial_output = guard_bridge::legacy::PartialOutputPolicy::Keep;
    let pipeline = with_handlers(config.pipeline_builder(sessions).unwrap())
        .legacy("bridge", |env: &mut LegacyEnv<'_>| -> Result<(), LegacyFault> {
            let _ = env.write_all(b"<h1>Report</h1>");
            Err(LegacyFault::new("division by zero"))
        })
        .build()
        .unwrap();

    let response = pipeline.handle(&mut Worker::default(), &authed("req-1", "/legacy/x.php"));
    assert_eq!(response.status(), 500);
    assert_eq!(response.body(), b"<h1>Report</h1>");
}

struct CountingClient {
    calls: AtomicUsize,
}

impl RefreshClient for CountingClient {
    fn refresh(&self, _: &RefreshRequest<'_>) -> Result<RefreshedCredential, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(RefreshedCredential {
            credential: Credential::new("rotated"),
            next_refresh_at: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

#[test]
fn stale_credential_is_refreshed_before_the_handler_runs() {
    let sessions = Arc::new(MemorySessionStore::new());
    let stale = (Utc::now().timestamp() - 5).to_string();
    sessions
        .set_many("tok", &[("credential", "old".to_string()), ("credential_refresh_at", stale)])
        .unwrap();

    let client = Arc::new(CountingClient {
        calls: AtomicUsize::new(0),
    });
    let trail = Arc::new(AuditTrail::new());
    let coordinator = CredentialRefreshCoordinator::new(
        client.clone(),
        DistributedRefreshLock::new(Arc::new(MemoryLockBackend::new()), LockSettings::default()),
        SessionKeys::default(),
    )
    .with_audit_sink(trail.clone());

    let builder = PipelineConfig::from_json(CONFIG)
        .unwrap()
        .pipeline_builder(sessions.clone())
        .unwrap()
        .refresh(coordinator);
    let pipeline = with_handlers(builder)
        .modern("dashboard", |cx: &HandlerContext<'_>| {
            let credential = cx.session().and_then(|s| s.get("credential").ok().flatten());
            Response::ok(credential.unwrap_or_default())
        })
        .build()
        .unwrap();
    let mut worker = Worker::default();

    let response = pipeline.handle(&mut worker, &authed("req-1", "/dashboard"));
    assert_eq!(response.body(), b"rotated");
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);

    // Fresh now: the next request does no refresh work.
    pipeline.handle(&mut worker, &authed("req-2", "/dashboard"));
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    assert_eq!(trail.events_of(AuditEventKind::RefreshAttempt).len(), 1);

    // Excluded routes never trigger a refresh.
    sessions
        .set("tok", "credential_refresh_at", "0".to_string())
        .unwrap();
    pipeline.handle(&mut worker, &authed("req-3", "/login"));
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
}
