//! Single-flight credential refresh under contention, within one process and
//! across lock backends that only share a lease directory.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use chrono::Utc;
use guard_bridge::credential::{
    Credential, CredentialExpiration, CredentialRefreshCoordinator, RefreshClient, RefreshOutcome,
    RefreshRequest, RefreshedCredential,
};
use guard_bridge::lock::{
    DistributedRefreshLock, FileLockBackend, LockBackend, LockName, LockSettings, MemoryLockBackend,
};
use guard_bridge::session::{MemorySessionStore, Session, SessionKeys, SessionStore};
use guard_bridge::{Principal, RefreshError, RequestLog};

/// Refresh endpoint stand-in that takes a while to answer.
struct SlowClient {
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl SlowClient {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

impl RefreshClient for SlowClient {
    fn refresh(&self, request: &RefreshRequest<'_>) -> Result<RefreshedCredential, RefreshError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(60));
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(RefreshedCredential {
            credential: Credential::new(format!("fresh-{}", request.principal_id)),
            next_refresh_at: Utc::now() + chrono::Duration::hours(1),
        })
    }
}

fn stale_session(store: &MemorySessionStore, token: &str) {
    let stale = (Utc::now().timestamp() - 30).to_string();
    store
        .set_many(token, &[("credential", "old".to_string()), ("credential_refresh_at", stale)])
        .unwrap();
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

fn settings() -> LockSettings {
    LockSettings {
        ttl: Duration::from_secs(30),
        wait: Duration::from_secs(2),
        poll_interval: Duration::from_millis(5),
    }
}

fn run_concurrently(
    coordinators: Vec<Arc<CredentialRefreshCoordinator>>,
    store: Arc<MemorySessionStore>,
    threads: usize,
) -> Vec<RefreshOutcome> {
    init_tracing();
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|i| {
            let coordinator = coordinators[i % coordinators.len()].clone();
            let store = store.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let principal = Principal::new("user-1", "Ada").with_tenant("store-7");
                let session = Session::new(store.as_ref(), "tok");
                let request_id = format!("req-{}", i);
                barrier.wait();
                coordinator.maybe_refresh(&principal, &session, RequestLog::new(&request_id))
            })
        })
        .collect();
    handles.into_iter().map(|h| h.join().unwrap()).collect()
}

fn assert_fresh(store: &MemorySessionStore) {
    let session = Session::new(store, "tok");
    let expiration = CredentialExpiration::from_session(&session, &SessionKeys::default()).unwrap();
    assert!(!expiration.is_expired(Utc::now()));
    assert_eq!(session.get("credential").unwrap().as_deref(), Some("fresh-user-1"));
}

#[test]
fn concurrent_requests_in_one_process_refresh_once() {
    let store = Arc::new(MemorySessionStore::new());
    stale_session(&store, "tok");
    let client = Arc::new(SlowClient::new());
    let coordinator = Arc::new(CredentialRefreshCoordinator::new(
        client.clone(),
        DistributedRefreshLock::new(Arc::new(MemoryLockBackend::new()), settings()),
        SessionKeys::default(),
    ));

    let outcomes = run_concurrently(vec![coordinator], store.clone(), 16);

    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 1);
    let refreshed = outcomes
        .iter()
        .filter(|o| matches!(o, RefreshOutcome::Refreshed))
        .count();
    assert_eq!(refreshed, 1);
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, RefreshOutcome::Refreshed | RefreshOutcome::AlreadyRefreshed | RefreshOutcome::Deferred)));
    assert_fresh(&store);
}

#[test]
fn processes_sharing_a_lease_directory_refresh_once() {
    let dir = std::env::temp_dir().join(format!("guard-bridge-it-{}", uuid::Uuid::new_v4().simple()));
    let store = Arc::new(MemorySessionStore::new());
    stale_session(&store, "tok");
    let client = Arc::new(SlowClient::new());

    // One backend per simulated process; they share nothing but the directory.
    let coordinators = (0..4)
        .map(|_| {
            let backend = Arc::new(FileLockBackend::new(&dir).unwrap());
            Arc::new(CredentialRefreshCoordinator::new(
                client.clone(),
                DistributedRefreshLock::new(backend, settings()),
                SessionKeys::default(),
            ))
        })
        .collect();

    run_concurrently(coordinators, store.clone(), 12);

    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 1);
    assert_fresh(&store);

    // Every lease was released.
    let backend = FileLockBackend::new(&dir).unwrap();
    assert!(!backend
        .lease_path(&LockName::credential_refresh("user-1", Some("store-7")))
        .exists());
    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn lease_left_by_a_crashed_process_is_taken_over_once() {
    let dir = std::env::temp_dir().join(format!("guard-bridge-it-{}", uuid::Uuid::new_v4().simple()));
    let name = LockName::credential_refresh("user-1", Some("store-7"));

    for round in 0..10 {
        let store = Arc::new(MemorySessionStore::new());
        stale_session(&store, "tok");
        let client = Arc::new(SlowClient::new());

        // A holder that died without releasing: its lease has already lapsed.
        let crashed = FileLockBackend::new(&dir).unwrap();
        assert!(crashed.try_acquire(&name, "crashed", Duration::from_millis(1)).unwrap());
        thread::sleep(Duration::from_millis(5));

        let coordinators = (0..8)
            .map(|_| {
                let backend = Arc::new(FileLockBackend::new(&dir).unwrap());
                Arc::new(CredentialRefreshCoordinator::new(
                    client.clone(),
                    DistributedRefreshLock::new(backend, settings()),
                    SessionKeys::default(),
                ))
            })
            .collect();

        let outcomes = run_concurrently(coordinators, store.clone(), 8);

        assert_eq!(client.calls.load(Ordering::SeqCst), 1, "round {round}: {outcomes:?}");
        assert_eq!(client.max_in_flight.load(Ordering::SeqCst), 1);
        assert_fresh(&store);
        assert!(!crashed.lease_path(&name).exists());
    }

    std::fs::remove_dir_all(dir).unwrap();
}

#[test]
fn contended_lock_defers_without_side_effects() {
    let store = Arc::new(MemorySessionStore::new());
    stale_session(&store, "tok");
    let before = store.get_many("tok", &["credential", "credential_refresh_at"]).unwrap();

    let backend = Arc::new(MemoryLockBackend::new());
    backend
        .try_acquire(
            &LockName::credential_refresh("user-1", Some("store-7")),
            "another-process",
            Duration::from_secs(30),
        )
        .unwrap();
    let client = Arc::new(SlowClient::new());
    let coordinator = CredentialRefreshCoordinator::new(
        client.clone(),
        DistributedRefreshLock::new(
            backend,
            LockSettings {
                wait: Duration::from_millis(30),
                ..settings()
            },
        ),
        SessionKeys::default(),
    );

    let principal = Principal::new("user-1", "Ada").with_tenant("store-7");
    let outcome = coordinator.maybe_refresh(&principal, &Session::new(store.as_ref(), "tok"), RequestLog::new("req-1"));

    assert!(matches!(outcome, RefreshOutcome::Deferred));
    assert_eq!(client.calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        store.get_many("tok", &["credential", "credential_refresh_at"]).unwrap(),
        before
    );
}

#[test]
fn tenants_refresh_independently() {
    let store = Arc::new(MemorySessionStore::new());
    stale_session(&store, "tok-a");
    stale_session(&store, "tok-b");

    let backend = Arc::new(MemoryLockBackend::new());
    // Tenant A's lock is held elsewhere; tenant B's is free.
    backend
        .try_acquire(
            &LockName::credential_refresh("user-1", Some("a")),
            "another-process",
            Duration::from_secs(30),
        )
        .unwrap();
    let client = Arc::new(SlowClient::new());
    let coordinator = CredentialRefreshCoordinator::new(
        client.clone(),
        DistributedRefreshLock::new(
            backend,
            LockSettings {
                wait: Duration::from_millis(10),
                ..settings()
            },
        ),
        SessionKeys::default(),
    );

    let a = coordinator.maybe_refresh(
        &Principal::new("user-1", "Ada").with_tenant("a"),
        &Session::new(store.as_ref(), "tok-a"),
        RequestLog::new("req-a"),
    );
    let b = coordinator.maybe_refresh(
        &Principal::new("user-1", "Ada").with_tenant("b"),
        &Session::new(store.as_ref(), "tok-b"),
        RequestLog::new("req-b"),
    );

    assert!(matches!(a, RefreshOutcome::Deferred));
    assert!(matches!(b, RefreshOutcome::Refreshed));
    assert_eq!(client.calls.load(Ordering::SeqCst), 1);
}
