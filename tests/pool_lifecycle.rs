//! Pool behaviour against an in-memory transport.

use heaplink::transport::HandshakeReply;
use heaplink::{
    backoff_delay, Endpoint, Frame, MemoryTransport, PoolConfig, SessionPool, SessionState,
    StaticResolver,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn config(base_ms: u64) -> PoolConfig {
    PoolConfig {
        reconnect_base: Duration::from_millis(base_ms),
        handshake_timeout: Duration::from_millis(500),
        reconcile_interval: Duration::from_secs(3600),
        ..Default::default()
    }
}

fn pool_with(
    transport: &Arc<MemoryTransport>,
    resolver: Arc<StaticResolver>,
    base_ms: u64,
) -> SessionPool {
    SessionPool::new(config(base_ms), Arc::clone(transport) as _, resolver).unwrap()
}

fn wait_until<F: Fn() -> bool>(timeout: Duration, check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    check()
}

// --- Reconnect pacing ---

#[test]
fn test_backoff_between_failed_attempts() {
    let transport = Arc::new(MemoryTransport::new());
    let endpoint = Endpoint::new("flaky:1");
    transport.accept_after(endpoint.clone(), 3);

    let base = Duration::from_millis(20);
    let pool = pool_with(&transport, Arc::new(StaticResolver::default()), 20);
    pool.start().unwrap();
    assert!(pool.open_session(&endpoint));

    assert!(wait_until(Duration::from_secs(5), || pool.session(&endpoint).is_some()));
    let attempts = transport.attempts(&endpoint);
    assert_eq!(attempts.len(), 4);

    for (k, pair) in attempts.windows(2).enumerate() {
        let gap = pair[1] - pair[0];
        let expected = backoff_delay(base, k as u32 + 1);
        assert!(
            gap + Duration::from_millis(1) >= expected,
            "attempt {} came after {:?}, expected {:?}",
            k + 2,
            gap,
            expected
        );
        assert!(gap < expected + Duration::from_millis(250));
    }
    assert!(!pool.is_pending(&endpoint));
}

#[test]
fn test_retries_continue_until_stopped() {
    let transport = Arc::new(MemoryTransport::new());
    let endpoint = Endpoint::new("down:1");
    transport.refuse(endpoint.clone());

    let pool = pool_with(&transport, Arc::new(StaticResolver::default()), 2);
    pool.start().unwrap();
    pool.open_session(&endpoint);

    assert!(wait_until(Duration::from_secs(5), || transport.attempts(&endpoint).len() >= 5));
    assert!(pool.is_pending(&endpoint));

    pool.stop();
    let settled = transport.attempts(&endpoint).len();
    thread::sleep(Duration::from_millis(100));
    assert!(transport.attempts(&endpoint).len() <= settled + 1);
    assert!(!pool.is_pending(&endpoint));
}

#[test]
fn test_handshake_timeout_is_retried() {
    let transport = Arc::new(MemoryTransport::new());
    let endpoint = Endpoint::new("mute:1");
    transport.reply_with(endpoint.clone(), HandshakeReply::Silent);

    let pool = SessionPool::new(
        PoolConfig {
            handshake_timeout: Duration::from_millis(20),
            ..config(5)
        },
        Arc::clone(&transport) as _,
        Arc::new(StaticResolver::default()),
    )
    .unwrap();
    pool.start().unwrap();
    pool.open_session(&endpoint);

    assert!(wait_until(Duration::from_secs(5), || transport.connection_count(&endpoint) >= 2));
    assert!(pool.session(&endpoint).is_none());
    assert!(pool.get_session().is_none());
}

// --- Map invariants ---

#[test]
fn test_endpoint_never_both_live_and_pending() {
    let transport = Arc::new(MemoryTransport::new());
    let endpoints: Vec<Endpoint> = (0..4).map(|i| Endpoint::new(format!("node-{}:1", i))).collect();
    for (i, endpoint) in endpoints.iter().enumerate() {
        transport.accept_after(endpoint.clone(), i as u32);
    }

    let pool = Arc::new(pool_with(&transport, Arc::new(StaticResolver::default()), 1));
    pool.start().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let checker = {
        let pool = Arc::clone(&pool);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut checks = 0;
            while !done.load(Ordering::SeqCst) {
                let snapshot = pool.snapshot();
                let live: BTreeSet<&Endpoint> = snapshot.sessions.iter().map(|s| &s.endpoint).collect();
                assert_eq!(live.len(), snapshot.sessions.len());
                for pending in &snapshot.pending {
                    assert!(!live.contains(&pending.endpoint));
                }
                checks += 1;
            }
            checks
        })
    };

    let churners: Vec<_> = (0..3)
        .map(|t| {
            let pool = Arc::clone(&pool);
            let endpoints = endpoints.clone();
            thread::spawn(move || {
                for round in 0..200 {
                    let endpoint = &endpoints[(round + t) % endpoints.len()];
                    match (round + t) % 3 {
                        0 => {
                            pool.open_session(endpoint);
                        }
                        1 => {
                            pool.close_session(endpoint, true);
                        }
                        _ => {
                            pool.close_session(endpoint, false);
                        }
                    }
                    if round % 20 == 0 {
                        thread::sleep(Duration::from_millis(1));
                    }
                }
            })
        })
        .collect();

    for churner in churners {
        churner.join().unwrap();
    }
    done.store(true, Ordering::SeqCst);
    assert!(checker.join().unwrap() > 0);
}

// --- Session selection ---

#[test]
fn test_get_session_only_returns_available() {
    let transport = Arc::new(MemoryTransport::new());
    let endpoints: Vec<Endpoint> = (0..3).map(|i| Endpoint::new(format!("srv-{}:1", i))).collect();
    for endpoint in &endpoints {
        transport.accept(endpoint.clone());
    }
    let pool = pool_with(&transport, Arc::new(StaticResolver::new(endpoints.clone())), 5);
    pool.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || pool.sessions().len() == 3));

    transport.peer(&endpoints[0]).unwrap().inject(Frame::Suspend);
    transport.peer(&endpoints[1]).unwrap().inject(Frame::Disconnect);
    assert!(wait_until(Duration::from_secs(5), || {
        pool.session(&endpoints[0]).map(|s| s.state()) == Some(SessionState::Suspended)
            && pool.session(&endpoints[1]).map(|s| s.state()) == Some(SessionState::Disconnecting)
    }));

    for _ in 0..20 {
        let session = pool.get_session().unwrap();
        assert!(session.is_available());
        assert_eq!(session.endpoint(), &endpoints[2]);
    }

    transport.peer(&endpoints[2]).unwrap().inject(Frame::Suspend);
    assert!(wait_until(Duration::from_secs(5), || pool.get_session().is_none()));

    // Still live, just not available.
    assert_eq!(pool.sessions().len(), 3);
    assert_eq!(pool.snapshot().available(), 0);
}

#[test]
fn test_rotation_visits_every_session() {
    let transport = Arc::new(MemoryTransport::new());
    let endpoints: Vec<Endpoint> = (0..3).map(|i| Endpoint::new(format!("rr-{}:1", i))).collect();
    for endpoint in &endpoints {
        transport.accept(endpoint.clone());
    }
    let pool = pool_with(&transport, Arc::new(StaticResolver::new(endpoints.clone())), 5);
    pool.start().unwrap();
    assert!(wait_until(Duration::from_secs(5), || pool.snapshot().available() == 3));

    for n in [3usize, 10, 31] {
        let mut visits: HashMap<Endpoint, usize> = HashMap::new();
        for _ in 0..n {
            let session = pool.get_session().unwrap();
            *visits.entry(session.endpoint().clone()).or_default() += 1;
        }
        for endpoint in &endpoints {
            assert!(visits.get(endpoint).copied().unwrap_or(0) >= n / 3);
        }
    }
}

// --- Closing ---

#[test]
fn test_close_without_reconnect_leaves_nothing() {
    let transport = Arc::new(MemoryTransport::new());
    let live = Endpoint::new("live:1");
    let down = Endpoint::new("down:1");
    transport.accept(live.clone());
    transport.refuse(down.clone());

    let pool = pool_with(&transport, Arc::new(StaticResolver::default()), 5);
    pool.start().unwrap();
    pool.open_session(&live);
    pool.open_session(&down);
    assert!(wait_until(Duration::from_secs(5), || pool.session(&live).is_some()));
    assert!(wait_until(Duration::from_secs(5), || transport.attempts(&down).len() >= 2));

    let peer = transport.peer(&live).unwrap();
    assert!(pool.close_session(&live, false));
    assert!(pool.close_session(&down, false));
    assert!(!pool.close_session(&live, false));

    let attempts_down = transport.attempts(&down).len();
    thread::sleep(Duration::from_millis(150));

    assert!(pool.session(&live).is_none());
    assert!(!pool.is_pending(&live));
    assert!(!pool.is_pending(&down));
    assert!(peer.is_closed());
    assert_eq!(transport.connection_count(&live), 1);
    assert!(transport.attempts(&down).len() <= attempts_down + 1);
}

#[test]
fn test_close_with_reconnect_replaces_session() {
    let transport = Arc::new(MemoryTransport::new());
    let endpoint = Endpoint::new("bounce:1");
    transport.accept(endpoint.clone());

    let pool = pool_with(&transport, Arc::new(StaticResolver::default()), 5);
    pool.start().unwrap();
    pool.open_session(&endpoint);
    assert!(wait_until(Duration::from_secs(5), || pool.session(&endpoint).is_some()));
    let first = pool.session(&endpoint).unwrap().id();

    assert!(pool.close_session(&endpoint, true));
    assert!(wait_until(Duration::from_secs(5), || {
        pool.session(&endpoint).map_or(false, |s| s.id() != first)
    }));
    assert_eq!(transport.connection_count(&endpoint), 2);
}

// --- Reconciliation ---

#[test]
fn test_reconcile_follows_topology() {
    let transport = Arc::new(MemoryTransport::new());
    let a = Endpoint::new("a:1");
    let b = Endpoint::new("b:1");
    let manual = Endpoint::new("manual:1");
    for endpoint in [&a, &b, &manual] {
        transport.accept(endpoint.clone());
    }

    let resolver = Arc::new(StaticResolver::new([a.clone()]));
    let pool = pool_with(&transport, Arc::clone(&resolver), 5);
    pool.start().unwrap();
    pool.open_session(&manual);
    assert!(wait_until(Duration::from_secs(5), || pool.sessions().len() == 2));

    resolver.set([b.clone()]);
    pool.reconcile();
    assert!(wait_until(Duration::from_secs(5), || {
        pool.session(&b).is_some() && pool.session(&a).is_none()
    }));
    assert!(pool.session(&manual).is_some());
    assert!(!pool.is_pending(&a));
}
