//! Tests for session accounting: inflight credits, registry and sweep

use std::sync::Arc;
use std::time::Duration;

use janus::server::session::{InflightGauge, Session, SessionIndex};

fn session(index: &Arc<SessionIndex>, gauge: &Arc<InflightGauge>) -> Session {
    Session::new(
        Arc::clone(index),
        "www",
        "198.51.100.7:54321".parse().unwrap(),
        0,
        gauge.reserve().unwrap(),
    )
}

#[test]
fn test_inflight_decrements_exactly_once_per_session() {
    let index = SessionIndex::new(16);
    let gauge = InflightGauge::new(16);

    // Success path: credit released at connect, teardown must not release
    // it again.
    let mut s = session(&index, &gauge);
    assert_eq!(gauge.outstanding(), 1);
    s.connected();
    assert_eq!(gauge.outstanding(), 0);
    s.teardown("done");
    assert_eq!(gauge.outstanding(), 0);

    // Failure path: never connected, teardown releases.
    let mut s = session(&index, &gauge);
    assert_eq!(gauge.outstanding(), 1);
    s.teardown("connect failed");
    assert_eq!(gauge.outstanding(), 0);

    // Drop path: neither connected nor torn down explicitly.
    let s = session(&index, &gauge);
    assert_eq!(gauge.outstanding(), 1);
    drop(s);
    assert_eq!(gauge.outstanding(), 0);
}

#[test]
fn test_capacity_gate() {
    let index = SessionIndex::new(2);
    let gauge = InflightGauge::new(16);

    let _a = session(&index, &gauge);
    assert!(!index.at_capacity());
    let _b = session(&index, &gauge);
    assert!(index.at_capacity());
    assert_eq!(index.live(), 2);
    drop(_a);
    assert!(!index.at_capacity());
}

#[test]
fn test_session_ids_are_unique_and_increasing() {
    let index = SessionIndex::new(16);
    let gauge = InflightGauge::new(16);
    let a = session(&index, &gauge);
    let b = session(&index, &gauge);
    assert!(b.id() > a.id());
}

#[tokio::test]
async fn test_sweep_force_closes_idle_sessions() {
    let index = SessionIndex::new(16);
    let meta = index.register("www");

    // Freshly registered sessions are not idle.
    assert_eq!(index.sweep(Duration::from_secs(60)), 0);
    assert!(!meta.is_done());

    // A zero idle budget closes everything immediately.
    let closed = index.sweep(Duration::from_millis(0));
    assert_eq!(closed, 1);
    assert!(meta.is_done());

    // The cooperative wait resolves immediately once closed.
    tokio::time::timeout(Duration::from_secs(1), meta.closed())
        .await
        .expect("closed() should resolve after sweep");
}

#[tokio::test]
async fn test_force_close_wakes_waiter() {
    let index = SessionIndex::new(16);
    let meta = index.register("www");
    let waiter = {
        let meta = Arc::clone(&meta);
        tokio::spawn(async move { meta.closed().await })
    };
    tokio::task::yield_now().await;
    meta.force_close();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("waiter should wake")
        .unwrap();
}
