//! Boundary behavior of the connection manager: rate window and session cap.

use simbridge::connections::{ConnectionKind, ConnectionManager};
use std::time::Duration;

#[test]
fn twenty_first_connection_in_window_is_rejected_and_twenty_stay_live() {
    let mgr = ConnectionManager::new(100, 20, Duration::from_secs(60));

    let guards: Vec<_> = (0..20)
        .map(|_| {
            mgr.try_register("sess-a", ConnectionKind::Video, "203.0.113.7")
                .expect("first twenty admitted")
        })
        .collect();

    let err = mgr
        .try_register("sess-a", ConnectionKind::Video, "203.0.113.7")
        .unwrap_err();
    assert_eq!(err.kind(), "rate-limited");
    assert_eq!(mgr.session_count("sess-a"), 20);

    drop(guards);
    assert_eq!(mgr.session_count("sess-a"), 0);
}

#[test]
fn eleventh_connection_across_kinds_exceeds_the_cap() {
    let mgr = ConnectionManager::new(10, 100, Duration::from_secs(60));

    let kinds = [
        ConnectionKind::Control,
        ConnectionKind::Video,
        ConnectionKind::UltraVideo,
        ConnectionKind::WebrtcSignaling,
        ConnectionKind::Screenshot,
        ConnectionKind::Logs,
    ];
    let mut guards = Vec::new();
    for i in 0..10 {
        let kind = kinds[i % kinds.len()];
        // Distinct sources keep the rate limiter out of the picture.
        let source = format!("10.0.0.{}", i);
        guards.push(mgr.try_register("sess-a", kind, &source).unwrap());
    }

    let err = mgr
        .try_register("sess-a", ConnectionKind::Control, "10.0.0.200")
        .unwrap_err();
    assert_eq!(err.kind(), "cap-exceeded");
    assert_eq!(mgr.session_count("sess-a"), 10);
}

#[test]
fn rate_window_is_keyed_by_session_and_source() {
    let mgr = ConnectionManager::new(100, 1, Duration::from_secs(60));

    let _a = mgr
        .try_register("sess-a", ConnectionKind::Video, "10.0.0.1")
        .unwrap();
    // Same source, same session: throttled.
    assert!(mgr
        .try_register("sess-a", ConnectionKind::Video, "10.0.0.1")
        .is_err());
    // Same source, different session: admitted.
    assert!(mgr
        .try_register("sess-b", ConnectionKind::Video, "10.0.0.1")
        .is_ok());
    // Different source, same session: admitted.
    assert!(mgr
        .try_register("sess-a", ConnectionKind::Video, "10.0.0.2")
        .is_ok());
}

#[test]
fn denials_are_cheap_and_repeatable() {
    let mgr = ConnectionManager::new(100, 1, Duration::from_secs(60));
    let _a = mgr
        .try_register("sess-a", ConnectionKind::Video, "10.0.0.1")
        .unwrap();

    for _ in 0..1000 {
        let err = mgr
            .try_register("sess-a", ConnectionKind::Video, "10.0.0.1")
            .unwrap_err();
        assert_eq!(err.kind(), "rate-limited");
    }
    // Denied attempts never grew the live connection count.
    assert_eq!(mgr.session_count("sess-a"), 1);
}

#[test]
fn stats_shape_matches_monitoring_contract() {
    let mgr = ConnectionManager::new(10, 100, Duration::from_secs(60));
    let _a = mgr
        .try_register("sess-a", ConnectionKind::Video, "10.0.0.1")
        .unwrap();
    let _b = mgr
        .try_register("sess-a", ConnectionKind::Logs, "10.0.0.2")
        .unwrap();

    let stats = mgr.stats();
    assert_eq!(stats.total_sessions, 1);
    assert_eq!(stats.total_connections, 2);
    assert!(stats.rate_limit_buckets >= 1);
    let session = &stats.sessions["sess-a"];
    assert_eq!(session.total, 2);
    assert_eq!(session.by_kind["video"], 1);
    assert_eq!(session.by_kind["logs"], 1);
    assert_eq!(session.distinct_sources, 2);
}
