//! Session store behavior across manager restarts.

mod common;

use common::{sample_session, seed_store};
use simbridge::store::SessionStore;
use std::collections::HashMap;

#[tokio::test]
async fn sessions_survive_a_manager_restart() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(
        dir.path(),
        &[
            sample_session("sess-a", "UDID-A"),
            sample_session("sess-b", "UDID-B"),
        ],
    );

    // A fresh state (simulating a restarted server) loads both records with
    // their UDIDs and dimensions intact.
    let state = common::make_state(dir.path());
    assert_eq!(state.sessions.count(), 2);

    let a = state.sessions.get("sess-a").unwrap();
    assert_eq!(a.udid, "UDID-A");
    assert_eq!(a.point_width, 393);
    assert_eq!(a.pixel_height, 2556);

    let b = state.sessions.get("sess-b").unwrap();
    assert_eq!(b.udid, "UDID-B");
    assert_eq!(b.scale_factor, 3);
}

#[tokio::test]
async fn corrupted_primary_recovers_from_backup() {
    let dir = tempfile::tempdir().unwrap();

    // Two saves so a backup exists, then corrupt the primary.
    seed_store(dir.path(), &[sample_session("old", "UDID-OLD")]);
    seed_store(
        dir.path(),
        &[
            sample_session("old", "UDID-OLD"),
            sample_session("new", "UDID-NEW"),
        ],
    );
    std::fs::write(dir.path().join("sessions.json"), "{ truncated").unwrap();

    let state = common::make_state(dir.path());
    // Recovery yields the backup's view (the first save).
    assert_eq!(state.sessions.count(), 1);
    assert!(state.sessions.get("old").is_some());
}

#[tokio::test]
async fn installed_apps_round_trip_through_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let mut session = sample_session("sess-a", "UDID-A");
    session.installed_apps.insert(
        "com.example.demo".to_string(),
        simbridge::session::InstalledApp {
            bundle_id: "com.example.demo".to_string(),
            app_name: "Demo".to_string(),
            installed_at: 1_700_000_500,
        },
    );
    seed_store(dir.path(), &[session]);

    let state = common::make_state(dir.path());
    let loaded = state.sessions.get("sess-a").unwrap();
    assert_eq!(loaded.installed_apps.len(), 1);
    assert_eq!(loaded.installed_apps["com.example.demo"].app_name, "Demo");
}

#[tokio::test]
async fn backup_depth_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let store = SessionStore::open(dir.path(), 5).unwrap();

    let mut map = HashMap::new();
    for i in 0..10 {
        map.insert(
            format!("sess-{}", i),
            sample_session(&format!("sess-{}", i), "U"),
        );
        store.save(&map).unwrap();
    }
    assert_eq!(store.backup_count(), 5);

    // The primary still holds the latest view.
    let loaded = store.load();
    assert_eq!(loaded.len(), 10);
}
