//! REST surface behavior that does not require a live simulator.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{sample_session, seed_store};
use http_body_util::BodyExt;
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let body = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&body).unwrap()
}

#[tokio::test]
async fn health_counts_restored_sessions() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[sample_session("sess-a", "UDID-A")]);
    let app = simbridge::api::router(common::make_state(dir.path()));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["total_sessions"], 1);
    assert_eq!(json["active_recordings"], 0);
}

#[tokio::test]
async fn session_detail_is_served_from_the_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[sample_session("sess-a", "UDID-A")]);
    let app = simbridge::api::router(common::make_state(dir.path()));

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/sessions/sess-a")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["session_id"], "sess-a");
    assert_eq!(json["udid"], "UDID-A");
    assert_eq!(json["point_width"], 393);
    assert_eq!(json["pixel_width"], 1179);
    assert_eq!(json["scale_factor"], 3);
}

#[tokio::test]
async fn missing_session_returns_not_found_error_shape() {
    let dir = tempfile::tempdir().unwrap();
    let app = simbridge::api::router(common::make_state(dir.path()));

    for uri in [
        "/api/sessions/ghost",
        "/api/sessions/ghost/apps",
        "/api/sessions/ghost/recording/status",
        "/api/sessions/ghost/location/presets",
    ] {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND, "{}", uri);
        let json = body_json(response).await;
        assert_eq!(json["error"]["code"], "not-found", "{}", uri);
    }
}

#[tokio::test]
async fn stopping_an_inactive_recording_is_bad_state_not_success() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[sample_session("sess-a", "UDID-A")]);
    let app = simbridge::api::router(common::make_state(dir.path()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/sessions/sess-a/recording/stop")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "bad-state");
}

#[tokio::test]
async fn stats_exposes_connection_and_resource_state() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[sample_session("sess-a", "UDID-A")]);
    let state = common::make_state(dir.path());

    // Register a connection and acquire a capture service out-of-band, the
    // way endpoints do, then observe them in /stats.
    let _guard = state
        .connections
        .try_register(
            "sess-a",
            simbridge::connections::ConnectionKind::Video,
            "10.1.2.3",
        )
        .unwrap();
    let _service = state.resources.video("UDID-A", (1179, 2556), "client-1");

    let app = simbridge::api::router(state.clone());
    let response = app
        .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;

    assert_eq!(json["connections"]["total_connections"], 1);
    assert_eq!(json["connections"]["sessions"]["sess-a"]["total"], 1);
    assert_eq!(
        json["connections"]["sessions"]["sess-a"]["by_kind"]["video"],
        1
    );
    assert_eq!(json["resources"]["video_services"], 1);
    assert_eq!(json["resources"]["total_clients"], 1);
    assert!(json["memory"]["limit_mb"].is_number());

    state.resources.cleanup_all().await;
}

#[tokio::test]
async fn connection_slots_free_on_guard_drop() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[sample_session("sess-a", "UDID-A")]);
    let state = common::make_state(dir.path());

    let guard = state
        .connections
        .try_register(
            "sess-a",
            simbridge::connections::ConnectionKind::Video,
            "10.1.2.3",
        )
        .unwrap();
    assert_eq!(state.connections.session_count("sess-a"), 1);
    drop(guard);

    // After close the registry shows zero immediately.
    let app = simbridge::api::router(state);
    let response = app
        .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["connections"]["total_connections"], 0);
}

#[tokio::test]
async fn create_requires_both_fields() {
    let dir = tempfile::tempdir().unwrap();
    let app = simbridge::api::router(common::make_state(dir.path()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/sessions/create")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"device_type": "iPhone 15 Pro"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn file_pull_requires_json_body() {
    let dir = tempfile::tempdir().unwrap();
    seed_store(dir.path(), &[sample_session("sess-a", "UDID-A")]);
    let app = simbridge::api::router(common::make_state(dir.path()));

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/sessions/sess-a/files/pull")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    // Missing content-type / body is rejected before any driver call.
    assert_ne!(response.status(), StatusCode::OK);
}
