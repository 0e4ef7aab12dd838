pub mod error;
mod handlers;
mod ws;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::connections::ConnectionManager;
use crate::driver::HostDriver;
use crate::recording::RecordingService;
use crate::resources::ResourceManager;
use crate::session::SessionManager;

use handlers::*;

/// Maximum accepted upload size (app archives dominate).
const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

/// Shared state for every handler. All components are constructed in `main`
/// and injected here; nothing is a global.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub driver: Arc<HostDriver>,
    pub sessions: SessionManager,
    pub resources: ResourceManager,
    pub connections: ConnectionManager,
    pub recording: RecordingService,
}

pub(crate) fn get_session(
    state: &AppState,
    session_id: &str,
) -> Result<crate::session::Session, error::ApiError> {
    state
        .sessions
        .get(session_id)
        .ok_or_else(|| error::ApiError::not_found(format!("session {}", session_id)))
}

pub fn router(state: AppState) -> Router {
    let session_routes = Router::new()
        .route("/configurations", get(configurations))
        .route("/create", post(session_create))
        .route("/", get(session_list).delete(session_delete_all))
        .route("/recover-orphaned", post(recover_orphaned))
        .route("/refresh", get(refresh_sessions))
        .route("/cleanup-recordings", post(cleanup_recordings))
        .route("/{id}", get(session_get).delete(session_delete))
        .route("/{id}/apps/install", post(app_install))
        .route("/{id}/apps", get(app_list))
        .route("/{id}/apps/{bundle}/launch", post(app_launch))
        .route("/{id}/apps/{bundle}/terminate", post(app_terminate))
        .route("/{id}/apps/{bundle}", axum::routing::delete(app_uninstall))
        .route("/{id}/screenshot", post(screenshot))
        .route("/{id}/orientation", post(set_orientation))
        .route("/{id}/url/open", post(open_url))
        .route("/{id}/location/set", post(location_set))
        .route("/{id}/location/clear", post(location_clear))
        .route("/{id}/location/presets", get(location_presets))
        .route("/{id}/media/photos/add", post(media_photos_add))
        .route("/{id}/media/videos/add", post(media_videos_add))
        .route("/{id}/files/push", post(file_push))
        .route("/{id}/files/pull", post(file_pull))
        .route("/{id}/logs/processes", get(log_processes))
        .route("/{id}/logs/clear", post(log_clear))
        .route("/{id}/recording/start", post(recording_start))
        .route("/{id}/recording/stop", post(recording_stop))
        .route("/{id}/recording/status", get(recording_status));

    let ws_routes = Router::new()
        .route("/{session_id}/control", get(ws::ws_control))
        .route("/{session_id}/video", get(ws::ws_video))
        .route("/{session_id}/ultra-low-latency", get(ws::ws_ultra))
        .route("/{session_id}/webrtc", get(ws::ws_webrtc))
        .route("/{session_id}/screenshot", get(ws::ws_screenshot))
        .route("/{session_id}/logs", get(ws::ws_logs));

    Router::new()
        .nest("/api/sessions", session_routes)
        .nest("/ws", ws_routes)
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
