use axum::{
    extract::{Multipart, Path, State},
    http::header,
    response::IntoResponse,
    Json,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::error::ApiError;
use super::{get_session, AppState};
use crate::error::Error;

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

pub(super) async fn configurations(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let configurations = state.sessions.configurations().await?;
    Ok(Json(configurations))
}

#[derive(Deserialize)]
pub(super) struct CreateSessionRequest {
    device_type: String,
    os_version: String,
}

pub(super) async fn session_create(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .sessions
        .create(&req.device_type, &req.os_version)
        .await?;
    Ok(Json(session))
}

pub(super) async fn session_list(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.sessions.list().await))
}

pub(super) async fn session_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = get_session(&state, &id)?;
    Ok(Json(session))
}

pub(super) async fn session_delete(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.sessions.delete(&id, &state.resources).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub(super) async fn session_delete_all(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.sessions.delete_all(&state.resources).await;
    Ok(Json(serde_json::json!({ "deleted": deleted })))
}

pub(super) async fn recover_orphaned(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let recovered = state.sessions.recover_orphaned().await?;
    Ok(Json(recovered))
}

pub(super) async fn refresh_sessions(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = state.sessions.refresh().await?;
    Ok(Json(sessions))
}

// ---------------------------------------------------------------------------
// Apps
// ---------------------------------------------------------------------------

/// Pull the uploaded archive out of a multipart body into a scratch file.
async fn save_upload(
    multipart: &mut Multipart,
    dir: &std::path::Path,
) -> Result<Option<PathBuf>, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {}", e)))?
    {
        if field.file_name().is_none() {
            continue;
        }
        let filename = field
            .file_name()
            .map(sanitize_filename)
            .unwrap_or_else(|| "upload.bin".to_string());
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(format!("upload read failed: {}", e)))?;
        let path = dir.join(filename);
        std::fs::write(&path, &bytes).map_err(Error::Io)?;
        return Ok(Some(path));
    }
    Ok(None)
}

fn sanitize_filename(name: &str) -> String {
    let base = std::path::Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.bin");
    base.replace(['/', '\\'], "_")
}

pub(super) async fn app_install(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let session = get_session(&state, &id)?;
    let scratch = tempfile::tempdir().map_err(Error::Io)?;
    let archive = save_upload(&mut multipart, scratch.path())
        .await?
        .ok_or_else(|| ApiError::bad_request("no archive in upload"))?;

    let info = state.driver.install_app(&session.udid, &archive).await?;
    state
        .sessions
        .record_installed_app(&id, &info.bundle_id, &info.app_name)
        .await?;
    Ok(Json(serde_json::json!({ "bundle_id": info.bundle_id })))
}

pub(super) async fn app_list(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = get_session(&state, &id)?;
    let apps = state.driver.list_apps(&session.udid).await?;
    Ok(Json(apps))
}

pub(super) async fn app_launch(
    State(state): State<AppState>,
    Path((id, bundle)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let session = get_session(&state, &id)?;
    let pid = state.driver.launch_app(&session.udid, &bundle).await?;
    Ok(Json(serde_json::json!({ "pid": pid })))
}

pub(super) async fn app_terminate(
    State(state): State<AppState>,
    Path((id, bundle)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let session = get_session(&state, &id)?;
    state.driver.terminate_app(&session.udid, &bundle).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub(super) async fn app_uninstall(
    State(state): State<AppState>,
    Path((id, bundle)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let session = get_session(&state, &id)?;
    state.driver.uninstall_app(&session.udid, &bundle).await?;
    state.sessions.record_uninstalled_app(&id, &bundle).await;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Device actions
// ---------------------------------------------------------------------------

pub(super) async fn screenshot(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = get_session(&state, &id)?;
    let png = state.driver.screenshot(&session.udid).await?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png))
}

#[derive(Deserialize)]
pub(super) struct OrientationRequest {
    orientation: String,
}

pub(super) async fn set_orientation(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<OrientationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = get_session(&state, &id)?;
    state
        .driver
        .set_orientation(&session.udid, &req.orientation)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

#[derive(Deserialize)]
pub(super) struct OpenUrlRequest {
    url: String,
}

pub(super) async fn open_url(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<OpenUrlRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = get_session(&state, &id)?;
    state.driver.open_url(&session.udid, &req.url).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Location
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
pub(super) struct LocationRequest {
    latitude: f64,
    longitude: f64,
}

#[derive(Serialize)]
pub(super) struct LocationPreset {
    name: &'static str,
    latitude: f64,
    longitude: f64,
}

const LOCATION_PRESETS: [LocationPreset; 5] = [
    LocationPreset {
        name: "San Francisco",
        latitude: 37.7749,
        longitude: -122.4194,
    },
    LocationPreset {
        name: "New York",
        latitude: 40.7128,
        longitude: -74.0060,
    },
    LocationPreset {
        name: "London",
        latitude: 51.5074,
        longitude: -0.1278,
    },
    LocationPreset {
        name: "Tokyo",
        latitude: 35.6762,
        longitude: 139.6503,
    },
    LocationPreset {
        name: "Sydney",
        latitude: -33.8688,
        longitude: 151.2093,
    },
];

pub(super) async fn location_set(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<LocationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !(-90.0..=90.0).contains(&req.latitude) || !(-180.0..=180.0).contains(&req.longitude) {
        return Err(ApiError(Error::Configuration(format!(
            "invalid coordinates ({}, {})",
            req.latitude, req.longitude
        ))));
    }
    let session = get_session(&state, &id)?;
    state
        .driver
        .set_location(&session.udid, req.latitude, req.longitude)
        .await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub(super) async fn location_clear(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = get_session(&state, &id)?;
    state.driver.clear_location(&session.udid).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub(super) async fn location_presets(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    get_session(&state, &id)?;
    Ok(Json(LOCATION_PRESETS))
}

// ---------------------------------------------------------------------------
// Media and files
// ---------------------------------------------------------------------------

async fn add_media_from_upload(
    state: &AppState,
    id: &str,
    mut multipart: Multipart,
) -> Result<usize, ApiError> {
    let session = get_session(state, id)?;
    let scratch = tempfile::tempdir().map_err(Error::Io)?;
    let mut paths = Vec::new();
    while let Some(path) = save_upload(&mut multipart, scratch.path()).await? {
        paths.push(path);
    }
    if paths.is_empty() {
        return Err(ApiError::bad_request("no media files in upload"));
    }
    let count = state.driver.add_media(&session.udid, &paths).await?;
    Ok(count)
}

pub(super) async fn media_photos_add(
    State(state): State<AppState>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let count = add_media_from_upload(&state, &id, multipart).await?;
    Ok(Json(serde_json::json!({ "count": count })))
}

pub(super) async fn media_videos_add(
    State(state): State<AppState>,
    Path(id): Path<String>,
    multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let count = add_media_from_upload(&state, &id, multipart).await?;
    Ok(Json(serde_json::json!({ "count": count })))
}

pub(super) async fn file_push(
    State(state): State<AppState>,
    Path(id): Path<String>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, ApiError> {
    let session = get_session(&state, &id)?;
    let scratch = tempfile::tempdir().map_err(Error::Io)?;

    let mut file: Option<PathBuf> = None;
    let mut device_path: Option<String> = None;
    let mut bundle_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("device_path") => {
                device_path = Some(field.text().await.map_err(|e| {
                    ApiError::bad_request(format!("unreadable device_path: {}", e))
                })?);
            }
            Some("bundle_id") => {
                bundle_id = Some(field.text().await.map_err(|e| {
                    ApiError::bad_request(format!("unreadable bundle_id: {}", e))
                })?);
            }
            _ => {
                if field.file_name().is_some() {
                    let filename = field
                        .file_name()
                        .map(sanitize_filename)
                        .unwrap_or_else(|| "upload.bin".to_string());
                    let bytes = field.bytes().await.map_err(|e| {
                        ApiError::bad_request(format!("upload read failed: {}", e))
                    })?;
                    let path = scratch.path().join(filename);
                    std::fs::write(&path, &bytes).map_err(Error::Io)?;
                    file = Some(path);
                }
            }
        }
    }

    let file = file.ok_or_else(|| ApiError::bad_request("no file in upload"))?;
    let device_path =
        device_path.ok_or_else(|| ApiError::bad_request("device_path is required"))?;
    let dest = state
        .driver
        .push_file(&session.udid, &file, &device_path, bundle_id.as_deref())
        .await?;
    let filename = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Ok(Json(serde_json::json!({ "filename": filename })))
}

#[derive(Deserialize)]
pub(super) struct FilePullRequest {
    device_path: String,
    bundle_id: Option<String>,
    filename: Option<String>,
}

pub(super) async fn file_pull(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<FilePullRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = get_session(&state, &id)?;
    let bytes = state
        .driver
        .pull_file(&session.udid, &req.device_path, req.bundle_id.as_deref())
        .await?;
    let filename = req.filename.unwrap_or_else(|| {
        std::path::Path::new(&req.device_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "file.bin".to_string())
    });
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", filename),
            ),
        ],
        bytes,
    ))
}

// ---------------------------------------------------------------------------
// Logs
// ---------------------------------------------------------------------------

pub(super) async fn log_processes(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = get_session(&state, &id)?;
    let processes = state.driver.list_processes(&session.udid).await?;
    Ok(Json(processes))
}

pub(super) async fn log_clear(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = get_session(&state, &id)?;
    state.driver.clear_logs(&session.udid).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

// ---------------------------------------------------------------------------
// Recording
// ---------------------------------------------------------------------------

pub(super) async fn recording_start(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let session = get_session(&state, &id)?;
    state.recording.start(&id, &session.udid).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

pub(super) async fn recording_stop(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    get_session(&state, &id)?;
    let bytes = state.recording.stop(&id).await?;
    Ok((
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}.mp4\"", id),
            ),
        ],
        bytes,
    ))
}

pub(super) async fn recording_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    get_session(&state, &id)?;
    Ok(Json(state.recording.status(&id)))
}

pub(super) async fn cleanup_recordings(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state.recording.cleanup_old();
    Ok(Json(serde_json::json!({ "removed": removed })))
}

// ---------------------------------------------------------------------------
// Health and stats
// ---------------------------------------------------------------------------

pub(super) async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "total_sessions": state.sessions.count(),
        "active_recordings": state.recording.active_count(),
        "total_connections": state.connections.stats().total_connections,
    }))
}

/// The operator's monitoring surface. Read-only by contract.
pub(super) async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    let resources = state.resources.stats();
    Json(serde_json::json!({
        "connections": state.connections.stats(),
        "resources": {
            "video_services": resources.video_services,
            "webrtc_services": resources.webrtc_services,
            "total_clients": resources.total_clients,
            "metrics": resources.metrics,
        },
        "memory": resources.memory,
        "sessions": {
            "total": state.sessions.count(),
        },
        "recordings": {
            "active": state.recording.active_count(),
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_directories() {
        assert_eq!(sanitize_filename("app.ipa"), "app.ipa");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("/tmp/x.ipa"), "x.ipa");
    }

    #[test]
    fn presets_are_valid_coordinates() {
        for preset in &LOCATION_PRESETS {
            assert!((-90.0..=90.0).contains(&preset.latitude), "{}", preset.name);
            assert!(
                (-180.0..=180.0).contains(&preset.longitude),
                "{}",
                preset.name
            );
        }
    }
}
