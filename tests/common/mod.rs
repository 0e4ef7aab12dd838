use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use simbridge::api::AppState;
use simbridge::capture::Quality;
use simbridge::config::Config;
use simbridge::connections::ConnectionManager;
use simbridge::driver::HostDriver;
use simbridge::recording::RecordingService;
use simbridge::resources::ResourceManager;
use simbridge::session::{Session, SessionManager};
use simbridge::store::SessionStore;

/// A plausible session record for seeding stores in tests.
pub fn sample_session(id: &str, udid: &str) -> Session {
    Session {
        session_id: id.to_string(),
        udid: udid.to_string(),
        device_name: format!("sim-{}", id),
        device_type: "iPhone 15 Pro".to_string(),
        ios_version: "17.0".to_string(),
        runtime_identifier: "com.apple.CoreSimulator.SimRuntime.iOS-17-0".to_string(),
        state: "Booted".to_string(),
        point_width: 393,
        point_height: 852,
        pixel_width: 1179,
        pixel_height: 2556,
        scale_factor: 3,
        created_at: 1_700_000_000,
        last_validated_at: 1_700_000_000,
        pid: Some(4242),
        installed_apps: HashMap::new(),
    }
}

/// Write session records to disk the way a previous server run would have.
pub fn seed_store(state_dir: &Path, sessions: &[Session]) {
    let store = SessionStore::open(state_dir, 5).unwrap();
    let map: HashMap<String, Session> = sessions
        .iter()
        .map(|s| (s.session_id.clone(), s.clone()))
        .collect();
    store.save(&map).unwrap();
}

/// Build a full AppState over the given state dir. Loads whatever the store
/// holds; never touches a real simulator unless a handler calls the driver.
pub fn make_state(state_dir: &Path) -> AppState {
    let config = Config {
        state_dir: state_dir.to_path_buf(),
        ..Config::default()
    };
    let driver = Arc::new(HostDriver::new());
    let store = SessionStore::open(&config.state_dir, config.backup_retention_count).unwrap();
    let sessions = SessionManager::new(Arc::clone(&driver), store);
    let resources = ResourceManager::new(
        Duration::from_secs(config.service_idle_timeout_secs),
        config.max_memory_mb,
        Quality::High,
        config.default_fps,
    );
    let connections = ConnectionManager::new(
        config.max_connections_per_session,
        config.max_connections_per_minute,
        Duration::from_secs(config.rate_limit_window_seconds),
    );
    let recording = RecordingService::new(
        config.recordings_dir(),
        config.emergency_recordings_dir(),
        Duration::from_secs(config.emergency_recording_max_age_secs),
    )
    .unwrap();
    AppState {
        config: Arc::new(config),
        driver,
        sessions,
        resources,
        connections,
        recording,
    }
}
