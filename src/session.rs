//! Session identity and lifecycle.
//!
//! The `SessionManager` is the sole authority over session records: it
//! allocates identifiers, asks the host driver to create and boot devices,
//! persists every mutation through the `SessionStore`, and reconciles the
//! store against live devices on startup.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::driver::devices::DeviceState;
use crate::driver::HostDriver;
use crate::error::{Error, Result};
use crate::resources::ResourceManager;
use crate::store::SessionStore;

/// A server-managed handle to a single simulator device.
///
/// Invariants: the UDID referenced an existing device at creation time;
/// point and pixel dimensions are strictly positive; the scale factor is
/// 1, 2, or 3; session identifiers are never reused.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub udid: String,
    pub device_name: String,
    pub device_type: String,
    pub ios_version: String,
    pub runtime_identifier: String,
    pub state: String,
    pub point_width: u32,
    pub point_height: u32,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub scale_factor: u32,
    /// Unix seconds.
    pub created_at: u64,
    pub last_validated_at: u64,
    pub pid: Option<u32>,
    #[serde(default)]
    pub installed_apps: HashMap<String, InstalledApp>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstalledApp {
    pub bundle_id: String,
    pub app_name: String,
    pub installed_at: u64,
}

/// Device types and OS versions available on the host.
#[derive(Debug, Serialize)]
pub struct Configurations {
    pub device_types: Vec<String>,
    pub os_versions: Vec<String>,
}

pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_session_id() -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(32)
        .map(char::from)
        .collect()
}

struct ManagerInner {
    driver: Arc<HostDriver>,
    store: SessionStore,
    sessions: RwLock<HashMap<String, Session>>,
    /// Serializes mutate-then-persist sequences; reads go through the
    /// in-memory snapshot without touching this.
    write_lock: tokio::sync::Mutex<()>,
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<ManagerInner>,
}

impl SessionManager {
    /// Build a manager over an opened store, loading persisted records.
    pub fn new(driver: Arc<HostDriver>, store: SessionStore) -> Self {
        let sessions = store.load();
        if !sessions.is_empty() {
            tracing::info!(count = sessions.len(), "loaded persisted sessions");
        }
        Self {
            inner: Arc::new(ManagerInner {
                driver,
                store,
                sessions: RwLock::new(sessions),
                write_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Startup protocol: validate every persisted record against live
    /// devices, drop the dead ones, then recover orphaned booted simulators.
    /// Per-record failures are non-fatal.
    pub async fn startup(&self) {
        let loaded = self.inner.sessions.read().len();

        let devices = match self.inner.driver.list_devices().await {
            Ok(devices) => devices,
            Err(e) => {
                tracing::error!(error = %e, "device enumeration failed during startup; keeping persisted records");
                return;
            }
        };

        let mut dropped = 0usize;
        {
            let _write = self.inner.write_lock.lock().await;
            let mut sessions = self.inner.sessions.write();
            sessions.retain(|id, session| {
                match devices.iter().find(|d| d.udid == session.udid) {
                    Some(device) => {
                        session.state = device.state.as_str().to_string();
                        session.last_validated_at = now_secs();
                        true
                    }
                    None => {
                        tracing::warn!(session = %id, udid = %session.udid, "persisted session has no live device, dropping");
                        dropped += 1;
                        false
                    }
                }
            });
        }

        let recovered = match self.recover_orphaned().await {
            Ok(recovered) => recovered.len(),
            Err(e) => {
                tracing::error!(error = %e, "orphan recovery failed");
                0
            }
        };

        if dropped > 0 {
            self.persist().await;
        }
        tracing::info!(
            loaded,
            valid = loaded - dropped,
            recovered,
            "session startup reconciliation complete; recovered {} orphaned session(s)",
            recovered
        );
    }

    /// Device types and OS versions available for `create`.
    pub async fn configurations(&self) -> Result<Configurations> {
        let device_types = self.inner.driver.device_types().await?;
        let runtimes = self.inner.driver.runtimes().await?;
        Ok(Configurations {
            device_types: device_types.into_keys().collect(),
            os_versions: runtimes.into_keys().collect(),
        })
    }

    /// Create a device, boot it, record dimensions, and persist the session.
    pub async fn create(&self, device_type: &str, ios_version: &str) -> Result<Session> {
        let driver = &self.inner.driver;

        let device_types = driver.device_types().await?;
        let device_type_id = device_types.get(device_type).ok_or_else(|| {
            Error::Configuration(format!("device type '{}' not available", device_type))
        })?;
        let runtimes = driver.runtimes().await?;
        let runtime_id = runtimes.get(ios_version).ok_or_else(|| {
            Error::Configuration(format!("iOS version '{}' not available", ios_version))
        })?;

        let session_id = generate_session_id();
        let device_name = format!(
            "sim-{}-{}",
            &session_id[..8],
            device_type.replace(' ', "-")
        );

        tracing::info!(%device_name, device_type, ios_version, "creating simulator");
        let udid = driver
            .create_device(&device_name, device_type_id, runtime_id)
            .await?;

        if let Err(e) = driver.boot(&udid).await {
            tracing::error!(%udid, error = %e, "boot failed, deleting device");
            let _ = driver.delete_device(&udid).await;
            return Err(e);
        }

        let dims = driver.device_dimensions(&udid).await;
        let pid = driver.simulator_pid(&udid).await;

        let session = Session {
            session_id: session_id.clone(),
            udid,
            device_name,
            device_type: device_type.to_string(),
            ios_version: ios_version.to_string(),
            runtime_identifier: runtime_id.clone(),
            state: DeviceState::Booted.as_str().to_string(),
            point_width: dims.point_width,
            point_height: dims.point_height,
            pixel_width: dims.pixel_width,
            pixel_height: dims.pixel_height,
            scale_factor: dims.scale_factor,
            created_at: now_secs(),
            last_validated_at: now_secs(),
            pid,
            installed_apps: HashMap::new(),
        };

        {
            let _write = self.inner.write_lock.lock().await;
            self.inner
                .sessions
                .write()
                .insert(session_id.clone(), session.clone());
        }
        self.persist().await;

        tracing::info!(session = %session_id, udid = %session.udid, "session created");
        Ok(session)
    }

    pub fn get(&self, session_id: &str) -> Option<Session> {
        self.inner.sessions.read().get(session_id).cloned()
    }

    pub fn udid_of(&self, session_id: &str) -> Option<String> {
        self.inner
            .sessions
            .read()
            .get(session_id)
            .map(|s| s.udid.clone())
    }

    /// Snapshot of all sessions whose devices still exist on the host.
    pub async fn list(&self) -> Vec<Session> {
        let snapshot: Vec<Session> = self.inner.sessions.read().values().cloned().collect();
        match self.inner.driver.list_devices().await {
            Ok(devices) => snapshot
                .into_iter()
                .filter(|s| devices.iter().any(|d| d.udid == s.udid))
                .collect(),
            // Enumeration failure should not make sessions vanish from view.
            Err(_) => snapshot,
        }
    }

    /// Number of sessions currently tracked, without touching the driver.
    pub fn count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    /// Cross-check a session's UDID against the live device list. Updates
    /// state, pid, and the validation timestamp on success.
    pub async fn validate(&self, session_id: &str) -> Result<bool> {
        let udid = match self.udid_of(session_id) {
            Some(udid) => udid,
            None => return Ok(false),
        };
        let device = self.inner.driver.find_device(&udid).await?;
        match device {
            Some(device) => {
                let pid = self.inner.driver.simulator_pid(&udid).await;
                {
                    let _write = self.inner.write_lock.lock().await;
                    if let Some(session) = self.inner.sessions.write().get_mut(session_id) {
                        session.state = device.state.as_str().to_string();
                        session.pid = pid;
                        session.last_validated_at = now_secs();
                    }
                }
                self.persist().await;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Delete a session: detach capture services, shut down and remove the
    /// device, drop the record.
    pub async fn delete(&self, session_id: &str, resources: &ResourceManager) -> Result<()> {
        let session = self
            .get(session_id)
            .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))?;

        resources.detach_device(&session.udid).await;

        if let Err(e) = self.inner.driver.shutdown(&session.udid).await {
            tracing::warn!(udid = %session.udid, error = %e, "shutdown during delete failed");
        }
        if let Some(pid) = session.pid {
            // The simulator process occasionally survives shutdown.
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
        if let Err(e) = self.inner.driver.delete_device(&session.udid).await {
            tracing::warn!(udid = %session.udid, error = %e, "device delete failed");
        }
        self.inner.driver.release_device_lock(&session.udid);

        {
            let _write = self.inner.write_lock.lock().await;
            self.inner.sessions.write().remove(session_id);
        }
        self.persist().await;
        tracing::info!(session = %session_id, udid = %session.udid, "session deleted");
        Ok(())
    }

    /// Delete every session, returning how many were removed.
    pub async fn delete_all(&self, resources: &ResourceManager) -> usize {
        let ids: Vec<String> = self.inner.sessions.read().keys().cloned().collect();
        let mut deleted = 0usize;
        for id in ids {
            if self.delete(&id, resources).await.is_ok() {
                deleted += 1;
            }
        }
        deleted
    }

    /// Synthesize sessions for booted devices no record covers. Idempotent:
    /// running it twice with no external change creates nothing new.
    pub async fn recover_orphaned(&self) -> Result<Vec<Session>> {
        let booted = self.inner.driver.list_booted().await?;
        let known: Vec<String> = self
            .inner
            .sessions
            .read()
            .values()
            .map(|s| s.udid.clone())
            .collect();

        let mut recovered = Vec::new();
        for device in booted {
            if known.contains(&device.udid) {
                continue;
            }
            let session_id = generate_session_id();
            let dims = self.inner.driver.device_dimensions(&device.udid).await;
            let pid = self.inner.driver.simulator_pid(&device.udid).await;
            let ios_version = device
                .runtime
                .strip_prefix("iOS ")
                .unwrap_or(&device.runtime)
                .to_string();
            let session = Session {
                session_id: session_id.clone(),
                udid: device.udid.clone(),
                device_name: device.name.clone(),
                device_type: device.name.clone(),
                ios_version,
                runtime_identifier: device.runtime.clone(),
                state: device.state.as_str().to_string(),
                point_width: dims.point_width,
                point_height: dims.point_height,
                pixel_width: dims.pixel_width,
                pixel_height: dims.pixel_height,
                scale_factor: dims.scale_factor,
                created_at: now_secs(),
                last_validated_at: now_secs(),
                pid,
                installed_apps: HashMap::new(),
            };
            tracing::info!(session = %session_id, udid = %device.udid, "recovered orphaned simulator");
            {
                let _write = self.inner.write_lock.lock().await;
                self.inner
                    .sessions
                    .write()
                    .insert(session_id, session.clone());
            }
            recovered.push(session);
        }
        if !recovered.is_empty() {
            self.persist().await;
        }
        Ok(recovered)
    }

    /// Revalidate every record, removing those whose device is gone.
    /// Returns the surviving sessions.
    pub async fn refresh(&self) -> Result<Vec<Session>> {
        let devices = self.inner.driver.list_devices().await?;
        let mut removed = 0usize;
        {
            let _write = self.inner.write_lock.lock().await;
            let mut sessions = self.inner.sessions.write();
            sessions.retain(|id, session| {
                let alive = devices.iter().any(|d| d.udid == session.udid);
                if !alive {
                    tracing::warn!(session = %id, udid = %session.udid, "removing invalid session");
                    removed += 1;
                }
                alive
            });
        }
        if removed > 0 {
            self.persist().await;
        }
        Ok(self.inner.sessions.read().values().cloned().collect())
    }

    /// Record an app installation against a session and persist.
    pub async fn record_installed_app(
        &self,
        session_id: &str,
        bundle_id: &str,
        app_name: &str,
    ) -> Result<()> {
        {
            let _write = self.inner.write_lock.lock().await;
            let mut sessions = self.inner.sessions.write();
            let session = sessions
                .get_mut(session_id)
                .ok_or_else(|| Error::NotFound(format!("session {}", session_id)))?;
            session.installed_apps.insert(
                bundle_id.to_string(),
                InstalledApp {
                    bundle_id: bundle_id.to_string(),
                    app_name: app_name.to_string(),
                    installed_at: now_secs(),
                },
            );
        }
        self.persist().await;
        Ok(())
    }

    /// Drop an app from a session's installed map and persist.
    pub async fn record_uninstalled_app(&self, session_id: &str, bundle_id: &str) {
        let removed = {
            let _write = self.inner.write_lock.lock().await;
            self.inner
                .sessions
                .write()
                .get_mut(session_id)
                .map(|s| s.installed_apps.remove(bundle_id).is_some())
                .unwrap_or(false)
        };
        if removed {
            self.persist().await;
        }
    }

    /// Insert a record directly, bypassing device creation. Test seam only.
    #[cfg(test)]
    pub fn insert_for_tests(&self, session: Session) {
        self.inner
            .sessions
            .write()
            .insert(session.session_id.clone(), session);
    }

    /// Write the current snapshot through the store. Failures are logged,
    /// never fatal: the in-memory state remains authoritative.
    pub async fn persist(&self) {
        let snapshot = self.inner.sessions.read().clone();
        if let Err(e) = self.inner.store.save(&snapshot) {
            tracing::error!(error = %e, "failed to persist session store");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique_and_opaque() {
        let a = generate_session_id();
        let b = generate_session_id();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn session_serde_roundtrip() {
        let mut apps = HashMap::new();
        apps.insert(
            "com.example.demo".to_string(),
            InstalledApp {
                bundle_id: "com.example.demo".to_string(),
                app_name: "Demo".to_string(),
                installed_at: 1_700_000_123,
            },
        );
        let session = Session {
            session_id: "abc".to_string(),
            udid: "UDID-1".to_string(),
            device_name: "sim-abc".to_string(),
            device_type: "iPhone 15 Pro".to_string(),
            ios_version: "17.0".to_string(),
            runtime_identifier: "com.apple.CoreSimulator.SimRuntime.iOS-17-0".to_string(),
            state: "Booted".to_string(),
            point_width: 393,
            point_height: 852,
            pixel_width: 1179,
            pixel_height: 2556,
            scale_factor: 3,
            created_at: 1,
            last_validated_at: 2,
            pid: None,
            installed_apps: apps,
        };
        let json = serde_json::to_string(&session).unwrap();
        let back: Session = serde_json::from_str(&json).unwrap();
        assert_eq!(back.session_id, "abc");
        assert_eq!(back.installed_apps.len(), 1);
        assert_eq!(back.scale_factor, 3);
    }

    #[test]
    fn legacy_document_without_apps_field_decodes() {
        let json = r#"{
            "session_id": "abc", "udid": "U", "device_name": "n",
            "device_type": "iPhone 15 Pro", "ios_version": "17.0",
            "runtime_identifier": "r", "state": "Booted",
            "point_width": 393, "point_height": 852,
            "pixel_width": 1179, "pixel_height": 2556, "scale_factor": 3,
            "created_at": 1, "last_validated_at": 2, "pid": null
        }"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert!(session.installed_apps.is_empty());
    }
}
