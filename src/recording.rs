//! Per-session MP4 recording.
//!
//! Each recording is a child process writing to a scratch directory under
//! the state dir. A normal stop signals the child, waits for it to finalize
//! the file, streams the bytes to the caller, and removes the scratch. On
//! server shutdown every active recording is stopped with a longer grace and
//! the file is moved to a durable emergency directory, even if truncated.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::session::now_secs;

/// Grace period for the recorder to finalize the file after SIGTERM.
const STOP_GRACE: Duration = Duration::from_secs(10);
/// Longer grace used during emergency save on shutdown.
const EMERGENCY_GRACE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordingState {
    Idle,
    Recording,
}

#[derive(Debug, Serialize)]
pub struct RecordingStatus {
    pub state: RecordingState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
}

struct ActiveRecording {
    child: tokio::process::Child,
    pid: Option<u32>,
    path: PathBuf,
    scratch_dir: PathBuf,
    started_at: u64,
}

struct RecordingInner {
    recordings_dir: PathBuf,
    emergency_dir: PathBuf,
    emergency_max_age: Duration,
    active: Mutex<HashMap<String, ActiveRecording>>,
}

#[derive(Clone)]
pub struct RecordingService {
    inner: Arc<RecordingInner>,
}

impl RecordingService {
    pub fn new(
        recordings_dir: PathBuf,
        emergency_dir: PathBuf,
        emergency_max_age: Duration,
    ) -> Result<Self> {
        std::fs::create_dir_all(&recordings_dir)?;
        std::fs::create_dir_all(&emergency_dir)?;
        Ok(Self {
            inner: Arc::new(RecordingInner {
                recordings_dir,
                emergency_dir,
                emergency_max_age,
                active: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Start recording a session's device. Fails with `bad-state` if a
    /// recording is already active for the session.
    pub async fn start(&self, session_id: &str, udid: &str) -> Result<()> {
        if self.inner.active.lock().contains_key(session_id) {
            return Err(Error::BadState(format!(
                "recording already active for session {}",
                session_id
            )));
        }

        let scratch_dir = self.inner.recordings_dir.join(session_id);
        std::fs::create_dir_all(&scratch_dir)?;
        let path = scratch_dir.join("recording.mp4");
        let path_str = path.to_string_lossy().to_string();

        let mut child = tokio::process::Command::new("idb")
            .args(["record-video", &path_str, "--udid", udid])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::HostDriver(format!("failed to spawn recorder: {}", e)))?;

        // Give the recorder a moment; an immediate exit means it never
        // started writing.
        tokio::time::sleep(Duration::from_millis(500)).await;
        if let Ok(Some(status)) = child.try_wait() {
            let _ = std::fs::remove_dir_all(&scratch_dir);
            return Err(Error::HostDriver(format!(
                "recorder exited immediately (exit {:?})",
                status.code()
            )));
        }

        let pid = child.id();
        self.inner.active.lock().insert(
            session_id.to_string(),
            ActiveRecording {
                child,
                pid,
                path,
                scratch_dir,
                started_at: now_secs(),
            },
        );
        tracing::info!(session = %session_id, %udid, "recording started");
        Ok(())
    }

    /// Stop a recording and return the MP4 bytes. The scratch directory is
    /// removed after a successful read.
    pub async fn stop(&self, session_id: &str) -> Result<Vec<u8>> {
        let recording = self
            .inner
            .active
            .lock()
            .remove(session_id)
            .ok_or_else(|| {
                Error::BadState(format!("no recording active for session {}", session_id))
            })?;

        let mut recording = recording;
        terminate_child(&mut recording, STOP_GRACE).await;

        let bytes = std::fs::read(&recording.path).map_err(|e| {
            let _ = std::fs::remove_dir_all(&recording.scratch_dir);
            Error::HostDriver(format!("recording file unreadable: {}", e))
        })?;
        if bytes.is_empty() {
            let _ = std::fs::remove_dir_all(&recording.scratch_dir);
            return Err(Error::HostDriver("recording file is empty".into()));
        }
        let _ = std::fs::remove_dir_all(&recording.scratch_dir);
        tracing::info!(session = %session_id, bytes = bytes.len(), "recording stopped");
        Ok(bytes)
    }

    pub fn status(&self, session_id: &str) -> RecordingStatus {
        match self.inner.active.lock().get(session_id) {
            Some(recording) => RecordingStatus {
                state: RecordingState::Recording,
                started_at: Some(recording.started_at),
            },
            None => RecordingStatus {
                state: RecordingState::Idle,
                started_at: None,
            },
        }
    }

    /// Stop every active recording and move the files, truncated or not,
    /// into the emergency directory, named by session and timestamp.
    pub async fn emergency_stop_all(&self) {
        let drained: Vec<(String, ActiveRecording)> = {
            let mut active = self.inner.active.lock();
            active.drain().collect()
        };
        for (session_id, mut recording) in drained {
            tracing::warn!(session = %session_id, "emergency-saving recording on shutdown");
            terminate_child(&mut recording, EMERGENCY_GRACE).await;

            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let dest = self
                .inner
                .emergency_dir
                .join(format!("{}-{}.mp4", session_id, timestamp));
            match std::fs::rename(&recording.path, &dest) {
                Ok(()) => {
                    tracing::warn!(session = %session_id, path = %dest.display(), "emergency recording saved");
                }
                Err(e) => {
                    tracing::error!(session = %session_id, error = %e, "failed to move emergency recording");
                }
            }
            let _ = std::fs::remove_dir_all(&recording.scratch_dir);
        }
    }

    /// Remove emergency recordings older than the configured age.
    /// Returns how many files were deleted.
    pub fn cleanup_old(&self) -> usize {
        let mut removed = 0usize;
        let entries = match std::fs::read_dir(&self.inner.emergency_dir) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };
        let now = SystemTime::now();
        for entry in entries.flatten() {
            let Ok(meta) = entry.metadata() else { continue };
            let Ok(modified) = meta.modified() else { continue };
            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age > self.inner.emergency_max_age && std::fs::remove_file(entry.path()).is_ok() {
                tracing::info!(path = %entry.path().display(), "removed old emergency recording");
                removed += 1;
            }
        }
        removed
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.lock().len()
    }
}

/// SIGTERM, wait up to `grace` for the recorder to finalize, then SIGKILL.
async fn terminate_child(recording: &mut ActiveRecording, grace: Duration) {
    if let Some(pid) = recording.pid {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    match tokio::time::timeout(grace, recording.child.wait()).await {
        Ok(Ok(status)) => {
            tracing::debug!(?status, "recorder exited");
        }
        Ok(Err(e)) => {
            tracing::warn!(error = %e, "error waiting for recorder");
        }
        Err(_) => {
            tracing::warn!("recorder ignored SIGTERM, killing");
            let _ = recording.child.start_kill();
            let _ = recording.child.wait().await;
        }
    }
}
