//! Connection authorization and tracking.
//!
//! Every transport connection reserves a slot here before doing anything
//! else. Registration enforces a sliding-window rate limit per
//! (session, source address) and a per-session connection cap, and returns an
//! RAII guard so the slot is released on every exit path, including panics
//! and abrupt socket closes. Registry entries hold only weak handles; a
//! periodic reaper removes entries whose connection vanished without
//! unregistering.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};

/// The transport kinds a connection can register as. Per-kind counts are
/// diagnostics only; the cap applies to the per-session total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionKind {
    Control,
    Video,
    UltraVideo,
    WebrtcSignaling,
    Screenshot,
    Logs,
}

impl ConnectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionKind::Control => "control",
            ConnectionKind::Video => "video",
            ConnectionKind::UltraVideo => "ultra_video",
            ConnectionKind::WebrtcSignaling => "webrtc_signaling",
            ConnectionKind::Screenshot => "screenshot",
            ConnectionKind::Logs => "logs",
        }
    }
}

/// Token pinned by a live connection. The registry holds only a `Weak` to it,
/// so a leaked socket cannot pin registry memory.
#[derive(Debug)]
pub struct ConnectionToken(());

#[derive(Debug)]
struct ConnEntry {
    kind: ConnectionKind,
    source: String,
    started_at: Instant,
    handle: Weak<ConnectionToken>,
}

/// RAII registration: dropping the guard unregisters the connection.
#[derive(Debug)]
pub struct ConnectionGuard {
    manager: ConnectionManager,
    session_id: String,
    token: Arc<ConnectionToken>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.manager.unregister(&self.session_id, &self.token);
    }
}

#[derive(Debug, Serialize)]
pub struct SessionConnectionStats {
    pub total: usize,
    pub by_kind: HashMap<&'static str, usize>,
    pub distinct_sources: usize,
    pub oldest_connection_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct ConnectionStats {
    pub total_sessions: usize,
    pub total_connections: usize,
    pub sessions: HashMap<String, SessionConnectionStats>,
    pub rate_limit_buckets: usize,
}

#[derive(Debug)]
struct ConnInner {
    max_per_session: usize,
    max_per_window: usize,
    window: Duration,
    registry: Mutex<HashMap<String, Vec<ConnEntry>>>,
    buckets: Mutex<HashMap<(String, String), Vec<Instant>>>,
}

#[derive(Clone, Debug)]
pub struct ConnectionManager {
    inner: Arc<ConnInner>,
}

impl ConnectionManager {
    pub fn new(max_per_session: usize, max_per_window: usize, window: Duration) -> Self {
        Self {
            inner: Arc::new(ConnInner {
                max_per_session,
                max_per_window,
                window,
                registry: Mutex::new(HashMap::new()),
                buckets: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Reserve a connection slot.
    ///
    /// Checks the rate limit first, then the per-session cap; the two denials
    /// carry distinct error kinds so clients can tell them apart. On success
    /// the returned guard must live as long as the connection.
    pub fn try_register(
        &self,
        session_id: &str,
        kind: ConnectionKind,
        source: &str,
    ) -> Result<ConnectionGuard> {
        if !self.admit_rate(session_id, source) {
            tracing::warn!(session = %session_id, %source, "connection rate limit exceeded");
            return Err(Error::RateLimited(format!(
                "too many connection attempts from {}",
                source
            )));
        }

        let token = Arc::new(ConnectionToken(()));
        {
            let mut registry = self.inner.registry.lock();
            let entries = registry.entry(session_id.to_string()).or_default();
            entries.retain(|e| e.handle.strong_count() > 0);
            if entries.len() >= self.inner.max_per_session {
                tracing::warn!(session = %session_id, "connection cap exceeded");
                return Err(Error::CapExceeded(format!(
                    "session {} already has {} connections",
                    session_id,
                    entries.len()
                )));
            }
            entries.push(ConnEntry {
                kind,
                source: source.to_string(),
                started_at: Instant::now(),
                handle: Arc::downgrade(&token),
            });
        }

        tracing::debug!(session = %session_id, kind = kind.as_str(), %source, "connection registered");
        Ok(ConnectionGuard {
            manager: self.clone(),
            session_id: session_id.to_string(),
            token,
        })
    }

    /// Sliding-window admission per (session, source). Prunes expired
    /// timestamps on every attempt and records admitted ones.
    fn admit_rate(&self, session_id: &str, source: &str) -> bool {
        let key = (session_id.to_string(), source.to_string());
        let now = Instant::now();
        let mut buckets = self.inner.buckets.lock();
        let bucket = buckets.entry(key).or_default();
        bucket.retain(|t| now.duration_since(*t) < self.inner.window);
        if bucket.len() >= self.inner.max_per_window {
            return false;
        }
        bucket.push(now);
        true
    }

    fn unregister(&self, session_id: &str, token: &Arc<ConnectionToken>) {
        let mut registry = self.inner.registry.lock();
        if let Some(entries) = registry.get_mut(session_id) {
            let target = Arc::downgrade(token);
            entries.retain(|e| !Weak::ptr_eq(&e.handle, &target) && e.handle.strong_count() > 0);
            if entries.is_empty() {
                registry.remove(session_id);
            }
        }
    }

    /// Remove entries whose weak handle no longer resolves, and empty rate
    /// buckets. Run periodically by the server.
    pub fn reap(&self) {
        let mut removed = 0usize;
        {
            let mut registry = self.inner.registry.lock();
            registry.retain(|_, entries| {
                let before = entries.len();
                entries.retain(|e| e.handle.strong_count() > 0);
                removed += before - entries.len();
                !entries.is_empty()
            });
        }
        {
            let now = Instant::now();
            let mut buckets = self.inner.buckets.lock();
            buckets.retain(|_, bucket| {
                bucket.retain(|t| now.duration_since(*t) < self.inner.window);
                !bucket.is_empty()
            });
        }
        if removed > 0 {
            tracing::debug!(removed, "reaped dead connection entries");
        }
    }

    /// Live connection count for one session.
    pub fn session_count(&self, session_id: &str) -> usize {
        self.inner
            .registry
            .lock()
            .get(session_id)
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.handle.strong_count() > 0)
                    .count()
            })
            .unwrap_or(0)
    }

    /// Full live state for the monitoring surface. Read-only.
    pub fn stats(&self) -> ConnectionStats {
        let registry = self.inner.registry.lock();
        let mut sessions = HashMap::new();
        let mut total_connections = 0usize;
        for (session_id, entries) in registry.iter() {
            let live: Vec<&ConnEntry> = entries
                .iter()
                .filter(|e| e.handle.strong_count() > 0)
                .collect();
            if live.is_empty() {
                continue;
            }
            let mut by_kind: HashMap<&'static str, usize> = HashMap::new();
            let mut sources: Vec<&str> = Vec::new();
            let mut oldest = Duration::ZERO;
            for entry in &live {
                *by_kind.entry(entry.kind.as_str()).or_default() += 1;
                if !sources.contains(&entry.source.as_str()) {
                    sources.push(&entry.source);
                }
                oldest = oldest.max(entry.started_at.elapsed());
            }
            total_connections += live.len();
            sessions.insert(
                session_id.clone(),
                SessionConnectionStats {
                    total: live.len(),
                    by_kind,
                    distinct_sources: sources.len(),
                    oldest_connection_secs: oldest.as_secs(),
                },
            );
        }
        ConnectionStats {
            total_sessions: sessions.len(),
            total_connections,
            sessions,
            rate_limit_buckets: self.inner.buckets.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(cap: usize, per_window: usize) -> ConnectionManager {
        ConnectionManager::new(cap, per_window, Duration::from_secs(60))
    }

    #[test]
    fn register_and_drop_releases_slot() {
        let mgr = manager(10, 20);
        let guard = mgr
            .try_register("s1", ConnectionKind::Video, "10.0.0.1")
            .unwrap();
        assert_eq!(mgr.session_count("s1"), 1);
        drop(guard);
        assert_eq!(mgr.session_count("s1"), 0);
    }

    #[test]
    fn cap_rejects_next_connection_and_keeps_existing() {
        let mgr = manager(10, 100);
        let guards: Vec<_> = (0..10)
            .map(|i| {
                mgr.try_register("s1", ConnectionKind::Video, &format!("10.0.0.{}", i))
                    .unwrap()
            })
            .collect();

        let err = mgr
            .try_register("s1", ConnectionKind::Control, "10.0.0.99")
            .unwrap_err();
        assert_eq!(err.kind(), "cap-exceeded");
        // The previous ten remain live.
        assert_eq!(mgr.session_count("s1"), 10);
        drop(guards);
        assert_eq!(mgr.session_count("s1"), 0);
    }

    #[test]
    fn cap_is_per_session() {
        let mgr = manager(1, 100);
        let _a = mgr
            .try_register("s1", ConnectionKind::Video, "10.0.0.1")
            .unwrap();
        // Another session is unaffected by s1's cap.
        let b = mgr.try_register("s2", ConnectionKind::Video, "10.0.0.1");
        assert!(b.is_ok());
    }

    #[test]
    fn rate_limit_rejects_21st_within_window() {
        let mgr = manager(100, 20);
        let mut guards = Vec::new();
        for _ in 0..20 {
            guards.push(
                mgr.try_register("s1", ConnectionKind::Video, "10.0.0.1")
                    .unwrap(),
            );
        }
        let err = mgr
            .try_register("s1", ConnectionKind::Video, "10.0.0.1")
            .unwrap_err();
        assert_eq!(err.kind(), "rate-limited");
        assert_eq!(mgr.session_count("s1"), 20);
    }

    #[test]
    fn rate_limit_is_per_source() {
        let mgr = manager(100, 2);
        let _a = mgr
            .try_register("s1", ConnectionKind::Video, "10.0.0.1")
            .unwrap();
        let _b = mgr
            .try_register("s1", ConnectionKind::Video, "10.0.0.1")
            .unwrap();
        assert!(mgr
            .try_register("s1", ConnectionKind::Video, "10.0.0.1")
            .is_err());
        // A different source address is not throttled.
        assert!(mgr
            .try_register("s1", ConnectionKind::Video, "10.0.0.2")
            .is_ok());
    }

    #[test]
    fn rate_limit_window_expires() {
        let mgr = ConnectionManager::new(100, 1, Duration::from_millis(20));
        let _a = mgr
            .try_register("s1", ConnectionKind::Video, "10.0.0.1")
            .unwrap();
        assert!(mgr
            .try_register("s1", ConnectionKind::Video, "10.0.0.1")
            .is_err());
        std::thread::sleep(Duration::from_millis(40));
        assert!(mgr
            .try_register("s1", ConnectionKind::Video, "10.0.0.1")
            .is_ok());
    }

    #[test]
    fn rate_buckets_stay_bounded() {
        let mgr = manager(100, 5);
        for _ in 0..5 {
            // Dropped guards; timestamps stay in the window.
            let _ = mgr.try_register("s1", ConnectionKind::Video, "10.0.0.1");
        }
        // Denied attempts don't grow the bucket past the cap.
        let _ = mgr.try_register("s1", ConnectionKind::Video, "10.0.0.1");
        let stats = mgr.stats();
        assert_eq!(stats.rate_limit_buckets, 1);
    }

    #[test]
    fn reap_clears_expired_buckets_and_dead_entries() {
        let mgr = ConnectionManager::new(10, 5, Duration::from_millis(10));
        let guard = mgr
            .try_register("s1", ConnectionKind::Logs, "10.0.0.1")
            .unwrap();
        drop(guard);
        std::thread::sleep(Duration::from_millis(20));
        mgr.reap();
        let stats = mgr.stats();
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.total_sessions, 0);
        assert_eq!(stats.rate_limit_buckets, 0);
    }

    #[test]
    fn stats_break_down_by_kind() {
        let mgr = manager(10, 100);
        let _a = mgr
            .try_register("s1", ConnectionKind::Video, "10.0.0.1")
            .unwrap();
        let _b = mgr
            .try_register("s1", ConnectionKind::Video, "10.0.0.2")
            .unwrap();
        let _c = mgr
            .try_register("s1", ConnectionKind::Control, "10.0.0.1")
            .unwrap();

        let stats = mgr.stats();
        assert_eq!(stats.total_sessions, 1);
        assert_eq!(stats.total_connections, 3);
        let s1 = &stats.sessions["s1"];
        assert_eq!(s1.total, 3);
        assert_eq!(s1.by_kind["video"], 2);
        assert_eq!(s1.by_kind["control"], 1);
    }
}
