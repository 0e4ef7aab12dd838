//! Ownership and budgeting of capture services.
//!
//! The resource manager is the sole owner of `VideoService` and
//! `WebRtcService` instances: services are created on first acquire,
//! reference-counted by client identifier, kept alive through an idle grace
//! window after the last client leaves, and evicted by the idle sweep or by
//! memory pressure. Services never hold a reference back to the manager.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, ProcessesToUpdate, System};

use crate::capture::{Quality, VideoService, WebRtcService};
use crate::error::{Error, Result};

/// At 80% of the memory cap, idle services are evicted early.
const MEMORY_SOFT_THRESHOLD: f64 = 0.8;
/// Emergency cleanup closes at most this many services per pass.
const EMERGENCY_CLEANUP_LIMIT: usize = 3;

struct PoolEntry<S> {
    service: S,
    clients: HashSet<String>,
    /// Set when the client set empties; cleared on re-acquire.
    idle_since: Option<Instant>,
}

impl<S> PoolEntry<S> {
    fn new(service: S) -> Self {
        Self {
            service,
            clients: HashSet::new(),
            idle_since: None,
        }
    }

    fn acquire(&mut self, client_id: &str) {
        self.clients.insert(client_id.to_string());
        self.idle_since = None;
    }

    fn release(&mut self, client_id: &str) {
        self.clients.remove(client_id);
        if self.clients.is_empty() {
            self.idle_since = Some(Instant::now());
        }
    }

    fn idle_for(&self) -> Option<Duration> {
        self.clients.is_empty().then(|| {
            self.idle_since
                .map(|t| t.elapsed())
                .unwrap_or(Duration::ZERO)
        })
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ResourceMetrics {
    pub services_created: u64,
    pub services_destroyed: u64,
    pub memory_cleanups: u64,
    pub client_connections: u64,
    pub client_disconnections: u64,
}

#[derive(Debug, Serialize)]
pub struct MemoryStats {
    pub rss_mb: f64,
    pub virtual_mb: f64,
    pub percent_of_limit: f64,
    pub limit_mb: u64,
}

#[derive(Debug, Serialize)]
pub struct ResourceStats {
    pub video_services: usize,
    pub webrtc_services: usize,
    pub total_clients: usize,
    pub metrics: ResourceMetrics,
    pub memory: MemoryStats,
}

struct ResourceInner {
    idle_timeout: Duration,
    max_memory_mb: u64,
    default_quality: Quality,
    default_fps: u32,
    video: Mutex<HashMap<String, PoolEntry<VideoService>>>,
    webrtc: Mutex<HashMap<String, PoolEntry<WebRtcService>>>,
    system: Mutex<System>,
    services_created: AtomicU64,
    services_destroyed: AtomicU64,
    memory_cleanups: AtomicU64,
    client_connections: AtomicU64,
    client_disconnections: AtomicU64,
}

#[derive(Clone)]
pub struct ResourceManager {
    inner: Arc<ResourceInner>,
}

impl ResourceManager {
    pub fn new(
        idle_timeout: Duration,
        max_memory_mb: u64,
        default_quality: Quality,
        default_fps: u32,
    ) -> Self {
        Self {
            inner: Arc::new(ResourceInner {
                idle_timeout,
                max_memory_mb,
                default_quality,
                default_fps,
                video: Mutex::new(HashMap::new()),
                webrtc: Mutex::new(HashMap::new()),
                system: Mutex::new(System::new()),
                services_created: AtomicU64::new(0),
                services_destroyed: AtomicU64::new(0),
                memory_cleanups: AtomicU64::new(0),
                client_connections: AtomicU64::new(0),
                client_disconnections: AtomicU64::new(0),
            }),
        }
    }

    /// Get or create the device's video service and register a client.
    pub fn video(
        &self,
        udid: &str,
        pixel_size: (u32, u32),
        client_id: &str,
    ) -> VideoService {
        let mut pool = self.inner.video.lock();
        let entry = pool.entry(udid.to_string()).or_insert_with(|| {
            tracing::info!(%udid, "creating video service");
            self.inner.services_created.fetch_add(1, Ordering::Relaxed);
            PoolEntry::new(VideoService::start(
                udid,
                pixel_size,
                self.inner.default_quality,
                self.inner.default_fps,
            ))
        });
        entry.acquire(client_id);
        self.inner
            .client_connections
            .fetch_add(1, Ordering::Relaxed);
        entry.service.clone()
    }

    /// Get or create the device's WebRTC service and register a client.
    ///
    /// The WebRTC service shares the device's frame pipeline: acquiring it
    /// also acquires the video service under the same client id.
    pub fn webrtc(
        &self,
        udid: &str,
        pixel_size: (u32, u32),
        client_id: &str,
    ) -> Result<WebRtcService> {
        let video = self.video(udid, pixel_size, client_id);

        let mut pool = self.inner.webrtc.lock();
        if !pool.contains_key(udid) {
            tracing::info!(%udid, "creating webrtc service");
            let service = WebRtcService::new(udid, video)?;
            self.inner.services_created.fetch_add(1, Ordering::Relaxed);
            pool.insert(udid.to_string(), PoolEntry::new(service));
        }
        let entry = pool.get_mut(udid).ok_or_else(|| {
            Error::Internal("webrtc pool entry vanished during creation".into())
        })?;
        entry.acquire(client_id);
        self.inner
            .client_connections
            .fetch_add(1, Ordering::Relaxed);
        Ok(entry.service.clone())
    }

    /// Drop a client from the video service. The service survives inside the
    /// idle grace window so quick reconnects skip capture startup cost.
    pub fn release_video(&self, udid: &str, client_id: &str) {
        if let Some(entry) = self.inner.video.lock().get_mut(udid) {
            entry.release(client_id);
            self.inner
                .client_disconnections
                .fetch_add(1, Ordering::Relaxed);
            if entry.clients.is_empty() {
                tracing::debug!(%udid, "video service entered idle grace window");
            }
        }
    }

    pub fn release_webrtc(&self, udid: &str, client_id: &str) {
        if let Some(entry) = self.inner.webrtc.lock().get_mut(udid) {
            entry.release(client_id);
            self.inner
                .client_disconnections
                .fetch_add(1, Ordering::Relaxed);
        }
        self.release_video(udid, client_id);
    }

    /// Stop and remove all services for one device, regardless of clients.
    /// Used when the session itself is deleted.
    pub async fn detach_device(&self, udid: &str) {
        let webrtc = self.inner.webrtc.lock().remove(udid);
        if let Some(entry) = webrtc {
            entry.service.shutdown().await;
            self.inner
                .services_destroyed
                .fetch_add(1, Ordering::Relaxed);
        }
        let video = self.inner.video.lock().remove(udid);
        if let Some(entry) = video {
            entry.service.shutdown();
            self.inner
                .services_destroyed
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Evict services whose idle grace window has expired.
    pub async fn sweep_idle(&self) {
        let timeout = self.inner.idle_timeout;
        let expired_video: Vec<(String, VideoService)> = {
            let mut pool = self.inner.video.lock();
            let expired: Vec<String> = pool
                .iter()
                .filter(|(_, e)| e.idle_for().is_some_and(|idle| idle > timeout))
                .map(|(udid, _)| udid.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|udid| pool.remove(&udid).map(|e| (udid, e.service)))
                .collect()
        };
        for (udid, service) in expired_video {
            tracing::info!(%udid, "evicting idle video service");
            service.shutdown();
            self.inner
                .services_destroyed
                .fetch_add(1, Ordering::Relaxed);
        }

        let expired_webrtc: Vec<(String, WebRtcService)> = {
            let mut pool = self.inner.webrtc.lock();
            let expired: Vec<String> = pool
                .iter()
                .filter(|(_, e)| e.idle_for().is_some_and(|idle| idle > timeout))
                .map(|(udid, _)| udid.clone())
                .collect();
            expired
                .into_iter()
                .filter_map(|udid| pool.remove(&udid).map(|e| (udid, e.service)))
                .collect()
        };
        for (udid, service) in expired_webrtc {
            tracing::info!(%udid, "evicting idle webrtc service");
            service.shutdown().await;
            self.inner
                .services_destroyed
                .fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Sample resident memory and react to pressure.
    ///
    /// At 80% of the cap the idle sweep runs early: zero-client services
    /// whose grace window has elapsed are evicted, with no count bound. At
    /// 100% up to three zero-client services are closed immediately, fewest
    /// clients first, grace window notwithstanding. A service with active
    /// clients is never force-closed.
    pub async fn check_memory(&self) {
        let stats = self.memory_stats();
        self.apply_memory_pressure(stats.rss_mb).await;
    }

    async fn apply_memory_pressure(&self, rss_mb: f64) {
        let limit_mb = self.inner.max_memory_mb as f64;
        let soft = limit_mb * MEMORY_SOFT_THRESHOLD;
        if rss_mb <= soft {
            return;
        }

        // Soft tier: the same eviction the periodic sweep performs, gated on
        // the idle grace window having elapsed.
        tracing::warn!(
            rss_mb,
            limit_mb = self.inner.max_memory_mb,
            "memory above soft threshold, running idle eviction early"
        );
        self.sweep_idle().await;
        self.inner.memory_cleanups.fetch_add(1, Ordering::Relaxed);

        // Critical tier: close zero-client services regardless of the grace
        // window, bounded per pass.
        if rss_mb > limit_mb {
            tracing::error!(
                rss_mb,
                limit_mb = self.inner.max_memory_mb,
                "memory above cap, emergency cleanup"
            );
            self.evict_zero_client_services(EMERGENCY_CLEANUP_LIMIT).await;
        }
    }

    /// Close up to `limit` zero-client services, fewest clients first,
    /// without waiting for the idle grace window. Emergency path only.
    async fn evict_zero_client_services(&self, limit: usize) {
        let mut candidates: Vec<(usize, String)> = {
            let pool = self.inner.video.lock();
            pool.iter()
                .filter(|(_, e)| e.clients.is_empty())
                .map(|(udid, e)| (e.clients.len(), udid.clone()))
                .collect()
        };
        candidates.sort_by_key(|(count, _)| *count);

        for (_, udid) in candidates.into_iter().take(limit) {
            tracing::error!(%udid, "emergency memory cleanup closing capture service");
            self.detach_device(&udid).await;
        }
    }

    /// Stop everything. Called during server shutdown.
    pub async fn cleanup_all(&self) {
        let udids: Vec<String> = {
            let video = self.inner.video.lock();
            let webrtc = self.inner.webrtc.lock();
            video.keys().chain(webrtc.keys()).cloned().collect()
        };
        for udid in udids {
            self.detach_device(&udid).await;
        }
    }

    /// Resident and virtual memory of this process against the cap.
    pub fn memory_stats(&self) -> MemoryStats {
        let mut system = self.inner.system.lock();
        let pid = Pid::from_u32(std::process::id());
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]));
        let (rss, virt) = system
            .process(pid)
            .map(|p| (p.memory(), p.virtual_memory()))
            .unwrap_or((0, 0));
        let rss_mb = rss as f64 / 1024.0 / 1024.0;
        MemoryStats {
            rss_mb,
            virtual_mb: virt as f64 / 1024.0 / 1024.0,
            percent_of_limit: if self.inner.max_memory_mb > 0 {
                rss_mb / self.inner.max_memory_mb as f64 * 100.0
            } else {
                0.0
            },
            limit_mb: self.inner.max_memory_mb,
        }
    }

    pub fn stats(&self) -> ResourceStats {
        let video = self.inner.video.lock();
        let webrtc = self.inner.webrtc.lock();
        let total_clients = video
            .values()
            .map(|e| e.clients.len())
            .chain(webrtc.values().map(|e| e.clients.len()))
            .sum();
        ResourceStats {
            video_services: video.len(),
            webrtc_services: webrtc.len(),
            total_clients,
            metrics: ResourceMetrics {
                services_created: self.inner.services_created.load(Ordering::Relaxed),
                services_destroyed: self.inner.services_destroyed.load(Ordering::Relaxed),
                memory_cleanups: self.inner.memory_cleanups.load(Ordering::Relaxed),
                client_connections: self.inner.client_connections.load(Ordering::Relaxed),
                client_disconnections: self.inner.client_disconnections.load(Ordering::Relaxed),
            },
            memory: self.memory_stats(),
        }
    }

    /// Video service count, for invariants and tests.
    pub fn video_service_count(&self) -> usize {
        self.inner.video.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(idle: Duration) -> ResourceManager {
        ResourceManager::new(idle, 2048, Quality::High, 60)
    }

    #[tokio::test]
    async fn video_service_is_singleton_per_udid() {
        let mgr = manager(Duration::from_secs(300));
        let a = mgr.video("UDID-1", (100, 200), "client-a");
        let b = mgr.video("UDID-1", (100, 200), "client-b");
        let _other = mgr.video("UDID-2", (100, 200), "client-a");
        assert_eq!(a.udid(), b.udid());
        assert_eq!(mgr.video_service_count(), 2);
        assert_eq!(mgr.stats().metrics.services_created, 2);
        mgr.cleanup_all().await;
    }

    #[tokio::test]
    async fn release_keeps_service_in_grace_window() {
        let mgr = manager(Duration::from_secs(300));
        mgr.video("UDID-1", (100, 200), "client-a");
        mgr.release_video("UDID-1", "client-a");

        // Still pooled: the grace window keeps it alive for reconnects.
        assert_eq!(mgr.video_service_count(), 1);
        mgr.sweep_idle().await;
        assert_eq!(mgr.video_service_count(), 1);
        mgr.cleanup_all().await;
    }

    #[tokio::test]
    async fn sweep_evicts_after_grace_window() {
        let mgr = manager(Duration::from_millis(10));
        mgr.video("UDID-1", (100, 200), "client-a");
        mgr.release_video("UDID-1", "client-a");
        tokio::time::sleep(Duration::from_millis(30)).await;
        mgr.sweep_idle().await;
        assert_eq!(mgr.video_service_count(), 0);
        assert_eq!(mgr.stats().metrics.services_destroyed, 1);
    }

    #[tokio::test]
    async fn sweep_never_evicts_active_services() {
        let mgr = manager(Duration::from_millis(10));
        mgr.video("UDID-1", (100, 200), "client-a");
        tokio::time::sleep(Duration::from_millis(30)).await;
        mgr.sweep_idle().await;
        assert_eq!(mgr.video_service_count(), 1);
        mgr.cleanup_all().await;
    }

    #[tokio::test]
    async fn reacquire_clears_idle_state() {
        let mgr = manager(Duration::from_millis(10));
        mgr.video("UDID-1", (100, 200), "client-a");
        mgr.release_video("UDID-1", "client-a");
        tokio::time::sleep(Duration::from_millis(30)).await;

        // Client reconnects before the sweep runs.
        mgr.video("UDID-1", (100, 200), "client-a");
        mgr.sweep_idle().await;
        assert_eq!(mgr.video_service_count(), 1);
        mgr.cleanup_all().await;
    }

    #[tokio::test]
    async fn emergency_cleanup_never_touches_active_services() {
        let mgr = manager(Duration::from_secs(300));
        mgr.video("UDID-ACTIVE", (100, 200), "client-a");
        mgr.video("UDID-IDLE-1", (100, 200), "client-b");
        mgr.release_video("UDID-IDLE-1", "client-b");
        mgr.video("UDID-IDLE-2", (100, 200), "client-c");
        mgr.release_video("UDID-IDLE-2", "client-c");

        mgr.evict_zero_client_services(EMERGENCY_CLEANUP_LIMIT).await;
        assert_eq!(mgr.video_service_count(), 1);
        let stats = mgr.stats();
        assert_eq!(stats.video_services, 1);
        mgr.cleanup_all().await;
    }

    #[tokio::test]
    async fn emergency_cleanup_is_bounded() {
        let mgr = manager(Duration::from_secs(300));
        for i in 0..5 {
            let udid = format!("UDID-{}", i);
            mgr.video(&udid, (100, 200), "c");
            mgr.release_video(&udid, "c");
        }
        mgr.evict_zero_client_services(EMERGENCY_CLEANUP_LIMIT).await;
        // At most three closed per pass.
        assert_eq!(mgr.video_service_count(), 2);
        mgr.cleanup_all().await;
    }

    #[tokio::test]
    async fn pressure_below_soft_threshold_is_a_no_op() {
        let mgr = manager(Duration::from_secs(300));
        mgr.video("UDID-1", (100, 200), "client-a");
        mgr.release_video("UDID-1", "client-a");

        mgr.apply_memory_pressure(100.0).await;
        assert_eq!(mgr.video_service_count(), 1);
        assert_eq!(mgr.stats().metrics.memory_cleanups, 0);
        mgr.cleanup_all().await;
    }

    #[tokio::test]
    async fn soft_pressure_spares_recently_vacated_services() {
        let mgr = manager(Duration::from_secs(300));
        mgr.video("UDID-1", (100, 200), "client-a");
        mgr.release_video("UDID-1", "client-a");

        // Above 80% but below the cap: the grace window still applies, so a
        // service vacated moments ago survives for quick reconnects.
        mgr.apply_memory_pressure(2048.0 * 0.9).await;
        assert_eq!(mgr.video_service_count(), 1);
        assert_eq!(mgr.stats().metrics.memory_cleanups, 1);
        mgr.cleanup_all().await;
    }

    #[tokio::test]
    async fn soft_pressure_evicts_expired_idle_services_unbounded() {
        let mgr = manager(Duration::from_millis(10));
        for i in 0..5 {
            let udid = format!("UDID-{}", i);
            mgr.video(&udid, (100, 200), "c");
            mgr.release_video(&udid, "c");
        }
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The soft tier is the idle sweep: no three-per-pass bound.
        mgr.apply_memory_pressure(2048.0 * 0.9).await;
        assert_eq!(mgr.video_service_count(), 0);
    }

    #[tokio::test]
    async fn critical_pressure_ignores_grace_window_but_stays_bounded() {
        let mgr = manager(Duration::from_secs(300));
        for i in 0..5 {
            let udid = format!("UDID-{}", i);
            mgr.video(&udid, (100, 200), "c");
            mgr.release_video(&udid, "c");
        }

        // Above the cap: zero-client services go immediately, at most three.
        mgr.apply_memory_pressure(3000.0).await;
        assert_eq!(mgr.video_service_count(), 2);
        mgr.cleanup_all().await;
    }

    #[tokio::test]
    async fn detach_device_removes_everything() {
        let mgr = manager(Duration::from_secs(300));
        mgr.video("UDID-1", (100, 200), "client-a");
        mgr.webrtc("UDID-1", (100, 200), "client-a").unwrap();
        assert_eq!(mgr.stats().webrtc_services, 1);

        mgr.detach_device("UDID-1").await;
        assert_eq!(mgr.video_service_count(), 0);
        assert_eq!(mgr.stats().webrtc_services, 0);
    }

    #[tokio::test]
    async fn memory_stats_reports_limit() {
        let mgr = manager(Duration::from_secs(300));
        let stats = mgr.memory_stats();
        assert_eq!(stats.limit_mb, 2048);
        assert!(stats.rss_mb >= 0.0);
    }
}
