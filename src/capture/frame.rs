use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Notify;

/// Capture quality preset. Resolution factor scales the native pixel size;
/// FPS is the capture target; the JPEG value is the encoder quality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Low,
    Medium,
    High,
    Ultra,
}

impl Quality {
    pub fn resolution_factor(&self) -> f64 {
        match self {
            Quality::Low => 0.60,
            Quality::Medium => 0.80,
            Quality::High => 1.00,
            Quality::Ultra => 1.20,
        }
    }

    pub fn fps(&self) -> u32 {
        match self {
            Quality::Low => 45,
            Quality::Medium => 60,
            Quality::High => 75,
            Quality::Ultra => 90,
        }
    }

    pub fn jpeg_quality(&self) -> u8 {
        match self {
            Quality::Low => 50,
            Quality::Medium => 65,
            Quality::High => 80,
            Quality::Ultra => 95,
        }
    }
}

/// Ring capacity for the standard frame-push transport.
pub const RING_STANDARD: usize = 3;
/// Ring capacity for the ultra-low-latency transport: newest frame only.
pub const RING_ULTRA: usize = 1;
/// Ring capacity for WebRTC track feeding.
pub const RING_WEBRTC: usize = 2;

/// A single JPEG-encoded snapshot of the device screen.
///
/// Sequence numbers are strictly increasing per capture-service lifetime;
/// gaps indicate dropped frames. Frames are transient and never persisted.
#[derive(Debug, Clone)]
pub struct Frame {
    pub payload: Bytes,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub seq: u64,
    /// Capture time, milliseconds since the Unix epoch.
    pub captured_at_ms: u64,
}

impl Frame {
    pub fn new(payload: Bytes, pixel_width: u32, pixel_height: u32, seq: u64) -> Self {
        Self {
            payload,
            pixel_width,
            pixel_height,
            seq,
            captured_at_ms: now_ms(),
        }
    }
}

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct RingShared {
    frames: Mutex<VecDeque<Frame>>,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
    notify: Notify,
}

/// Producer side of a per-subscriber frame ring.
///
/// The capture worker pushes every frame into each subscriber's ring; a full
/// ring drops its oldest frame so a slow subscriber never blocks the worker
/// or other subscribers.
#[derive(Clone)]
pub struct FrameSender {
    shared: Arc<RingShared>,
}

/// Consumer side of a frame ring. Dropping the receiver closes the ring and
/// lets the capture worker prune it on the next publish.
pub struct FrameReceiver {
    shared: Arc<RingShared>,
}

/// Create a bounded frame ring with the given capacity.
pub fn ring(capacity: usize) -> (FrameSender, FrameReceiver) {
    let shared = Arc::new(RingShared {
        frames: Mutex::new(VecDeque::with_capacity(capacity)),
        capacity: capacity.max(1),
        dropped: AtomicU64::new(0),
        closed: AtomicBool::new(false),
        notify: Notify::new(),
    });
    (
        FrameSender {
            shared: Arc::clone(&shared),
        },
        FrameReceiver { shared },
    )
}

impl FrameSender {
    /// Push a frame, evicting exactly one oldest frame if the ring is full.
    pub fn push(&self, frame: Frame) {
        if self.shared.closed.load(Ordering::Acquire) {
            return;
        }
        {
            let mut frames = self.shared.frames.lock();
            if frames.len() >= self.shared.capacity {
                frames.pop_front();
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            }
            frames.push_back(frame);
        }
        self.shared.notify.notify_one();
    }

    /// True once the matching receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl FrameReceiver {
    /// Take the next frame, waiting at most `timeout`.
    ///
    /// Returns `None` on timeout. The short timeouts used by the transports
    /// (50 ms standard, 1 ms ultra-low-latency) make the consumer loop
    /// responsive to socket closure.
    pub async fn recv(&self, timeout: Duration) -> Option<Frame> {
        if let Some(frame) = self.try_recv() {
            return Some(frame);
        }
        let waited = tokio::time::timeout(timeout, self.shared.notify.notified()).await;
        if waited.is_err() {
            return None;
        }
        self.try_recv()
    }

    /// Take the next frame without waiting.
    pub fn try_recv(&self) -> Option<Frame> {
        self.shared.frames.lock().pop_front()
    }

    /// Number of frames this ring has dropped due to overflow.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}
