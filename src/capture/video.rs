//! Per-device JPEG frame production.
//!
//! The capture worker tries a chain of methods: a continuous device video
//! stream, hardware-accelerated encoding, software encoding, and finally a
//! high-frequency screenshot loop. A method that fails is disqualified for
//! the service's lifetime; if every method fails the worker restarts the
//! chain once before reporting a persistent failure.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

use super::frame::{ring, Frame, FrameReceiver, FrameSender, Quality};

/// JPEG start-of-image marker.
const SOI: [u8; 2] = [0xff, 0xd8];
/// JPEG end-of-image marker.
const EOI: [u8; 2] = [0xff, 0xd9];

/// How a device's frames are being produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureMethod {
    Stream,
    HwEncode,
    SwEncode,
    Screenshot,
}

impl CaptureMethod {
    const ORDER: [CaptureMethod; 4] = [
        CaptureMethod::Stream,
        CaptureMethod::HwEncode,
        CaptureMethod::SwEncode,
        CaptureMethod::Screenshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureMethod::Stream => "stream",
            CaptureMethod::HwEncode => "hw-encode",
            CaptureMethod::SwEncode => "sw-encode",
            CaptureMethod::Screenshot => "screenshot",
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct VideoStatus {
    pub udid: String,
    pub streaming: bool,
    pub capture_method: Option<&'static str>,
    pub subscribers: usize,
    pub frames_published: u64,
    pub frames_dropped: u64,
}

struct VideoInner {
    udid: String,
    pixel_width: u32,
    pixel_height: u32,
    quality: Mutex<Quality>,
    fps: AtomicU32,
    seq: AtomicU64,
    published: AtomicU64,
    subscribers: Mutex<Vec<FrameSender>>,
    method: Mutex<Option<CaptureMethod>>,
    disqualified: Mutex<HashSet<CaptureMethod>>,
    restarted: AtomicBool,
    failed: AtomicBool,
    cancel: CancellationToken,
}

/// Singleton frame producer for one device.
#[derive(Clone)]
pub struct VideoService {
    inner: Arc<VideoInner>,
}

impl VideoService {
    /// Construct without starting the capture worker. Used by tests and by
    /// [`VideoService::start`].
    pub fn new(udid: &str, pixel_size: (u32, u32), quality: Quality, fps: u32) -> Self {
        Self {
            inner: Arc::new(VideoInner {
                udid: udid.to_string(),
                pixel_width: pixel_size.0,
                pixel_height: pixel_size.1,
                quality: Mutex::new(quality),
                fps: AtomicU32::new(fps.max(1)),
                seq: AtomicU64::new(0),
                published: AtomicU64::new(0),
                subscribers: Mutex::new(Vec::new()),
                method: Mutex::new(None),
                disqualified: Mutex::new(HashSet::new()),
                restarted: AtomicBool::new(false),
                failed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Construct and start the capture worker.
    pub fn start(udid: &str, pixel_size: (u32, u32), quality: Quality, fps: u32) -> Self {
        let service = Self::new(udid, pixel_size, quality, fps);
        service.spawn_worker();
        service
    }

    pub fn spawn_worker(&self) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            run_worker(inner).await;
        });
    }

    /// Open a new bounded subscription ring.
    pub fn subscribe(&self, capacity: usize) -> FrameReceiver {
        let (tx, rx) = ring(capacity);
        self.inner.subscribers.lock().push(tx);
        rx
    }

    /// Change the quality preset. Takes effect between frames; subscribers
    /// observe the new format on the next frame.
    pub fn set_quality(&self, quality: Quality) {
        *self.inner.quality.lock() = quality;
    }

    pub fn quality(&self) -> Quality {
        *self.inner.quality.lock()
    }

    pub fn set_fps(&self, fps: u32) {
        self.inner.fps.store(fps.clamp(1, 120), Ordering::Relaxed);
    }

    pub fn fps(&self) -> u32 {
        self.inner.fps.load(Ordering::Relaxed)
    }

    pub fn udid(&self) -> &str {
        &self.inner.udid
    }

    pub fn status(&self) -> VideoStatus {
        let subscribers = self.inner.subscribers.lock();
        let dropped = subscribers.iter().map(|s| s.dropped()).sum();
        VideoStatus {
            udid: self.inner.udid.clone(),
            streaming: !self.inner.cancel.is_cancelled()
                && !self.inner.failed.load(Ordering::Relaxed),
            capture_method: self.inner.method.lock().map(|m| m.as_str()),
            subscribers: subscribers.len(),
            frames_published: self.inner.published.load(Ordering::Relaxed),
            frames_dropped: dropped,
        }
    }

    /// Stop the capture worker and close the pipeline.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.subscribers.lock().clear();
    }

    /// Publish a JPEG payload to every live subscriber, pruning dead rings.
    /// Sequence numbers are strictly increasing for the service's lifetime.
    pub(crate) fn publish(&self, payload: Bytes, pixel_width: u32, pixel_height: u32) {
        publish(&self.inner, payload, pixel_width, pixel_height);
    }
}

fn publish(inner: &VideoInner, payload: Bytes, pixel_width: u32, pixel_height: u32) {
    let seq = inner.seq.fetch_add(1, Ordering::Relaxed) + 1;
    let frame = Frame::new(payload, pixel_width, pixel_height, seq);
    inner.published.fetch_add(1, Ordering::Relaxed);

    let mut subscribers = inner.subscribers.lock();
    subscribers.retain(|s| !s.is_closed());
    for sub in subscribers.iter() {
        sub.push(frame.clone());
    }
}

fn pick_method(inner: &VideoInner) -> Option<CaptureMethod> {
    let disqualified = inner.disqualified.lock();
    CaptureMethod::ORDER
        .iter()
        .copied()
        .find(|m| !disqualified.contains(m))
}

async fn run_worker(inner: Arc<VideoInner>) {
    loop {
        if inner.cancel.is_cancelled() {
            return;
        }
        let method = match pick_method(&inner) {
            Some(method) => method,
            None => {
                // One full restart of the chain is allowed before the
                // failure becomes persistent.
                if !inner.restarted.swap(true, Ordering::SeqCst) {
                    tracing::warn!(udid = %inner.udid, "all capture methods failed, restarting chain once");
                    inner.disqualified.lock().clear();
                    continue;
                }
                tracing::error!(udid = %inner.udid, "capture failed persistently");
                inner.failed.store(true, Ordering::Relaxed);
                return;
            }
        };
        *inner.method.lock() = Some(method);
        tracing::info!(udid = %inner.udid, method = method.as_str(), "starting capture");

        let result = match method {
            CaptureMethod::Stream => run_child_capture(&inner, stream_command(&inner)).await,
            CaptureMethod::HwEncode => run_child_capture(&inner, ffmpeg_command(&inner, true)).await,
            CaptureMethod::SwEncode => {
                run_child_capture(&inner, ffmpeg_command(&inner, false)).await
            }
            CaptureMethod::Screenshot => run_screenshot_loop(&inner).await,
        };

        if inner.cancel.is_cancelled() {
            return;
        }
        match result {
            Ok(()) => return,
            Err(reason) => {
                tracing::warn!(
                    udid = %inner.udid,
                    method = method.as_str(),
                    %reason,
                    "capture method failed, disqualifying"
                );
                inner.disqualified.lock().insert(method);
            }
        }
    }
}

fn stream_command(inner: &VideoInner) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("idb");
    cmd.args([
        "video-stream",
        "--udid",
        &inner.udid,
        "--format",
        "mjpeg",
        "--fps",
        &inner.fps.load(Ordering::Relaxed).to_string(),
    ]);
    cmd
}

fn ffmpeg_command(inner: &VideoInner, hardware: bool) -> tokio::process::Command {
    let quality = *inner.quality.lock();
    let factor = quality.resolution_factor();
    let width = ((inner.pixel_width as f64 * factor) as u32).max(2) & !1;
    let height = ((inner.pixel_height as f64 * factor) as u32).max(2) & !1;
    let scale = format!("scale={}:{}", width, height);
    let fps = inner.fps.load(Ordering::Relaxed).to_string();

    let mut cmd = tokio::process::Command::new("ffmpeg");
    cmd.args(["-f", "avfoundation", "-capture_cursor", "0"]);
    if hardware {
        cmd.args(["-pixel_format", "uyvy422"]);
    }
    cmd.args(["-framerate", &fps, "-i", "1:none", "-vf", &scale]);
    if hardware {
        cmd.args(["-c:v", "mjpeg", "-q:v", "3"]);
    } else {
        cmd.args(["-c:v", "mjpeg", "-q:v", "5", "-preset", "ultrafast"]);
    }
    cmd.args(["-f", "mjpeg", "-"]);
    cmd
}

/// Run a child whose stdout is an MJPEG byte stream, publishing each frame.
async fn run_child_capture(
    inner: &Arc<VideoInner>,
    mut cmd: tokio::process::Command,
) -> Result<(), String> {
    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("spawn failed: {}", e))?;

    let mut stdout = child.stdout.take().ok_or("no stdout")?;
    let mut scanner = MjpegScanner::new();
    let mut buf = [0u8; 8192];
    let mut produced_any = false;

    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                return Ok(());
            }
            read = stdout.read(&mut buf) => {
                match read {
                    Ok(0) => break,
                    Ok(n) => {
                        for jpeg in scanner.push(&buf[..n]) {
                            produced_any = true;
                            publish(inner, jpeg, inner.pixel_width, inner.pixel_height);
                        }
                    }
                    Err(e) => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        return Err(format!("read error: {}", e));
                    }
                }
            }
        }
    }

    let status = child.wait().await.map_err(|e| e.to_string())?;
    if produced_any {
        // The stream ended after working; treat as a method failure so the
        // chain can fall through rather than leaving the service dark.
        Err(format!("stream ended (exit {:?})", status.code()))
    } else {
        Err(format!(
            "stream produced no frames (exit {:?})",
            status.code()
        ))
    }
}

/// Last-resort capture: timed screenshots re-encoded per the active preset.
async fn run_screenshot_loop(inner: &Arc<VideoInner>) -> Result<(), String> {
    let mut consecutive_failures = 0u32;
    loop {
        if inner.cancel.is_cancelled() {
            return Ok(());
        }
        let fps = inner.fps.load(Ordering::Relaxed).max(1);
        let interval = Duration::from_secs_f64(1.0 / fps as f64);
        let started = std::time::Instant::now();

        match capture_screenshot(inner).await {
            Ok((jpeg, width, height)) => {
                consecutive_failures = 0;
                publish(inner, jpeg, width, height);
            }
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures >= 5 {
                    return Err(format!("screenshots failing repeatedly: {}", e));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }

        let elapsed = started.elapsed();
        if elapsed < interval {
            tokio::select! {
                _ = inner.cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval - elapsed) => {}
            }
        }
    }
}

/// Take one PNG screenshot and re-encode as JPEG at the active preset.
async fn capture_screenshot(inner: &Arc<VideoInner>) -> Result<(Bytes, u32, u32), String> {
    let scratch = tempfile::tempdir().map_err(|e| e.to_string())?;
    let path = scratch.path().join("frame.png");

    let status = tokio::process::Command::new("xcrun")
        .args([
            "simctl",
            "io",
            &inner.udid,
            "screenshot",
            "--type=png",
            &path.to_string_lossy(),
        ])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| format!("screenshot spawn failed: {}", e))?;
    if !status.success() {
        return Err(format!("screenshot exit {:?}", status.code()));
    }

    let png = std::fs::read(&path).map_err(|e| e.to_string())?;
    let quality = *inner.quality.lock();

    // Decode, scale, and re-encode off the reactor.
    tokio::task::spawn_blocking(move || transcode_png(&png, quality))
        .await
        .map_err(|e| e.to_string())?
}

fn transcode_png(png: &[u8], quality: Quality) -> Result<(Bytes, u32, u32), String> {
    let img = image::load_from_memory(png).map_err(|e| e.to_string())?;
    let factor = quality.resolution_factor();
    let img = if (factor - 1.0).abs() > f64::EPSILON {
        let width = ((img.width() as f64 * factor) as u32).max(1);
        let height = ((img.height() as f64 * factor) as u32).max(1);
        img.resize(width, height, image::imageops::FilterType::Triangle)
    } else {
        img
    };
    let (width, height) = (img.width(), img.height());

    let mut out = Vec::new();
    let mut cursor = std::io::Cursor::new(&mut out);
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(
        &mut cursor,
        quality.jpeg_quality(),
    );
    img.into_rgb8()
        .write_with_encoder(encoder)
        .map_err(|e| e.to_string())?;
    Ok((Bytes::from(out), width, height))
}

/// ffmpeg child transcoding an MJPEG stream on stdin into H264 Annex-B on
/// stdout.
///
/// The frame pipeline itself stays JPEG; this stage exists for consumers
/// that need a real-time video codec, currently the WebRTC sample track.
pub(crate) struct H264Encoder {
    child: tokio::process::Child,
}

impl H264Encoder {
    pub(crate) fn spawn(fps: u32) -> Result<Self, String> {
        let fps = fps.max(1).to_string();
        let mut cmd = tokio::process::Command::new("ffmpeg");
        cmd.args([
            "-f", "mjpeg", "-r", &fps, "-i", "-",
            "-c:v", "libx264",
            "-preset", "ultrafast",
            "-tune", "zerolatency",
            "-profile:v", "baseline",
            "-pix_fmt", "yuv420p",
            "-g", "30",
            "-f", "h264", "-",
        ]);
        let child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| format!("encoder spawn failed: {}", e))?;
        Ok(Self { child })
    }

    pub(crate) fn take_stdin(&mut self) -> Option<tokio::process::ChildStdin> {
        self.child.stdin.take()
    }

    pub(crate) fn take_stdout(&mut self) -> Option<tokio::process::ChildStdout> {
        self.child.stdout.take()
    }

    pub(crate) async fn shutdown(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

/// Incremental splitter for an H264 Annex-B byte stream.
///
/// Emits one NAL unit per complete unit, start code included; the RTP
/// packetizer accepts either the three- or four-byte start-code form.
pub(crate) struct AnnexBScanner {
    buffer: Vec<u8>,
}

impl AnnexBScanner {
    pub(crate) fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);

        // Start positions of every 00 00 01 in the buffer, folding in a
        // preceding zero for the four-byte form.
        let mut starts: Vec<usize> = Vec::new();
        let mut i = 0;
        while i + 2 < self.buffer.len() {
            if self.buffer[i] == 0 && self.buffer[i + 1] == 0 && self.buffer[i + 2] == 1 {
                let begin = if i > 0 && self.buffer[i - 1] == 0 {
                    i - 1
                } else {
                    i
                };
                starts.push(begin);
                i += 3;
            } else {
                i += 1;
            }
        }

        let Some(&first) = starts.first() else {
            // No start code yet; keep only a tail that could complete one.
            if self.buffer.len() > 4 {
                let tail = self.buffer.split_off(self.buffer.len() - 4);
                self.buffer = tail;
            }
            return Vec::new();
        };
        if first > 0 {
            self.buffer.drain(..first);
            for start in &mut starts {
                *start -= first;
            }
        }

        let mut nals = Vec::new();
        for pair in starts.windows(2) {
            nals.push(Bytes::copy_from_slice(&self.buffer[pair[0]..pair[1]]));
        }
        if let Some(&last) = starts.last() {
            self.buffer.drain(..last);
        }
        nals
    }
}

/// Incremental scanner that slices complete JPEG images out of a byte stream.
struct MjpegScanner {
    buffer: Vec<u8>,
}

impl MjpegScanner {
    fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            let Some(start) = find(&self.buffer, &SOI) else {
                self.buffer.clear();
                break;
            };
            let Some(end_rel) = find(&self.buffer[start + 2..], &EOI) else {
                // Incomplete frame: keep from the SOI onward.
                self.buffer.drain(..start);
                break;
            };
            let end = start + 2 + end_rel + 2;
            frames.push(Bytes::copy_from_slice(&self.buffer[start..end]));
            self.buffer.drain(..end);
        }
        frames
    }
}

fn find(haystack: &[u8], needle: &[u8; 2]) -> Option<usize> {
    haystack.windows(2).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn jpeg(body: &[u8]) -> Vec<u8> {
        let mut data = SOI.to_vec();
        data.extend_from_slice(body);
        data.extend_from_slice(&EOI);
        data
    }

    #[test]
    fn scanner_extracts_single_frame() {
        let mut scanner = MjpegScanner::new();
        let frames = scanner.push(&jpeg(b"abc"));
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &jpeg(b"abc")[..]);
    }

    #[test]
    fn scanner_handles_split_frames() {
        let mut scanner = MjpegScanner::new();
        let full = jpeg(b"split-frame-data");
        let (a, b) = full.split_at(5);
        assert!(scanner.push(a).is_empty());
        let frames = scanner.push(b);
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &full[..]);
    }

    #[test]
    fn scanner_extracts_multiple_frames_per_chunk() {
        let mut scanner = MjpegScanner::new();
        let mut chunk = jpeg(b"one");
        chunk.extend_from_slice(&jpeg(b"two"));
        let frames = scanner.push(&chunk);
        assert_eq!(frames.len(), 2);
    }

    #[test]
    fn scanner_skips_garbage_before_soi() {
        let mut scanner = MjpegScanner::new();
        let mut chunk = b"garbage".to_vec();
        chunk.extend_from_slice(&jpeg(b"frame"));
        let frames = scanner.push(&chunk);
        assert_eq!(frames.len(), 1);
    }

    #[tokio::test]
    async fn publish_assigns_increasing_sequence_numbers() {
        let service = VideoService::new("UDID", (1170, 2532), Quality::High, 60);
        let sub = service.subscribe(8);
        for _ in 0..3 {
            service.publish(Bytes::from_static(b"\xff\xd8x\xff\xd9"), 1170, 2532);
        }
        let s1 = sub.try_recv().unwrap().seq;
        let s2 = sub.try_recv().unwrap().seq;
        let s3 = sub.try_recv().unwrap().seq;
        assert!(s1 < s2 && s2 < s3);
    }

    #[tokio::test]
    async fn closed_subscribers_are_pruned_on_publish() {
        let service = VideoService::new("UDID", (1170, 2532), Quality::High, 60);
        let sub1 = service.subscribe(3);
        let sub2 = service.subscribe(3);
        drop(sub2);
        service.publish(Bytes::from_static(b"\xff\xd8x\xff\xd9"), 1170, 2532);
        assert_eq!(service.status().subscribers, 1);
        assert_eq!(sub1.try_recv().unwrap().seq, 1);
    }

    #[tokio::test]
    async fn quality_and_fps_reconfigure() {
        let service = VideoService::new("UDID", (1170, 2532), Quality::Medium, 60);
        assert_eq!(service.quality(), Quality::Medium);
        service.set_quality(Quality::Ultra);
        assert_eq!(service.quality(), Quality::Ultra);
        service.set_fps(90);
        assert_eq!(service.fps(), 90);
        service.set_fps(500);
        assert_eq!(service.fps(), 120);
    }

    #[tokio::test]
    async fn status_reports_drops_across_subscribers() {
        let service = VideoService::new("UDID", (100, 200), Quality::Low, 30);
        let _slow = service.subscribe(1);
        for _ in 0..4 {
            service.publish(Bytes::from_static(b"\xff\xd8x\xff\xd9"), 100, 200);
        }
        let status = service.status();
        assert_eq!(status.frames_published, 4);
        assert_eq!(status.frames_dropped, 3);
        assert_eq!(status.capture_method, None);
    }

    #[test]
    fn annexb_scanner_splits_nal_units() {
        let mut scanner = AnnexBScanner::new();
        let stream = [
            &[0, 0, 0, 1, 0x67, 0xAA][..], // SPS
            &[0, 0, 0, 1, 0x68, 0xBB][..], // PPS
            &[0, 0, 1, 0x65, 0xCC, 0xDD][..], // IDR, three-byte start code
        ]
        .concat();
        let nals = scanner.push(&stream);
        // The last unit stays buffered until the next start code arrives.
        assert_eq!(nals.len(), 2);
        assert_eq!(&nals[0][..], &[0, 0, 0, 1, 0x67, 0xAA]);
        assert_eq!(&nals[1][..], &[0, 0, 0, 1, 0x68, 0xBB]);

        let nals = scanner.push(&[0, 0, 0, 1, 0x41, 0xEE]);
        assert_eq!(nals.len(), 1);
        assert_eq!(&nals[0][..], &[0, 0, 1, 0x65, 0xCC, 0xDD]);
    }

    #[test]
    fn annexb_scanner_handles_split_start_codes() {
        let mut scanner = AnnexBScanner::new();
        assert!(scanner.push(&[0, 0, 0, 1, 0x67, 0x11, 0x22, 0, 0]).is_empty());
        // Start code completed across the chunk boundary.
        let nals = scanner.push(&[0, 1, 0x68, 0x33]);
        assert_eq!(nals.len(), 1);
        assert_eq!(&nals[0][..], &[0, 0, 0, 1, 0x67, 0x11, 0x22]);
    }

    #[test]
    fn annexb_scanner_discards_leading_garbage() {
        let mut scanner = AnnexBScanner::new();
        assert!(scanner.push(b"garbage-bytes").is_empty());
        let mut stream = vec![0, 0, 1, 0x67, 0x01];
        stream.extend_from_slice(&[0, 0, 1, 0x68, 0x02]);
        let nals = scanner.push(&stream);
        assert_eq!(nals.len(), 1);
        assert_eq!(&nals[0][..], &[0, 0, 1, 0x67, 0x01]);
    }

    #[test]
    fn transcode_scales_by_preset_factor() {
        // 10x10 white PNG.
        let img = image::RgbImage::from_pixel(10, 10, image::Rgb([255, 255, 255]));
        let mut png = Vec::new();
        image::DynamicImage::ImageRgb8(img)
            .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
            .unwrap();

        let (jpeg, w, h) = transcode_png(&png, Quality::Low).unwrap();
        assert_eq!((w, h), (6, 6));
        assert_eq!(&jpeg[..2], &SOI);

        let (_, w, h) = transcode_png(&png, Quality::High).unwrap();
        assert_eq!((w, h), (10, 10));
    }
}
