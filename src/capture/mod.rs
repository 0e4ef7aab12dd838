//! Per-device frame production and fan-out.
//!
//! Each booted device gets at most one `VideoService`, which owns the capture
//! worker and publishes every frame into per-subscriber bounded rings. The
//! `WebRtcService` layers peer connections and a sample-fed video track on
//! top of the same frame pipeline.

mod frame;
mod video;
mod webrtc;

pub use frame::{
    now_ms, ring, Frame, FrameReceiver, FrameSender, Quality, RING_STANDARD, RING_ULTRA,
    RING_WEBRTC,
};
pub use video::{CaptureMethod, VideoService, VideoStatus};
pub use webrtc::WebRtcService;
