//! WebRTC delivery: peer connections with a video track fed from the
//! device's frame pipeline.
//!
//! Signaling (offer/answer/ICE) stays on the WebSocket; this service owns
//! the `webrtc` API instance, the peer connections, and the per-connection
//! track-feeder tasks. The frame pipeline produces JPEG, which no H264
//! packetizer can carry, so each feeder runs the captured frames through an
//! ffmpeg transcode stage and writes the resulting Annex-B NAL units as
//! track samples.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_H264};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use super::frame::RING_WEBRTC;
use super::video::{AnnexBScanner, H264Encoder, VideoService};
use crate::error::{Error, Result};

/// A peer connection together with the cancellation token of its feeder task.
struct PeerEntry {
    pc: Arc<RTCPeerConnection>,
    feeder: CancellationToken,
}

/// Singleton WebRTC service for one device. Frames come from the device's
/// `VideoService` through a dedicated subscription ring per peer.
#[derive(Clone)]
pub struct WebRtcService {
    inner: Arc<WebRtcInner>,
}

struct WebRtcInner {
    udid: String,
    api: API,
    video: VideoService,
    peers: Mutex<HashMap<String, PeerEntry>>,
    next_peer: AtomicU64,
    cancel: CancellationToken,
}

impl WebRtcService {
    pub fn new(udid: &str, video: VideoService) -> Result<Self> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| Error::Internal(format!("codec registration failed: {}", e)))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| Error::Internal(format!("interceptor setup failed: {}", e)))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            inner: Arc::new(WebRtcInner {
                udid: udid.to_string(),
                api,
                video,
                peers: Mutex::new(HashMap::new()),
                next_peer: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        })
    }

    pub fn udid(&self) -> &str {
        &self.inner.udid
    }

    /// The underlying frame producer, for quality and FPS changes.
    pub fn video(&self) -> &VideoService {
        &self.inner.video
    }

    /// Create a peer connection with an attached video track.
    ///
    /// Returns the connection id and a channel of server-side ICE candidates
    /// the signaling socket forwards to the client.
    pub async fn create_peer_connection(
        &self,
    ) -> Result<(String, mpsc::Receiver<RTCIceCandidateInit>)> {
        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: vec!["stun:stun.l.google.com:19302".to_owned()],
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(
            self.inner
                .api
                .new_peer_connection(config)
                .await
                .map_err(|e| Error::Internal(format!("peer connection failed: {}", e)))?,
        );

        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_H264.to_owned(),
                ..Default::default()
            },
            "video".to_owned(),
            "simbridge".to_owned(),
        ));
        let rtp_sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| Error::Internal(format!("add_track failed: {}", e)))?;

        // Drain RTCP so the interceptors keep running.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while rtp_sender.read(&mut buf).await.is_ok() {}
        });

        let (ice_tx, ice_rx) = mpsc::channel(16);
        pc.on_ice_candidate(Box::new(move |candidate| {
            let ice_tx = ice_tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    if let Ok(init) = candidate.to_json() {
                        let _ = ice_tx.send(init).await;
                    }
                }
            })
        }));

        let peer_id = format!(
            "peer-{}-{}",
            &self.inner.udid[..self.inner.udid.len().min(8)],
            self.inner.next_peer.fetch_add(1, Ordering::Relaxed)
        );

        let feeder = self.inner.cancel.child_token();
        self.spawn_track_feeder(track, feeder.clone());
        self.inner.peers.lock().insert(
            peer_id.clone(),
            PeerEntry {
                pc,
                feeder,
            },
        );
        Ok((peer_id, ice_rx))
    }

    /// Pipe captured JPEG frames through an H264 encoder and deliver the
    /// encoded NAL units to the track, one sample per unit.
    fn spawn_track_feeder(
        &self,
        track: Arc<TrackLocalStaticSample>,
        cancel: CancellationToken,
    ) {
        let video = self.inner.video.clone();
        let udid = self.inner.udid.clone();
        tokio::spawn(async move {
            let sub = video.subscribe(RING_WEBRTC);
            let mut encoder = match H264Encoder::spawn(video.fps()) {
                Ok(encoder) => encoder,
                Err(reason) => {
                    tracing::error!(%udid, %reason, "h264 encoder unavailable, track stays silent");
                    return;
                }
            };
            let (Some(mut enc_in), Some(mut enc_out)) =
                (encoder.take_stdin(), encoder.take_stdout())
            else {
                encoder.shutdown().await;
                return;
            };

            // Frames flow into the encoder on their own task so a stalled
            // encoder write can never back up the sample delivery below.
            let feed_cancel = cancel.clone();
            let feeder = tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = feed_cancel.cancelled() => break,
                        frame = sub.recv(Duration::from_millis(50)) => {
                            let Some(frame) = frame else { continue };
                            if enc_in.write_all(&frame.payload).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            let mut scanner = AnnexBScanner::new();
            let mut buf = [0u8; 8192];
            'deliver: loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    read = enc_out.read(&mut buf) => {
                        let n = match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        let duration =
                            Duration::from_secs_f64(1.0 / video.fps().max(1) as f64);
                        for nal in scanner.push(&buf[..n]) {
                            let sample = Sample {
                                data: nal,
                                duration,
                                ..Default::default()
                            };
                            if track.write_sample(&sample).await.is_err() {
                                break 'deliver;
                            }
                        }
                    }
                }
            }

            feeder.abort();
            encoder.shutdown().await;
        });
    }

    /// Apply a remote offer to a peer and produce the local answer SDP.
    pub async fn handle_offer(&self, peer_id: &str, sdp: &str) -> Result<String> {
        let pc = self.peer(peer_id)?;
        let offer = RTCSessionDescription::offer(sdp.to_string())
            .map_err(|e| Error::Protocol(format!("invalid offer SDP: {}", e)))?;
        pc.set_remote_description(offer)
            .await
            .map_err(|e| Error::Protocol(format!("offer rejected: {}", e)))?;
        let answer = pc
            .create_answer(None)
            .await
            .map_err(|e| Error::Internal(format!("answer creation failed: {}", e)))?;
        pc.set_local_description(answer)
            .await
            .map_err(|e| Error::Internal(format!("local description failed: {}", e)))?;
        let local = pc
            .local_description()
            .await
            .ok_or_else(|| Error::Internal("no local description".into()))?;
        Ok(local.sdp)
    }

    /// Add a remote ICE candidate to a peer.
    pub async fn add_ice_candidate(
        &self,
        peer_id: &str,
        candidate: serde_json::Value,
    ) -> Result<()> {
        let pc = self.peer(peer_id)?;
        let init: RTCIceCandidateInit = serde_json::from_value(candidate)
            .map_err(|e| Error::Protocol(format!("invalid ICE candidate: {}", e)))?;
        pc.add_ice_candidate(init)
            .await
            .map_err(|e| Error::Protocol(format!("ICE candidate rejected: {}", e)))
    }

    /// Close one peer connection and stop its feeder.
    pub async fn remove_peer(&self, peer_id: &str) {
        let entry = self.inner.peers.lock().remove(peer_id);
        if let Some(entry) = entry {
            entry.feeder.cancel();
            let _ = entry.pc.close().await;
        }
    }

    pub fn peer_count(&self) -> usize {
        self.inner.peers.lock().len()
    }

    /// Close all peers and stop feeding tracks.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        let peers: Vec<PeerEntry> = {
            let mut map = self.inner.peers.lock();
            map.drain().map(|(_, entry)| entry).collect()
        };
        for entry in peers {
            entry.feeder.cancel();
            let _ = entry.pc.close().await;
        }
    }

    fn peer(&self, peer_id: &str) -> Result<Arc<RTCPeerConnection>> {
        self.inner
            .peers
            .lock()
            .get(peer_id)
            .map(|entry| Arc::clone(&entry.pc))
            .ok_or_else(|| Error::NotFound(format!("peer connection {}", peer_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Quality;

    fn service() -> WebRtcService {
        let video = VideoService::new("UDID-TEST", (1170, 2532), Quality::High, 60);
        WebRtcService::new("UDID-TEST", video).unwrap()
    }

    #[tokio::test]
    async fn peer_lifecycle() {
        let svc = service();
        assert_eq!(svc.peer_count(), 0);
        let (peer_id, _ice) = svc.create_peer_connection().await.unwrap();
        assert_eq!(svc.peer_count(), 1);
        assert!(peer_id.starts_with("peer-"));

        svc.remove_peer(&peer_id).await;
        assert_eq!(svc.peer_count(), 0);
    }

    #[tokio::test]
    async fn peer_ids_are_distinct() {
        let svc = service();
        let (a, _ice_a) = svc.create_peer_connection().await.unwrap();
        let (b, _ice_b) = svc.create_peer_connection().await.unwrap();
        assert_ne!(a, b);
        svc.shutdown().await;
        assert_eq!(svc.peer_count(), 0);
    }

    #[tokio::test]
    async fn offer_on_unknown_peer_is_not_found() {
        let svc = service();
        let err = svc.handle_offer("peer-missing", "v=0").await.unwrap_err();
        assert_eq!(err.kind(), "not-found");
    }

    #[tokio::test]
    async fn malformed_ice_candidate_is_protocol_error() {
        let svc = service();
        let (peer_id, _ice) = svc.create_peer_connection().await.unwrap();
        let err = svc
            .add_ice_candidate(&peer_id, serde_json::json!({"bogus": true}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "protocol");
        svc.shutdown().await;
    }
}
