//! WebSocket endpoints.
//!
//! Every endpoint follows the same discipline on open: verify the session
//! (closing with code 4004 if invalid), reserve a connection slot through the
//! connection manager (closing with a distinct code on rate-limit or cap
//! denial), acquire any capture services, and enter its loop. Teardown runs
//! on every exit path: the connection guard and service releases live in the
//! handler frame, so an abrupt socket close or panic still unwinds them.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, Path, State, WebSocketUpgrade,
    },
    response::Response,
};
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;

use super::AppState;
use crate::capture::{now_ms, RING_STANDARD, RING_ULTRA};
use crate::connections::ConnectionKind;
use crate::error::Error;
use crate::protocol::{
    ControlMessage, LogEntry, LogRequest, ScreenshotMessage, ScreenshotRequest, SignalingMessage,
    VideoFrameMessage, WsErrorFrame,
};
use crate::session::Session;

/// Close codes clients can tell apart.
const CLOSE_SESSION_INVALID: u16 = 4004;
const CLOSE_CAP_EXCEEDED: u16 = 4409;
const CLOSE_RATE_LIMITED: u16 = 4429;

/// Frame poll timeout for the standard video transport.
const FRAME_POLL: Duration = Duration::from_millis(50);
/// Frame poll timeout for the ultra-low-latency transport.
const FRAME_POLL_ULTRA: Duration = Duration::from_millis(1);

fn base64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn client_id_for(addr: &SocketAddr) -> String {
    use rand::Rng;
    let suffix: String = rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("{}-{}", addr, suffix)
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Verify the session and reserve a connection slot, closing the socket with
/// a distinguishable code on failure.
async fn open_connection(
    socket: WebSocket,
    state: &AppState,
    session_id: &str,
    kind: ConnectionKind,
    addr: &SocketAddr,
) -> Option<(WebSocket, Session, crate::connections::ConnectionGuard)> {
    let Some(session) = state.sessions.get(session_id) else {
        close_with(socket, CLOSE_SESSION_INVALID, "session not found").await;
        return None;
    };
    let source = addr.ip().to_string();
    match state.connections.try_register(session_id, kind, &source) {
        Ok(guard) => Some((socket, session, guard)),
        Err(Error::RateLimited(_)) => {
            close_with(socket, CLOSE_RATE_LIMITED, "rate limited").await;
            None
        }
        Err(Error::CapExceeded(_)) => {
            close_with(socket, CLOSE_CAP_EXCEEDED, "connection cap exceeded").await;
            None
        }
        Err(_) => {
            close_with(socket, CLOSE_SESSION_INVALID, "registration failed").await;
            None
        }
    }
}

// ---------------------------------------------------------------------------
// Control
// ---------------------------------------------------------------------------

pub(super) async fn ws_control(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_control(socket, state, session_id, addr))
}

async fn handle_control(socket: WebSocket, state: AppState, session_id: String, addr: SocketAddr) {
    let Some((socket, session, _guard)) =
        open_connection(socket, &state, &session_id, ConnectionKind::Control, &addr).await
    else {
        return;
    };
    let (mut ws_tx, mut ws_rx) = socket.split();

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };
        let reply = match serde_json::from_str::<ControlMessage>(&text) {
            Ok(control) => {
                let tag = control.tag();
                match execute_control(&state, &session, control).await {
                    Ok(()) => serde_json::json!({ "type": "ack", "t": tag }).to_string(),
                    Err(e) => WsErrorFrame::new(e.kind(), e.to_string()).to_json(),
                }
            }
            // Malformed messages are reported on the socket, never close it.
            Err(e) => WsErrorFrame::new("protocol", format!("invalid control message: {}", e))
                .to_json(),
        };
        if ws_tx.send(Message::Text(reply.into())).await.is_err() {
            break;
        }
    }
}

/// Execute one control message under the per-device mutex. Messages from one
/// socket run in order; the 2 s lock budget converts contention into `busy`.
async fn execute_control(
    state: &AppState,
    session: &Session,
    msg: ControlMessage,
) -> crate::error::Result<()> {
    let _device = state.driver.lock_device(&session.udid).await?;
    match msg {
        ControlMessage::Tap { x, y } => state.driver.tap(&session.udid, x, y).await,
        ControlMessage::Swipe {
            start_x,
            start_y,
            end_x,
            end_y,
            duration,
        } => {
            state
                .driver
                .swipe(&session.udid, start_x, start_y, end_x, end_y, duration)
                .await
        }
        ControlMessage::Button { button } => state.driver.press_button(&session.udid, button).await,
        ControlMessage::Key { key, duration } => {
            state.driver.key(&session.udid, &key, duration).await
        }
        ControlMessage::Text { text } => state.driver.input_text(&session.udid, &text).await,
    }
}

// ---------------------------------------------------------------------------
// Frame-push video (standard and ultra-low-latency)
// ---------------------------------------------------------------------------

pub(super) async fn ws_video(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_video(socket, state, session_id, addr, false))
}

pub(super) async fn ws_ultra(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_video(socket, state, session_id, addr, true))
}

async fn handle_video(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    addr: SocketAddr,
    ultra: bool,
) {
    let kind = if ultra {
        ConnectionKind::UltraVideo
    } else {
        ConnectionKind::Video
    };
    let Some((socket, session, _guard)) =
        open_connection(socket, &state, &session_id, kind, &addr).await
    else {
        return;
    };

    let client_id = client_id_for(&addr);
    let service = state.resources.video(
        &session.udid,
        (session.pixel_width, session.pixel_height),
        &client_id,
    );
    let sub = service.subscribe(if ultra { RING_ULTRA } else { RING_STANDARD });
    let poll = if ultra { FRAME_POLL_ULTRA } else { FRAME_POLL };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut fps_window: VecDeque<Instant> = VecDeque::new();
    let mut skipped_stale = 0u64;

    loop {
        tokio::select! {
            frame = sub.recv(poll) => {
                let Some(frame) = frame else { continue };

                // Slow-consumer backpressure: a frame already more than two
                // frame intervals old is dropped so the stream catches up.
                let interval_ms = 1000 / service.fps().max(1) as u64;
                if now_ms().saturating_sub(frame.captured_at_ms) > 2 * interval_ms {
                    skipped_stale += 1;
                    continue;
                }

                let now = Instant::now();
                fps_window.push_back(now);
                while fps_window
                    .front()
                    .is_some_and(|t| now.duration_since(*t) > Duration::from_secs(1))
                {
                    fps_window.pop_front();
                }

                let message = VideoFrameMessage {
                    kind: "video_frame",
                    data: base64_encode(&frame.payload),
                    pixel_width: frame.pixel_width,
                    pixel_height: frame.pixel_height,
                    point_width: session.point_width,
                    point_height: session.point_height,
                    frame: frame.seq,
                    timestamp: frame.captured_at_ms,
                    fps: fps_window.len() as u32,
                    format: "jpeg",
                };
                let Ok(json) = serde_json::to_string(&message) else { continue };
                if ws_tx.send(Message::Text(json.into())).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                match inbound {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => {}
                }
            }
        }
    }

    if skipped_stale > 0 {
        tracing::debug!(session = %session_id, skipped_stale, "dropped stale frames for slow consumer");
    }
    state.resources.release_video(&session.udid, &client_id);
}

// ---------------------------------------------------------------------------
// WebRTC signaling
// ---------------------------------------------------------------------------

pub(super) async fn ws_webrtc(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_webrtc(socket, state, session_id, addr))
}

async fn handle_webrtc(socket: WebSocket, state: AppState, session_id: String, addr: SocketAddr) {
    let Some((socket, session, _guard)) = open_connection(
        socket,
        &state,
        &session_id,
        ConnectionKind::WebrtcSignaling,
        &addr,
    )
    .await
    else {
        return;
    };

    let client_id = client_id_for(&addr);
    let service = match state.resources.webrtc(
        &session.udid,
        (session.pixel_width, session.pixel_height),
        &client_id,
    ) {
        Ok(service) => service,
        Err(e) => {
            close_with(socket, CLOSE_SESSION_INVALID, "webrtc unavailable").await;
            tracing::error!(session = %session_id, error = %e, "webrtc service creation failed");
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut peer_id: Option<String> = None;
    // Server-side ICE candidates from any peer funnel through one channel.
    let (ice_tx, mut ice_rx) = mpsc::channel::<webrtc::ice_transport::ice_candidate::RTCIceCandidateInit>(16);

    loop {
        tokio::select! {
            Some(candidate) = ice_rx.recv() => {
                let msg = serde_json::json!({
                    "type": "ice-candidate",
                    "candidate": candidate,
                });
                if ws_tx.send(Message::Text(msg.to_string().into())).await.is_err() {
                    break;
                }
            }
            inbound = ws_rx.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => continue,
                };
                let reply = match serde_json::from_str::<SignalingMessage>(&text) {
                    Ok(msg) => {
                        signaling_reply(&state, &service, &mut peer_id, &ice_tx, msg).await
                    }
                    Err(e) => {
                        Some(WsErrorFrame::new("protocol", format!("invalid signaling message: {}", e)).to_json())
                    }
                };
                if let Some(reply) = reply {
                    if ws_tx.send(Message::Text(reply.into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    }

    if let Some(peer) = peer_id {
        service.remove_peer(&peer).await;
    }
    state.resources.release_webrtc(&session.udid, &client_id);
}

async fn signaling_reply(
    state: &AppState,
    service: &crate::capture::WebRtcService,
    peer_id: &mut Option<String>,
    ice_tx: &mpsc::Sender<webrtc::ice_transport::ice_candidate::RTCIceCandidateInit>,
    msg: SignalingMessage,
) -> Option<String> {
    match msg {
        SignalingMessage::StartStream { quality, fps } => {
            let quality = quality.unwrap_or(state.config.default_quality);
            let fps = fps.unwrap_or(state.config.default_fps);
            service.video().set_quality(quality);
            service.video().set_fps(fps);
            Some(
                serde_json::json!({
                    "type": "stream-ready",
                    "quality": quality,
                    "fps": fps,
                })
                .to_string(),
            )
        }
        SignalingMessage::Offer { sdp } => {
            let (new_peer, mut peer_ice) = match service.create_peer_connection().await {
                Ok(created) => created,
                Err(e) => return Some(WsErrorFrame::new(e.kind(), e.to_string()).to_json()),
            };
            let forward = ice_tx.clone();
            tokio::spawn(async move {
                while let Some(candidate) = peer_ice.recv().await {
                    if forward.send(candidate).await.is_err() {
                        break;
                    }
                }
            });
            match service.handle_offer(&new_peer, &sdp).await {
                Ok(answer) => {
                    // Replace any previous peer for this socket.
                    if let Some(old) = peer_id.replace(new_peer.clone()) {
                        service.remove_peer(&old).await;
                    }
                    Some(
                        serde_json::json!({
                            "type": "answer",
                            "sdp": answer,
                            "connection_id": new_peer,
                        })
                        .to_string(),
                    )
                }
                Err(e) => {
                    service.remove_peer(&new_peer).await;
                    Some(WsErrorFrame::new(e.kind(), e.to_string()).to_json())
                }
            }
        }
        SignalingMessage::Answer { .. } => {
            // The server is always the answerer; a client answer is a
            // protocol violation worth reporting but not fatal.
            Some(WsErrorFrame::new("protocol", "unexpected answer from client").to_json())
        }
        SignalingMessage::IceCandidate { candidate } => match peer_id.as_deref() {
            Some(peer) => match service.add_ice_candidate(peer, candidate).await {
                Ok(()) => None,
                Err(e) => Some(WsErrorFrame::new(e.kind(), e.to_string()).to_json()),
            },
            None => {
                Some(WsErrorFrame::new("bad-state", "no peer connection established").to_json())
            }
        },
        SignalingMessage::QualityChange { quality } => {
            service.video().set_quality(quality);
            Some(serde_json::json!({ "type": "quality-changed", "quality": quality }).to_string())
        }
        SignalingMessage::FpsChange { fps } => {
            service.video().set_fps(fps);
            Some(serde_json::json!({ "type": "fps-changed", "fps": service.video().fps() }).to_string())
        }
        SignalingMessage::GetStatus => Some(
            serde_json::json!({
                "type": "status",
                "data": service.video().status(),
            })
            .to_string(),
        ),
        SignalingMessage::StopStream => {
            if let Some(peer) = peer_id.take() {
                service.remove_peer(&peer).await;
            }
            Some(serde_json::json!({ "type": "stream-stopped" }).to_string())
        }
    }
}

// ---------------------------------------------------------------------------
// Screenshot pull
// ---------------------------------------------------------------------------

pub(super) async fn ws_screenshot(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_screenshot(socket, state, session_id, addr))
}

async fn handle_screenshot(
    socket: WebSocket,
    state: AppState,
    session_id: String,
    addr: SocketAddr,
) {
    let Some((socket, session, _guard)) = open_connection(
        socket,
        &state,
        &session_id,
        ConnectionKind::Screenshot,
        &addr,
    )
    .await
    else {
        return;
    };
    let (mut ws_tx, mut ws_rx) = socket.split();

    while let Some(msg) = ws_rx.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => continue,
        };
        let reply = match serde_json::from_str::<ScreenshotRequest>(&text) {
            Ok(ScreenshotRequest::Refresh) => capture_reply(&state, &session).await,
            Ok(ScreenshotRequest::Tap { x, y }) => {
                let tapped = async {
                    let _device = state.driver.lock_device(&session.udid).await?;
                    state.driver.tap(&session.udid, x, y).await
                }
                .await;
                match tapped {
                    // A tap implies a refresh so the client sees its effect.
                    Ok(()) => capture_reply(&state, &session).await,
                    Err(e) => WsErrorFrame::new(e.kind(), e.to_string()).to_json(),
                }
            }
            Err(e) => {
                WsErrorFrame::new("protocol", format!("invalid screenshot request: {}", e))
                    .to_json()
            }
        };
        if ws_tx.send(Message::Text(reply.into())).await.is_err() {
            break;
        }
    }
}

async fn capture_reply(state: &AppState, session: &Session) -> String {
    match state.driver.screenshot(&session.udid).await {
        Ok(png) => {
            let (width, height) = png_dimensions(&png)
                .unwrap_or((session.pixel_width, session.pixel_height));
            let message = ScreenshotMessage {
                kind: "screenshot",
                data: base64_encode(&png),
                width,
                height,
            };
            serde_json::to_string(&message)
                .unwrap_or_else(|_| WsErrorFrame::new("internal", "encode failed").to_json())
        }
        Err(e) => WsErrorFrame::new(e.kind(), e.to_string()).to_json(),
    }
}

fn png_dimensions(png: &[u8]) -> Option<(u32, u32)> {
    image::ImageReader::new(std::io::Cursor::new(png))
        .with_guessed_format()
        .ok()?
        .into_dimensions()
        .ok()
}

// ---------------------------------------------------------------------------
// Log streaming
// ---------------------------------------------------------------------------

pub(super) async fn ws_logs(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_logs(socket, state, session_id, addr))
}

async fn handle_logs(socket: WebSocket, state: AppState, session_id: String, addr: SocketAddr) {
    let Some((socket, session, _guard)) =
        open_connection(socket, &state, &session_id, ConnectionKind::Logs, &addr).await
    else {
        return;
    };

    let mut child = match state.driver.spawn_log_stream(&session.udid) {
        Ok(child) => child,
        Err(e) => {
            close_with(socket, CLOSE_SESSION_INVALID, "log stream unavailable").await;
            tracing::error!(session = %session_id, error = %e, "log stream spawn failed");
            return;
        }
    };
    let stdout = match child.stdout.take() {
        Some(stdout) => stdout,
        None => {
            let _ = child.start_kill();
            close_with(socket, CLOSE_SESSION_INVALID, "log stream unavailable").await;
            return;
        }
    };
    let mut lines = tokio::io::BufReader::new(stdout).lines();

    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut level_filter: Option<String> = None;
    let mut text_filter: Option<String> = None;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        let entry = LogEntry::parse(line);
                        if !entry.matches(level_filter.as_deref(), text_filter.as_deref()) {
                            continue;
                        }
                        let Ok(json) = serde_json::to_string(&entry) else { continue };
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) | Err(_) => {
                        tracing::debug!(session = %session_id, "log stream ended");
                        break;
                    }
                }
            }
            inbound = ws_rx.next() => {
                let text = match inbound {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    _ => continue,
                };
                match serde_json::from_str::<LogRequest>(&text) {
                    Ok(LogRequest::Filter { level, filter }) => {
                        level_filter = level.clone();
                        text_filter = filter.clone();
                        let ack = serde_json::json!({
                            "type": "filter_applied",
                            "level": level.unwrap_or_else(|| "all".to_string()),
                            "filter": filter.unwrap_or_default(),
                        });
                        if ws_tx.send(Message::Text(ack.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(LogRequest::Clear) => {
                        let echo = serde_json::json!({ "type": "clear" });
                        if ws_tx.send(Message::Text(echo.to_string().into())).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        let err = WsErrorFrame::new("protocol", format!("invalid log request: {}", e)).to_json();
                        if ws_tx.send(Message::Text(err.into())).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    // Structured ownership: the log child never outlives its connection.
    let _ = child.start_kill();
    let _ = child.wait().await;
}
