//! Wire types for the WebSocket endpoints.
//!
//! Every message is JSON with a string tag. The field names here are part of
//! the compatibility contract with existing clients and must not change.

use serde::{Deserialize, Serialize};

use crate::capture::Quality;

// ---------------------------------------------------------------------------
// Control channel
// ---------------------------------------------------------------------------

/// Inbound control message, tagged by `t`.
///
/// Coordinates are logical points, not pixels. Text is forwarded to the
/// device as-is; composed characters split across messages are not rejoined.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ControlMessage {
    Tap {
        x: f64,
        y: f64,
    },
    Swipe {
        start_x: f64,
        start_y: f64,
        end_x: f64,
        end_y: f64,
        duration: Option<f64>,
    },
    Button {
        button: DeviceButton,
    },
    Key {
        key: String,
        duration: Option<f64>,
    },
    Text {
        text: String,
    },
}

impl ControlMessage {
    /// Tag string as it appears on the wire, echoed back in acknowledgments.
    pub fn tag(&self) -> &'static str {
        match self {
            ControlMessage::Tap { .. } => "tap",
            ControlMessage::Swipe { .. } => "swipe",
            ControlMessage::Button { .. } => "button",
            ControlMessage::Key { .. } => "key",
            ControlMessage::Text { .. } => "text",
        }
    }
}

/// Hardware buttons addressable through the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceButton {
    Home,
    Lock,
    Siri,
    SideButton,
    ApplePay,
    VolumeUp,
    VolumeDown,
    Shake,
}

impl DeviceButton {
    /// Button name understood by `idb ui button`.
    pub fn tool_name(&self) -> &'static str {
        match self {
            DeviceButton::Home => "HOME",
            DeviceButton::Lock => "LOCK",
            DeviceButton::Siri => "SIRI",
            DeviceButton::SideButton => "SIDE_BUTTON",
            DeviceButton::ApplePay => "APPLE_PAY",
            DeviceButton::VolumeUp => "VOLUME_UP",
            DeviceButton::VolumeDown => "VOLUME_DOWN",
            DeviceButton::Shake => "SHAKE",
        }
    }
}

// ---------------------------------------------------------------------------
// Video frame push
// ---------------------------------------------------------------------------

/// Outbound frame message for `/ws/{session}/video` and the ultra-low-latency
/// variant. `data` is base64 JPEG; `frame` is the capture-service sequence
/// number (gaps indicate drops); `timestamp` is the capture time in
/// milliseconds since the Unix epoch.
#[derive(Debug, Serialize)]
pub struct VideoFrameMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: String,
    pub pixel_width: u32,
    pub pixel_height: u32,
    pub point_width: u32,
    pub point_height: u32,
    pub frame: u64,
    pub timestamp: u64,
    pub fps: u32,
    pub format: &'static str,
}

// ---------------------------------------------------------------------------
// WebRTC signaling
// ---------------------------------------------------------------------------

/// Inbound signaling messages for `/ws/{session}/webrtc`, tagged by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    StartStream {
        quality: Option<Quality>,
        fps: Option<u32>,
    },
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        #[serde(flatten)]
        candidate: serde_json::Value,
    },
    QualityChange {
        quality: Quality,
    },
    FpsChange {
        fps: u32,
    },
    GetStatus,
    StopStream,
}

// ---------------------------------------------------------------------------
// Screenshot pull
// ---------------------------------------------------------------------------

/// Inbound messages for the pull-model screenshot socket. A tap causes an
/// implicit refresh after execution.
#[derive(Debug, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum ScreenshotRequest {
    Refresh,
    Tap { x: f64, y: f64 },
}

#[derive(Debug, Serialize)]
pub struct ScreenshotMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub data: String,
    pub width: u32,
    pub height: u32,
}

// ---------------------------------------------------------------------------
// Log streaming
// ---------------------------------------------------------------------------

/// Inbound messages on the log socket, tagged by `type`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LogRequest {
    Filter {
        level: Option<String>,
        filter: Option<String>,
    },
    Clear,
}

/// A structured log entry parsed from the device log stream.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub timestamp: String,
    pub process: String,
    pub pid: String,
    pub level: String,
    pub message: String,
    pub raw_line: String,
}

impl LogEntry {
    /// Parse a `log stream --style compact` line into a structured entry.
    ///
    /// Lines that don't match the expected shape are passed through with the
    /// whole line as the message.
    pub fn parse(line: &str) -> Self {
        let parts: Vec<&str> = line.splitn(4, ' ').collect();
        if parts.len() >= 4 {
            let timestamp = format!("{} {}", parts[0], parts[1]);
            let process_info = parts[2];
            let message = parts[3].to_string();

            let (process, pid) = match process_info.split_once('[') {
                Some((name, rest)) => (
                    name.to_string(),
                    rest.trim_end_matches(']').to_string(),
                ),
                None => (process_info.to_string(), String::new()),
            };

            let lower = message.to_lowercase();
            let level = if lower.contains("error") || message.contains("<Error>") {
                "error"
            } else if lower.contains("warning") || message.contains("<Warning>") {
                "warning"
            } else if lower.contains("debug") || message.contains("<Debug>") {
                "debug"
            } else {
                "info"
            };

            LogEntry {
                kind: "log",
                timestamp,
                process,
                pid,
                level: level.to_string(),
                message,
                raw_line: line.to_string(),
            }
        } else {
            LogEntry {
                kind: "log",
                timestamp: String::new(),
                process: "unknown".to_string(),
                pid: String::new(),
                level: "info".to_string(),
                message: line.to_string(),
                raw_line: line.to_string(),
            }
        }
    }

    /// Apply a per-connection predicate: level match plus substring filter.
    pub fn matches(&self, level: Option<&str>, filter: Option<&str>) -> bool {
        if let Some(level) = level {
            if level != "all" && self.level != level {
                return false;
            }
        }
        if let Some(filter) = filter {
            if !filter.is_empty() && !self.raw_line.contains(filter) {
                return false;
            }
        }
        true
    }
}

// ---------------------------------------------------------------------------
// Error frames
// ---------------------------------------------------------------------------

/// Outbound error frame sent on any WebSocket without closing the socket.
#[derive(Debug, Serialize)]
pub struct WsErrorFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub error: &'static str,
    pub message: String,
}

impl WsErrorFrame {
    pub fn new(error_kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind: "error",
            error: error_kind,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            r#"{"type":"error","error":"internal","message":"serialization failed"}"#.to_string()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_message_decodes() {
        let msg: ControlMessage = serde_json::from_str(r#"{"t":"tap","x":100,"y":200}"#).unwrap();
        match msg {
            ControlMessage::Tap { x, y } => {
                assert_eq!(x, 100.0);
                assert_eq!(y, 200.0);
            }
            other => panic!("expected tap, got {:?}", other),
        }
        assert_eq!(msg_tag(r#"{"t":"tap","x":1,"y":2}"#), "tap");
    }

    fn msg_tag(json: &str) -> &'static str {
        serde_json::from_str::<ControlMessage>(json).unwrap().tag()
    }

    #[test]
    fn swipe_duration_optional() {
        let msg: ControlMessage = serde_json::from_str(
            r#"{"t":"swipe","start_x":0,"start_y":0,"end_x":100,"end_y":300}"#,
        )
        .unwrap();
        match msg {
            ControlMessage::Swipe { duration, .. } => assert!(duration.is_none()),
            other => panic!("expected swipe, got {:?}", other),
        }
    }

    #[test]
    fn button_names_are_kebab_case() {
        let msg: ControlMessage =
            serde_json::from_str(r#"{"t":"button","button":"side-button"}"#).unwrap();
        match msg {
            ControlMessage::Button { button } => {
                assert_eq!(button, DeviceButton::SideButton);
                assert_eq!(button.tool_name(), "SIDE_BUTTON");
            }
            other => panic!("expected button, got {:?}", other),
        }
        let msg: ControlMessage =
            serde_json::from_str(r#"{"t":"button","button":"volume-up"}"#).unwrap();
        match msg {
            ControlMessage::Button { button } => assert_eq!(button, DeviceButton::VolumeUp),
            other => panic!("expected button, got {:?}", other),
        }
    }

    #[test]
    fn unknown_button_rejected() {
        let result = serde_json::from_str::<ControlMessage>(r#"{"t":"button","button":"eject"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_tag_rejected() {
        let result = serde_json::from_str::<ControlMessage>(r#"{"t":"pinch","x":1,"y":2}"#);
        assert!(result.is_err());
    }

    #[test]
    fn video_frame_field_names() {
        let msg = VideoFrameMessage {
            kind: "video_frame",
            data: "aGVsbG8=".into(),
            pixel_width: 1179,
            pixel_height: 2556,
            point_width: 393,
            point_height: 852,
            frame: 7,
            timestamp: 1_700_000_000_000,
            fps: 58,
            format: "jpeg",
        };
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "video_frame");
        assert_eq!(json["pixel_width"], 1179);
        assert_eq!(json["point_height"], 852);
        assert_eq!(json["frame"], 7);
        assert_eq!(json["format"], "jpeg");
    }

    #[test]
    fn signaling_tags_are_kebab_case() {
        let msg: SignalingMessage =
            serde_json::from_str(r#"{"type":"start-stream","quality":"high","fps":60}"#).unwrap();
        match msg {
            SignalingMessage::StartStream { quality, fps } => {
                assert_eq!(quality, Some(Quality::High));
                assert_eq!(fps, Some(60));
            }
            other => panic!("expected start-stream, got {:?}", other),
        }

        let msg: SignalingMessage =
            serde_json::from_str(r#"{"type":"ice-candidate","candidate":"cand","sdpMid":"0"}"#)
                .unwrap();
        assert!(matches!(msg, SignalingMessage::IceCandidate { .. }));
    }

    #[test]
    fn screenshot_refresh_decodes() {
        let msg: ScreenshotRequest = serde_json::from_str(r#"{"t":"refresh"}"#).unwrap();
        assert!(matches!(msg, ScreenshotRequest::Refresh));
    }

    #[test]
    fn log_entry_parses_compact_line() {
        let entry = LogEntry::parse(
            "2024-05-01 12:00:01.123 SpringBoard[431] <Error>: something failed",
        );
        assert_eq!(entry.process, "SpringBoard");
        assert_eq!(entry.pid, "431");
        assert_eq!(entry.level, "error");
        assert!(entry.message.contains("something failed"));
    }

    #[test]
    fn log_entry_passthrough_for_short_lines() {
        let entry = LogEntry::parse("boot");
        assert_eq!(entry.process, "unknown");
        assert_eq!(entry.message, "boot");
    }

    #[test]
    fn log_filter_predicate() {
        let entry = LogEntry::parse(
            "2024-05-01 12:00:01.123 MyApp[100] <Warning>: cache miss on startup",
        );
        assert!(entry.matches(Some("warning"), None));
        assert!(!entry.matches(Some("error"), None));
        assert!(entry.matches(Some("all"), Some("cache miss")));
        assert!(!entry.matches(None, Some("no such text")));
    }

    #[test]
    fn error_frame_shape() {
        let frame = WsErrorFrame::new("busy", "device is busy");
        let json: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["error"], "busy");
        assert_eq!(json["message"], "device is busy");
    }
}
