//! Control protocol between the viewing client and the server.
//!
//! Every inbound message is a `{"name": ..., "payload": ...}` pair with an
//! optional `ack` correlation id; when `ack` is present the server sends back
//! exactly one `{"ack": ..., "payload": ...}` reply. Outbound events (frames,
//! pongs, settings echoes) use the same name/payload shape without an ack.
//! Message names are kebab-case, payload fields camelCase.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::presets::{ConnectionClass, DeviceClass};

/// Inbound message envelope: a tagged command plus the optional ack id.
#[derive(Debug, Clone)]
pub struct ClientEnvelope {
    pub command: ClientCommand,
    pub ack: Option<u64>,
}

/// The envelope is deserialized in two steps (raw name/payload, then the
/// tagged command) so the sibling `ack` field never interferes with the
/// enum's own tagging.
impl<'de> serde::Deserialize<'de> for ClientEnvelope {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct RawEnvelope {
            name: String,
            #[serde(default)]
            payload: serde_json::Value,
            #[serde(default)]
            ack: Option<u64>,
        }

        let raw = RawEnvelope::deserialize(deserializer)?;
        let tagged = if raw.payload.is_null() {
            serde_json::json!({"name": raw.name})
        } else {
            serde_json::json!({"name": raw.name, "payload": raw.payload})
        };
        let command = serde_json::from_value(tagged).map_err(serde::de::Error::custom)?;
        Ok(ClientEnvelope {
            command,
            ack: raw.ack,
        })
    }
}

/// Commands a client may send over the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "name", content = "payload", rename_all = "kebab-case")]
pub enum ClientCommand {
    /// Bind a browser to this socket and start the stream.
    Init(InitRequest),
    Navigate(NavigateRequest),
    Action(ActionRequest),
    Resize(ResizeRequest),
    Status,
    StreamSettings(SettingsRequest),
    StreamControl(ControlRequest),
    LatencyReport(LatencyReport),
    /// Keepalive; the payload is an opaque client timestamp echoed back.
    Ping(u64),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InitRequest {
    pub url: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<u32>,
    pub quality: Option<u32>,
    pub adaptive_bitrate: Option<bool>,
    pub connection_quality: Option<ConnectionClass>,
    pub device_class: Option<DeviceClass>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavigateRequest {
    pub url: String,
}

/// Raw action request. The verb set is closed (see [`InputAction`]) but the
/// request keeps the verb as a string so the router can intercept
/// `getCurrentUrl` — answered from pool state, never dispatched as input —
/// and reject unknown verbs with a useful error instead of a parse failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub action: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

impl ActionRequest {
    /// Handled in the router without entering the input dispatch.
    pub const GET_CURRENT_URL: &'static str = "getCurrentUrl";

    /// Parse into the closed input-action set. Unknown verbs and malformed
    /// params surface as the serde error.
    pub fn parse(&self) -> Result<InputAction, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "action": self.action,
            "params": self.params,
        }))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResizeRequest {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsRequest {
    pub fps: Option<u32>,
    pub quality: Option<u32>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub adaptive_bitrate: Option<bool>,
    pub connection_quality: Option<ConnectionClass>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ControlRequest {
    pub streaming: bool,
}

/// Client-measured frame age in milliseconds. Client and server clocks are
/// unsynchronised, so this is a drift-biased hint, not a latency metric.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LatencyReport {
    pub latency: f64,
}

/// The closed set of input verbs replayed into a browser instance.
///
/// `mouseDown`/`mouseUp` may omit coordinates; the driver then presses at the
/// last known pointer position. `scroll` is absolute, `scrollBy` relative;
/// both are CSS pixels in the page viewport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", content = "params", rename_all = "camelCase")]
pub enum InputAction {
    Click { x: f64, y: f64 },
    DoubleClick { x: f64, y: f64 },
    MouseDown {
        button: PointerButton,
        #[serde(default)]
        x: Option<f64>,
        #[serde(default)]
        y: Option<f64>,
    },
    MouseUp { button: PointerButton },
    MouseMove { x: f64, y: f64 },
    Type { text: String },
    Key { key: String },
    KeyDown { key: String },
    KeyUp { key: String },
    Scroll { x: f64, y: f64 },
    ScrollBy { x: f64, y: f64 },
    Hover { text: String },
    Reload,
    GoBack,
    GoForward,
}

impl InputAction {
    /// Wire name of the verb, for logs and error messages.
    pub fn verb(&self) -> &'static str {
        match self {
            InputAction::Click { .. } => "click",
            InputAction::DoubleClick { .. } => "doubleClick",
            InputAction::MouseDown { .. } => "mouseDown",
            InputAction::MouseUp { .. } => "mouseUp",
            InputAction::MouseMove { .. } => "mouseMove",
            InputAction::Type { .. } => "type",
            InputAction::Key { .. } => "key",
            InputAction::KeyDown { .. } => "keyDown",
            InputAction::KeyUp { .. } => "keyUp",
            InputAction::Scroll { .. } => "scroll",
            InputAction::ScrollBy { .. } => "scrollBy",
            InputAction::Hover { .. } => "hover",
            InputAction::Reload => "reload",
            InputAction::GoBack => "goBack",
            InputAction::GoForward => "goForward",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PointerButton {
    Left,
    Right,
    Middle,
}

/// Server-to-client events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "name", content = "payload", rename_all = "kebab-case")]
pub enum ServerEvent {
    Frame(Frame),
    Pong(u64),
    StreamSettingsUpdated(SettingsUpdated),
}

/// One emitted frame. `timestamp` is producer-monotonic milliseconds; frames
/// on a single socket carry non-decreasing timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    /// Base64 of the zlib-compressed raster bytes (see [`crate::codec`]).
    pub image: String,
    pub is_keyframe: bool,
    pub quality: u32,
    pub timestamp: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsUpdated {
    pub settings: StreamSettings,
}

/// The effective stream settings echoed back after every update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSettings {
    pub fps: u32,
    pub quality: u32,
    pub adaptive_bitrate: bool,
}

/// Reply to an acked request.
#[derive(Debug, Clone, Serialize)]
pub struct AckReply {
    pub ack: u64,
    pub payload: serde_json::Value,
}

/// Anything the server writes to the socket.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Outbound {
    Event(ServerEvent),
    Ack(AckReply),
}

// --- Typed ack payloads ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitAck {
    pub success: bool,
    pub browser_id: Uuid,
}

/// Uniform failure ack; `success` is always false.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorAck {
    pub success: bool,
    pub error: String,
}

impl ErrorAck {
    pub fn new(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NavigateAck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionAck {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ResizeAck {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusAck {
    pub connected: bool,
    pub browser_id: Option<Uuid>,
    pub active_browsers: usize,
    pub all_browser_ids: Vec<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamSnapshot>,
}

/// Point-in-time view of a socket's stream state, for `status` replies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamSnapshot {
    pub active: bool,
    pub fps: u32,
    pub quality: u32,
    pub frame_count: u64,
    pub bytes_sent: u64,
    pub connection_class: ConnectionClass,
    pub device_class: DeviceClass,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettingsAck {
    pub success: bool,
    pub settings: StreamSettings,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ControlAck {
    pub success: bool,
    pub streaming: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_envelope_with_ack() {
        let json = r#"{
            "name": "init",
            "payload": {"url": "https://example.com", "fps": 24, "adaptiveBitrate": true},
            "ack": 1
        }"#;
        let env: ClientEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.ack, Some(1));
        match env.command {
            ClientCommand::Init(init) => {
                assert_eq!(init.url.as_deref(), Some("https://example.com"));
                assert_eq!(init.fps, Some(24));
                assert_eq!(init.adaptive_bitrate, Some(true));
                assert!(init.quality.is_none());
            }
            other => panic!("expected Init, got {other:?}"),
        }
    }

    #[test]
    fn status_has_no_payload() {
        let env: ClientEnvelope = serde_json::from_str(r#"{"name": "status", "ack": 7}"#).unwrap();
        assert!(matches!(env.command, ClientCommand::Status));
        assert_eq!(env.ack, Some(7));
    }

    #[test]
    fn ping_carries_opaque_timestamp() {
        let env: ClientEnvelope =
            serde_json::from_str(r#"{"name": "ping", "payload": 1712000000123}"#).unwrap();
        match env.command {
            ClientCommand::Ping(t0) => assert_eq!(t0, 1712000000123),
            other => panic!("expected Ping, got {other:?}"),
        }
        assert!(env.ack.is_none());
    }

    #[test]
    fn message_names_are_kebab_case() {
        let settings = ClientCommand::StreamSettings(SettingsRequest {
            quality: Some(50),
            ..Default::default()
        });
        let json = serde_json::to_string(&settings).unwrap();
        assert!(json.contains(r#""name":"stream-settings""#));
        assert!(!json.contains("stream_settings"));

        let control = ClientCommand::StreamControl(ControlRequest { streaming: false });
        let json = serde_json::to_string(&control).unwrap();
        assert!(json.contains(r#""name":"stream-control""#));

        let report = ClientCommand::LatencyReport(LatencyReport { latency: 42.0 });
        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains(r#""name":"latency-report""#));
    }

    #[test]
    fn action_request_parses_closed_verbs() {
        let req = ActionRequest {
            action: "doubleClick".to_string(),
            params: serde_json::json!({"x": 10.0, "y": 20.5}),
        };
        match req.parse().unwrap() {
            InputAction::DoubleClick { x, y } => {
                assert_eq!(x, 10.0);
                assert_eq!(y, 20.5);
            }
            other => panic!("expected DoubleClick, got {other:?}"),
        }
    }

    #[test]
    fn action_request_rejects_unknown_verb() {
        let req = ActionRequest {
            action: "teleport".to_string(),
            params: serde_json::Value::Null,
        };
        assert!(req.parse().is_err());
    }

    #[test]
    fn mouse_down_coords_are_optional() {
        let req = ActionRequest {
            action: "mouseDown".to_string(),
            params: serde_json::json!({"button": "left"}),
        };
        match req.parse().unwrap() {
            InputAction::MouseDown { button, x, y } => {
                assert_eq!(button, PointerButton::Left);
                assert!(x.is_none() && y.is_none());
            }
            other => panic!("expected MouseDown, got {other:?}"),
        }
    }

    #[test]
    fn navigation_verbs_need_no_params() {
        for verb in ["reload", "goBack", "goForward"] {
            let req = ActionRequest {
                action: verb.to_string(),
                params: serde_json::Value::Null,
            };
            let action = req.parse().unwrap_or_else(|e| panic!("{verb}: {e}"));
            assert_eq!(action.verb(), verb);
        }
    }

    #[test]
    fn frame_event_wire_shape() {
        let event = ServerEvent::Frame(Frame {
            image: "eJzLSM3JyQcABiwCFQ==".to_string(),
            is_keyframe: true,
            quality: 80,
            timestamp: 1234,
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""name":"frame""#));
        assert!(json.contains(r#""isKeyframe":true"#));
        assert!(json.contains(r#""quality":80"#));
        assert!(json.contains(r#""timestamp":1234"#));
        // No MIME prefix on the wire — the client adds it after inflating
        assert!(!json.contains("data:image"));
    }

    #[test]
    fn settings_updated_event_wire_shape() {
        let event = ServerEvent::StreamSettingsUpdated(SettingsUpdated {
            settings: StreamSettings {
                fps: 30,
                quality: 80,
                adaptive_bitrate: true,
            },
        });
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""name":"stream-settings-updated""#));
        assert!(json.contains(r#""adaptiveBitrate":true"#));
    }

    #[test]
    fn ack_reply_wire_shape() {
        let reply = Outbound::Ack(AckReply {
            ack: 9,
            payload: serde_json::to_value(ResizeAck { success: true }).unwrap(),
        });
        let json = serde_json::to_string(&reply).unwrap();
        assert_eq!(json, r#"{"ack":9,"payload":{"success":true}}"#);
    }

    #[test]
    fn pong_event_echoes_payload() {
        let json = serde_json::to_string(&Outbound::Event(ServerEvent::Pong(77))).unwrap();
        assert_eq!(json, r#"{"name":"pong","payload":77}"#);
    }

    #[test]
    fn error_ack_always_fails() {
        let ack = ErrorAck::new("browser not found");
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains(r#""success":false"#));
        assert!(json.contains("browser not found"));
    }

    #[test]
    fn status_ack_omits_missing_stream() {
        let ack = StatusAck {
            connected: true,
            browser_id: None,
            active_browsers: 0,
            all_browser_ids: vec![],
            stream: None,
        };
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains(r#""browserId":null"#));
        assert!(!json.contains("stream"));
    }
}
