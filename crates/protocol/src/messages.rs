use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Modifier snapshot attached to forwarded key and click events.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Modifiers {
    pub shift: bool,
    pub control: bool,
    pub alt: bool,
    pub meta: bool,
    pub caps_lock: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyDirection {
    Down,
    Up,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Middle,
    Right,
}

impl MouseButton {
    /// Map a DOM-style button index (0=left, 1=middle, 2=right).
    pub fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::Left),
            1 => Some(Self::Middle),
            2 => Some(Self::Right),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenRequest {
    pub to: String,
    pub from: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteKey {
    pub to: String,
    #[serde(rename = "type")]
    pub direction: KeyDirection,
    pub key: String,
    pub code: String,
    pub key_code: u32,
    pub modifiers: Modifiers,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMouseMove {
    pub to: String,
    pub x: f64,
    pub y: f64,
    pub screen_width: u32,
    pub screen_height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMouseClick {
    pub to: String,
    pub button: MouseButton,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub modifiers: Option<Modifiers>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteMouseScroll {
    pub to: String,
    pub delta_y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodeAuth {
    pub code: String,
}

/// Password authentication request.
/// Password is redacted in Debug output to prevent accidental logging.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordAuth {
    pub machine_id: String,
    pub password: String,
}

impl std::fmt::Debug for PasswordAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordAuth")
            .field("machine_id", &self.machine_id)
            .field("password", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectRequest {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingControl {
    pub to: String,
}

/// Events the viewer sends to the relay.
///
/// Wire form is one JSON object per WebSocket text frame:
/// `{"event": "<kebab-case-name>", "data": <payload>}`. Payload-less events
/// omit `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum ClientEvent {
    ConnectToHost(String),
    RequestScreen(ScreenRequest),
    RemoteKeyEvent(RemoteKey),
    RemoteMouseMove(RemoteMouseMove),
    RemoteMouseClick(RemoteMouseClick),
    RemoteMouseScroll(RemoteMouseScroll),
    ConnectWithCode(CodeAuth),
    ConnectWithPassword(PasswordAuth),
    ClientDisconnectRequest(DisconnectRequest),
    /// Ask the host to record its own screen.
    StartRecording(RecordingControl),
    StopRecording(RecordingControl),
    KeepAlive,
}

impl ClientEvent {
    /// Wire name, used for logging without dumping payloads.
    pub fn name(&self) -> &'static str {
        match self {
            Self::ConnectToHost(_) => "connect-to-host",
            Self::RequestScreen(_) => "request-screen",
            Self::RemoteKeyEvent(_) => "remote-key-event",
            Self::RemoteMouseMove(_) => "remote-mouse-move",
            Self::RemoteMouseClick(_) => "remote-mouse-click",
            Self::RemoteMouseScroll(_) => "remote-mouse-scroll",
            Self::ConnectWithCode(_) => "connect-with-code",
            Self::ConnectWithPassword(_) => "connect-with-password",
            Self::ClientDisconnectRequest(_) => "client-disconnect-request",
            Self::StartRecording(_) => "start-recording",
            Self::StopRecording(_) => "stop-recording",
            Self::KeepAlive => "keep-alive",
        }
    }

    pub fn to_wire(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(WireError::Encode)
    }
}

/// Discovery record broadcast by a reachable host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostInfo {
    #[serde(alias = "hostId")]
    pub id: String,
    #[serde(default, alias = "hostName")]
    pub name: String,
    /// Anything else the host announces (OS, version, ...), kept verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostGone {
    #[serde(alias = "hostId")]
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenData {
    pub image_data: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedHost {
    #[serde(alias = "id")]
    pub host_id: String,
    #[serde(default, alias = "name")]
    pub host_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingStatus {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingComplete {
    pub recording_id: String,
    pub duration: f64,
    pub file_size: u64,
    pub file_path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordSet {
    pub host_id: String,
    pub machine_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PasswordAuthResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
}

/// Events the relay (or a host through it) delivers to the viewer.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum RelayEvent {
    HostAvailable(HostInfo),
    HostUnavailable(HostGone),
    ScreenData(ScreenData),
    CodeAccepted(AcceptedHost),
    CodeRejected(Rejection),
    ConnectionAccepted(AcceptedHost),
    ConnectionRejected,
    HostDisconnectAck,
    RecordingStatus(RecordingStatus),
    RecordingComplete(RecordingComplete),
    PasswordSetNotification(PasswordSet),
    PasswordAuthResponse(PasswordAuthResponse),
}

/// Loose envelope used for decoding. Relays are inconsistent about payloads
/// on bare events (`null`, `{}`, or missing), so `data` is parsed per event.
#[derive(Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    data: Value,
}

impl RelayEvent {
    /// Decode one text frame from the relay.
    ///
    /// Returns `Ok(None)` for well-formed frames naming an event this client
    /// does not handle.
    pub fn from_wire(text: &str) -> Result<Option<Self>, WireError> {
        let envelope: Envelope = serde_json::from_str(text).map_err(WireError::Envelope)?;
        let data = match envelope.data {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other,
        };
        let event = envelope.event;

        fn payload<T: serde::de::DeserializeOwned>(event: &str, data: Value) -> Result<T, WireError> {
            serde_json::from_value(data).map_err(|source| WireError::Payload {
                event: event.to_string(),
                source,
            })
        }

        let parsed = match event.as_str() {
            "host-available" => Self::HostAvailable(payload(&event, data)?),
            "host-unavailable" => Self::HostUnavailable(payload(&event, data)?),
            "screen-data" => Self::ScreenData(payload(&event, data)?),
            "code-accepted" => Self::CodeAccepted(payload(&event, data)?),
            "code-rejected" => Self::CodeRejected(payload(&event, data)?),
            "connection-accepted" => Self::ConnectionAccepted(payload(&event, data)?),
            "connection-rejected" => Self::ConnectionRejected,
            "host-disconnect-ack" => Self::HostDisconnectAck,
            "recording-status" => Self::RecordingStatus(payload(&event, data)?),
            "recording-complete" => Self::RecordingComplete(payload(&event, data)?),
            "password-set-notification" => Self::PasswordSetNotification(payload(&event, data)?),
            "password-auth-response" => Self::PasswordAuthResponse(payload(&event, data)?),
            _ => return Ok(None),
        };
        Ok(Some(parsed))
    }

    pub fn to_wire(&self) -> Result<String, WireError> {
        serde_json::to_string(self).map_err(WireError::Encode)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("malformed payload for '{event}': {source}")]
    Payload {
        event: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode event: {0}")]
    Encode(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_event_envelope_is_kebab_case() {
        let msg = ClientEvent::ConnectWithCode(CodeAuth {
            code: "482913".to_string(),
        });
        let json = msg.to_wire().unwrap();
        assert!(json.contains(r#""event":"connect-with-code""#));
        assert!(json.contains(r#""data":{"code":"482913"}"#));
    }

    #[test]
    fn keep_alive_has_no_payload() {
        let json = ClientEvent::KeepAlive.to_wire().unwrap();
        assert_eq!(json, r#"{"event":"keep-alive"}"#);
    }

    #[test]
    fn connect_to_host_payload_is_bare_id() {
        let json = ClientEvent::ConnectToHost("h1".to_string()).to_wire().unwrap();
        assert_eq!(json, r#"{"event":"connect-to-host","data":"h1"}"#);
    }

    #[test]
    fn remote_key_event_field_names() {
        let msg = ClientEvent::RemoteKeyEvent(RemoteKey {
            to: "h1".to_string(),
            direction: KeyDirection::Down,
            key: "A".to_string(),
            code: "KeyA".to_string(),
            key_code: 65,
            modifiers: Modifiers {
                shift: true,
                caps_lock: true,
                ..Modifiers::default()
            },
        });
        let json = msg.to_wire().unwrap();
        assert!(json.contains(r#""event":"remote-key-event""#));
        assert!(json.contains(r#""type":"down""#));
        assert!(json.contains(r#""keyCode":65"#));
        assert!(json.contains(r#""capsLock":true"#));
        assert!(json.contains(r#""shift":true"#));
        assert!(json.contains(r#""control":false"#));
    }

    #[test]
    fn mouse_events_field_names() {
        let mv = ClientEvent::RemoteMouseMove(RemoteMouseMove {
            to: "h1".to_string(),
            x: 640.0,
            y: 360.0,
            screen_width: 1280,
            screen_height: 720,
        });
        let json = mv.to_wire().unwrap();
        assert!(json.contains(r#""screenWidth":1280"#));
        assert!(json.contains(r#""screenHeight":720"#));

        let click = ClientEvent::RemoteMouseClick(RemoteMouseClick {
            to: "h1".to_string(),
            button: MouseButton::Right,
            modifiers: None,
        });
        let json = click.to_wire().unwrap();
        assert!(json.contains(r#""button":"right""#));
        assert!(!json.contains("modifiers"));

        let scroll = ClientEvent::RemoteMouseScroll(RemoteMouseScroll {
            to: "h1".to_string(),
            delta_y: -120.0,
        });
        let json = scroll.to_wire().unwrap();
        assert!(json.contains(r#""event":"remote-mouse-scroll""#));
        assert!(json.contains(r#""deltaY":-120.0"#));
    }

    #[test]
    fn button_index_mapping() {
        assert_eq!(MouseButton::from_index(0), Some(MouseButton::Left));
        assert_eq!(MouseButton::from_index(1), Some(MouseButton::Middle));
        assert_eq!(MouseButton::from_index(2), Some(MouseButton::Right));
        assert_eq!(MouseButton::from_index(3), None);
    }

    #[test]
    fn password_auth_redacted_in_debug() {
        let req = PasswordAuth {
            machine_id: "M1".to_string(),
            password: "super_secret".to_string(),
        };
        let debug_str = format!("{:?}", ClientEvent::ConnectWithPassword(req));
        assert!(debug_str.contains("M1"));
        assert!(debug_str.contains("[REDACTED]"));
        assert!(!debug_str.contains("super_secret"));
    }

    #[test]
    fn password_auth_wire_uses_machine_id() {
        let req = ClientEvent::ConnectWithPassword(PasswordAuth {
            machine_id: "M1".to_string(),
            password: "pw".to_string(),
        });
        let json = req.to_wire().unwrap();
        assert!(json.contains(r#""machineId":"M1""#));
        assert!(json.contains(r#""password":"pw""#));
    }

    #[test]
    fn decode_code_accepted_with_host_id_spelling() {
        let text = r#"{"event":"code-accepted","data":{"hostId":"h1","hostName":"Bob's PC"}}"#;
        match RelayEvent::from_wire(text).unwrap() {
            Some(RelayEvent::CodeAccepted(host)) => {
                assert_eq!(host.host_id, "h1");
                assert_eq!(host.host_name, "Bob's PC");
            }
            other => panic!("Expected CodeAccepted, got {other:?}"),
        }
    }

    #[test]
    fn decode_code_accepted_with_id_spelling() {
        let text = r#"{"event":"code-accepted","data":{"id":"h2","name":"Lab"}}"#;
        match RelayEvent::from_wire(text).unwrap() {
            Some(RelayEvent::CodeAccepted(host)) => {
                assert_eq!(host.host_id, "h2");
                assert_eq!(host.host_name, "Lab");
            }
            other => panic!("Expected CodeAccepted, got {other:?}"),
        }
    }

    #[test]
    fn decode_host_available_keeps_extra_fields() {
        let text = r#"{"event":"host-available","data":{"id":"h1","name":"Bob","os":"linux"}}"#;
        match RelayEvent::from_wire(text).unwrap() {
            Some(RelayEvent::HostAvailable(info)) => {
                assert_eq!(info.id, "h1");
                assert_eq!(info.name, "Bob");
                assert_eq!(info.extra.get("os"), Some(&Value::from("linux")));
            }
            other => panic!("Expected HostAvailable, got {other:?}"),
        }
    }

    #[test]
    fn decode_bare_events_with_any_payload_shape() {
        for text in [
            r#"{"event":"connection-rejected"}"#,
            r#"{"event":"connection-rejected","data":null}"#,
            r#"{"event":"connection-rejected","data":{}}"#,
        ] {
            assert_eq!(
                RelayEvent::from_wire(text).unwrap(),
                Some(RelayEvent::ConnectionRejected)
            );
        }
        assert_eq!(
            RelayEvent::from_wire(r#"{"event":"host-disconnect-ack"}"#).unwrap(),
            Some(RelayEvent::HostDisconnectAck)
        );
    }

    #[test]
    fn decode_code_rejected_without_message() {
        let parsed = RelayEvent::from_wire(r#"{"event":"code-rejected"}"#).unwrap();
        assert_eq!(parsed, Some(RelayEvent::CodeRejected(Rejection::default())));
    }

    #[test]
    fn decode_unknown_event_is_none() {
        let parsed = RelayEvent::from_wire(r#"{"event":"chat-message","data":{"text":"hi"}}"#);
        assert!(matches!(parsed, Ok(None)));
    }

    #[test]
    fn decode_malformed_payload_names_event() {
        let err = RelayEvent::from_wire(r#"{"event":"screen-data","data":{"nope":1}}"#).unwrap_err();
        assert!(err.to_string().contains("screen-data"));
    }

    #[test]
    fn decode_not_json_is_envelope_error() {
        assert!(matches!(
            RelayEvent::from_wire("not json"),
            Err(WireError::Envelope(_))
        ));
    }

    #[test]
    fn relay_event_encoding_is_decodable() {
        let event = RelayEvent::RecordingComplete(RecordingComplete {
            recording_id: "r1".to_string(),
            duration: 12.5,
            file_size: 4096,
            file_path: "/tmp/r1.webm".to_string(),
        });
        let json = event.to_wire().unwrap();
        assert!(json.contains(r#""recordingId":"r1""#));
        assert!(json.contains(r#""fileSize":4096"#));
        assert_eq!(RelayEvent::from_wire(&json).unwrap(), Some(event));
    }

    #[test]
    fn password_auth_response_optional_fields() {
        let text = r#"{"event":"password-auth-response","data":{"success":false,"message":"Wrong password"}}"#;
        match RelayEvent::from_wire(text).unwrap() {
            Some(RelayEvent::PasswordAuthResponse(resp)) => {
                assert!(!resp.success);
                assert_eq!(resp.message.as_deref(), Some("Wrong password"));
                assert!(resp.host_id.is_none());
            }
            other => panic!("Expected PasswordAuthResponse, got {other:?}"),
        }
    }
}
