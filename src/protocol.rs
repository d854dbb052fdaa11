use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Who may drive input for a room.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlMode {
    #[serde(rename = "view-only")]
    ViewOnly,
    #[serde(rename = "full-control")]
    FullControl,
}

/// Input event categories the router gates on. Anything else passes through
/// untyped; the payload itself is never inspected beyond this field.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ControlCategory {
    Keyboard,
    MouseMove,
    MouseDown,
    MouseUp,
    Click,
    Scroll,
    #[serde(other)]
    Other,
}

impl ControlCategory {
    pub fn is_mouse(self) -> bool {
        matches!(
            self,
            ControlCategory::MouseMove
                | ControlCategory::MouseDown
                | ControlCategory::MouseUp
                | ControlCategory::Click
                | ControlCategory::Scroll
        )
    }
}

/// Messages sent from client to the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// First frame on every connection; carries the bearer token.
    #[serde(rename = "auth")]
    Auth { token: String },
    /// Mark a device owned by the authenticated user as online.
    #[serde(rename = "device:register")]
    DeviceRegister { device_id: String },
    /// Open a room for an existing session record (host side).
    #[serde(rename = "session:create")]
    SessionCreate { session_code: String },
    /// Attach to an open room as the viewer.
    #[serde(rename = "session:join")]
    SessionJoin { session_code: String },
    #[serde(rename = "webrtc:offer")]
    Offer { session_code: String, offer: Value },
    #[serde(rename = "webrtc:answer")]
    Answer { session_code: String, answer: Value },
    #[serde(rename = "webrtc:ice-candidate")]
    IceCandidate {
        session_code: String,
        candidate: Value,
    },
    #[serde(rename = "webrtc:connection-state")]
    ConnectionState { session_code: String, state: String },
    #[serde(rename = "control:event")]
    ControlEvent { session_code: String, event: Value },
    #[serde(rename = "control-mode-change")]
    ControlModeChange {
        session_code: String,
        control_mode: ControlMode,
    },
    #[serde(rename = "agent:register")]
    AgentRegister {
        session_code: String,
        agent_type: String,
        #[serde(default)]
        capabilities: Vec<String>,
    },
    #[serde(rename = "agent:status")]
    AgentStatus { session_code: String, status: String },
    #[serde(rename = "session:end")]
    SessionEnd { session_code: String },
    #[serde(rename = "chat:message")]
    Chat { session_code: String, message: String },
    #[serde(rename = "ping")]
    Ping,
}

/// Messages sent from the relay server to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "auth:ok")]
    AuthOk { user_id: String, email: String },
    #[serde(rename = "device:registered")]
    DeviceRegistered { device_id: String },
    /// Room opened, host side ack.
    #[serde(rename = "session:created")]
    SessionCreated { session_code: String },
    /// Viewer side ack with the room's current control mode.
    #[serde(rename = "session:joined")]
    SessionJoined {
        session_code: String,
        control_mode: ControlMode,
    },
    /// Delivered to the host when a viewer attaches.
    #[serde(rename = "viewer:joined")]
    ViewerJoined { session_code: String, email: String },
    /// Delivered to the host when the viewer connection drops.
    #[serde(rename = "viewer:left")]
    ViewerLeft { session_code: String },
    #[serde(rename = "webrtc:offer")]
    Offer { session_code: String, offer: Value },
    #[serde(rename = "webrtc:answer")]
    Answer { session_code: String, answer: Value },
    #[serde(rename = "webrtc:ice-candidate")]
    IceCandidate {
        session_code: String,
        candidate: Value,
    },
    #[serde(rename = "webrtc:connection-state")]
    ConnectionState { session_code: String, state: String },
    #[serde(rename = "control:event")]
    ControlEvent { session_code: String, event: Value },
    #[serde(rename = "control-mode-change")]
    ControlModeChanged {
        session_code: String,
        control_mode: ControlMode,
    },
    /// Delivered to the host when a desktop agent attaches.
    #[serde(rename = "agent:available")]
    AgentAvailable {
        session_code: String,
        agent_type: String,
        capabilities: Vec<String>,
    },
    #[serde(rename = "agent:status")]
    AgentStatus { session_code: String, status: String },
    /// Termination event; sent once to every participant still attached.
    #[serde(rename = "session:ended")]
    SessionEnded { session_code: String, reason: String },
    #[serde(rename = "chat:message")]
    Chat {
        session_code: String,
        from: String,
        message: String,
    },
    #[serde(rename = "error")]
    Error { code: String, message: String },
    #[serde(rename = "pong")]
    Pong,
}

/// Generate a unique connection id.
pub fn generate_connection_id() -> Uuid {
    Uuid::new_v4()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tags_match_protocol_names() {
        let msg = ClientMessage::SessionJoin {
            session_code: "AB23CD".into(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "session:join");

        let msg = ServerMessage::Offer {
            session_code: "AB23CD".into(),
            offer: serde_json::json!({"sdp": "X"}),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "webrtc:offer");
        assert_eq!(json["offer"]["sdp"], "X");
    }

    #[test]
    fn control_category_parses_mouse_family() {
        let cat: ControlCategory = serde_json::from_value(serde_json::json!("mousemove")).unwrap();
        assert!(cat.is_mouse());
        let cat: ControlCategory = serde_json::from_value(serde_json::json!("keyboard")).unwrap();
        assert_eq!(cat, ControlCategory::Keyboard);
        let cat: ControlCategory = serde_json::from_value(serde_json::json!("gesture")).unwrap();
        assert_eq!(cat, ControlCategory::Other);
    }

    #[test]
    fn control_mode_uses_dashed_names() {
        let json = serde_json::to_value(ControlMode::ViewOnly).unwrap();
        assert_eq!(json, "view-only");
        let json = serde_json::to_value(ControlMode::FullControl).unwrap();
        assert_eq!(json, "full-control");
    }
}
