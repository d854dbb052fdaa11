use metrics::counter;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use crate::protocol::{ControlCategory, ControlMode, ServerMessage};
use crate::registry::ConnectionRegistry;
use crate::rooms::RoomDirectory;
use crate::storage::RecordStore;

/// Routes viewer input to the host and desktop agent. Best-effort by
/// design: every gate failure is a silent drop, never an error to the
/// sender, since input is a latest-wins stream.
pub struct ControlRouter {
    rooms: Arc<RoomDirectory>,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn RecordStore>,
}

impl ControlRouter {
    pub fn new(
        rooms: Arc<RoomDirectory>,
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn RecordStore>,
    ) -> Self {
        Self {
            rooms,
            registry,
            store,
        }
    }

    /// Gates: sender must be the room's viewer, the room must not be
    /// view-only, and the session settings must allow the event's category.
    /// Events that pass fan out to the host (visual feedback) and, if
    /// attached, the agent (OS-level execution); the two targets are
    /// independent. Per-sender receipt order is preserved by the
    /// per-connection channels.
    pub async fn route_control_event(&self, session_code: &str, sender: Uuid, event: Value) {
        let Some(room) = self.rooms.snapshot(session_code) else {
            return self.drop_event(session_code, "no_room");
        };
        if room.viewer_connection_id != Some(sender) {
            return self.drop_event(session_code, "not_viewer");
        }
        if room.control_mode == ControlMode::ViewOnly {
            return self.drop_event(session_code, "view_only");
        }

        // Settings live on the persisted record, read-only here. If they
        // cannot be read the event is dropped rather than forwarded
        // unchecked.
        let settings = match self.store.find_active_session_by_code(session_code).await {
            Ok(Some(record)) => record,
            _ => return self.drop_event(session_code, "no_settings"),
        };

        let category = event
            .get("category")
            .cloned()
            .and_then(|v| serde_json::from_value::<ControlCategory>(v).ok())
            .unwrap_or(ControlCategory::Other);

        if category == ControlCategory::Keyboard && !settings.allow_keyboard {
            return self.drop_event(session_code, "keyboard_blocked");
        }
        if category.is_mouse() && !settings.allow_mouse {
            return self.drop_event(session_code, "mouse_blocked");
        }

        let message = ServerMessage::ControlEvent {
            session_code: session_code.to_string(),
            event,
        };
        self.registry.deliver(room.host_connection_id, message.clone());
        if let Some(agent) = room.agent_connection_id {
            self.registry.deliver(agent, message);
        }
        counter!("porthole_control_events_forwarded_total", 1);
    }

    fn drop_event(&self, session_code: &str, reason: &'static str) {
        debug!(%session_code, %reason, "control event dropped");
        counter!("porthole_control_events_dropped_total", 1, "reason" => reason);
    }
}
