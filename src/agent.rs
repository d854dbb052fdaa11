use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

use crate::protocol::ServerMessage;
use crate::registry::{ConnectionRegistry, Role};
use crate::rooms::{RoomDirectory, RoomError};

/// Registration path for the native control executor. An agent is a third
/// connection attached to the room that receives the same control events as
/// the host.
pub struct AgentBridge {
    rooms: Arc<RoomDirectory>,
    registry: Arc<ConnectionRegistry>,
}

impl AgentBridge {
    pub fn new(rooms: Arc<RoomDirectory>, registry: Arc<ConnectionRegistry>) -> Self {
        Self { rooms, registry }
    }

    /// Attach the connection as the room's agent, replacing any prior
    /// registration. Capabilities are advisory metadata for the host; the
    /// router does not enforce them, unsupported events are the agent's
    /// problem.
    pub fn register_agent(
        &self,
        session_code: &str,
        connection_id: Uuid,
        agent_type: &str,
        capabilities: Vec<String>,
    ) -> Result<(), RoomError> {
        let (host, replaced) = self
            .rooms
            .update(session_code, |room| {
                let replaced = room.agent_connection_id.replace(connection_id);
                room.agent_capabilities = capabilities.clone();
                (room.host_connection_id, replaced)
            })
            .ok_or(RoomError::RoomNotFound)?;

        if let Some(prior) = replaced {
            if prior != connection_id {
                self.registry.set_room_binding(prior, None, Role::Unset);
            }
        }
        self.registry
            .set_room_binding(connection_id, Some(session_code.to_string()), Role::Agent);

        self.registry.deliver(
            host,
            ServerMessage::AgentAvailable {
                session_code: session_code.to_string(),
                agent_type: agent_type.to_string(),
                capabilities,
            },
        );

        info!(%session_code, agent = %connection_id, %agent_type, "agent registered");
        Ok(())
    }

    /// Relayed to the host connection only.
    pub fn report_agent_status(
        &self,
        session_code: &str,
        connection_id: Uuid,
        status: &str,
    ) -> Result<(), RoomError> {
        let room = self
            .rooms
            .snapshot(session_code)
            .ok_or(RoomError::RoomNotFound)?;
        if room.agent_connection_id != Some(connection_id) {
            return Err(RoomError::Forbidden);
        }

        self.registry.deliver(
            room.host_connection_id,
            ServerMessage::AgentStatus {
                session_code: session_code.to_string(),
                status: status.to_string(),
            },
        );
        Ok(())
    }
}
