use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{ControlMode, ServerMessage};
use crate::registry::{ConnectionRegistry, Role};
use crate::storage::{RecordStore, SessionPatch, SessionStatus};

/// Relay handshake progress for a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    Empty,
    Offering,
    Answering,
    Connected,
    Failed,
}

/// In-memory, transient pairing of host/viewer/agent connections for one
/// session code. Never outlives its entry in the directory.
#[derive(Debug, Clone)]
pub struct SessionRoom {
    pub session_code: String,
    pub host_connection_id: Uuid,
    pub viewer_connection_id: Option<Uuid>,
    pub agent_connection_id: Option<Uuid>,
    pub agent_capabilities: Vec<String>,
    pub control_mode: ControlMode,
    pub signal_state: SignalState,
    pub created_at: DateTime<Utc>,
}

impl SessionRoom {
    fn new(session_code: String, host_connection_id: Uuid) -> Self {
        Self {
            session_code,
            host_connection_id,
            viewer_connection_id: None,
            agent_connection_id: None,
            agent_capabilities: Vec::new(),
            control_mode: ControlMode::FullControl,
            signal_state: SignalState::Empty,
            created_at: Utc::now(),
        }
    }

    /// Connections currently attached, host first.
    pub fn participants(&self) -> Vec<Uuid> {
        let mut ids = vec![self.host_connection_id];
        ids.extend(self.viewer_connection_id);
        ids.extend(self.agent_connection_id);
        ids
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RoomError {
    #[error("session not found or expired")]
    SessionNotFound,
    #[error("forbidden")]
    Forbidden,
    #[error("host not connected, please wait")]
    HostNotConnected,
    #[error("session already has a viewer")]
    ViewerSlotTaken,
    #[error("room not found")]
    RoomNotFound,
}

impl RoomError {
    pub fn code(&self) -> &'static str {
        match self {
            RoomError::SessionNotFound => "session_not_found",
            RoomError::Forbidden => "forbidden",
            RoomError::HostNotConnected => "host_not_connected",
            RoomError::ViewerSlotTaken => "viewer_slot_taken",
            RoomError::RoomNotFound => "room_not_found",
        }
    }
}

/// In-memory map from session code to room state. The only mutable shared
/// resource in the core; every mutation runs inside a single map critical
/// section, and guards are never held across awaits or sends.
pub struct RoomDirectory {
    rooms: DashMap<String, SessionRoom>,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn RecordStore>,
    active_ttl: Duration,
}

impl RoomDirectory {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        store: Arc<dyn RecordStore>,
        active_ttl: Duration,
    ) -> Self {
        Self {
            rooms: DashMap::new(),
            registry,
            store,
            active_ttl,
        }
    }

    /// Lock-free snapshot for forwarding reads. Stale-by-microseconds data
    /// only risks a dropped event, never a lost update.
    pub fn snapshot(&self, session_code: &str) -> Option<SessionRoom> {
        self.rooms.get(session_code).map(|r| r.value().clone())
    }

    pub fn contains(&self, session_code: &str) -> bool {
        self.rooms.contains_key(session_code)
    }

    /// Run a mutation inside the room's critical section. Returns `None`
    /// when the room does not exist.
    pub(crate) fn update<T>(
        &self,
        session_code: &str,
        f: impl FnOnce(&mut SessionRoom) -> T,
    ) -> Option<T> {
        self.rooms.get_mut(session_code).map(|mut room| f(&mut room))
    }

    /// Open a room for an already-persisted session. The requester must be
    /// the session's recorded host.
    pub async fn create_room(
        &self,
        session_code: &str,
        requester: Uuid,
    ) -> Result<(), RoomError> {
        let record = self
            .store
            .find_active_session_by_code(session_code)
            .await
            .map_err(|err| {
                warn!(%session_code, error = %err, "session lookup failed");
                RoomError::SessionNotFound
            })?
            .ok_or(RoomError::SessionNotFound)?;

        let principal = self
            .registry
            .principal(requester)
            .ok_or(RoomError::Forbidden)?;
        if record.host_user_id != principal.user_id {
            return Err(RoomError::Forbidden);
        }

        // A lingering room for the same code means a stale host connection;
        // the latest host wins.
        if self.contains(session_code) {
            self.end_room(session_code, "superseded").await;
        }

        self.rooms.insert(
            session_code.to_string(),
            SessionRoom::new(session_code.to_string(), requester),
        );
        self.registry
            .set_room_binding(requester, Some(session_code.to_string()), Role::Host);

        counter!("porthole_rooms_opened_total", 1);
        gauge!("porthole_rooms_active", self.rooms.len() as f64);
        info!(%session_code, host = %requester, "room opened");
        Ok(())
    }

    /// Attach a viewer to an open room. Extends the persisted expiry window
    /// and flips the session to active.
    pub async fn join_room(
        &self,
        session_code: &str,
        requester: Uuid,
    ) -> Result<ControlMode, RoomError> {
        let record = self
            .store
            .find_active_session_by_code(session_code)
            .await
            .map_err(|err| {
                warn!(%session_code, error = %err, "session lookup failed");
                RoomError::SessionNotFound
            })?
            .ok_or(RoomError::SessionNotFound)?;

        let principal = self
            .registry
            .principal(requester)
            .ok_or(RoomError::SessionNotFound)?;

        let (host, control_mode) = self
            .update(session_code, |room| {
                if room.viewer_connection_id.is_some() {
                    return Err(RoomError::ViewerSlotTaken);
                }
                room.viewer_connection_id = Some(requester);
                Ok((room.host_connection_id, room.control_mode))
            })
            .ok_or(RoomError::HostNotConnected)??;

        self.registry
            .set_room_binding(requester, Some(session_code.to_string()), Role::Viewer);

        self.registry.deliver(
            host,
            ServerMessage::ViewerJoined {
                session_code: session_code.to_string(),
                email: principal.email,
            },
        );

        let now = Utc::now();
        let patch = SessionPatch {
            status: Some(SessionStatus::Active),
            started_at: record.started_at.or(Some(now)),
            expires_at: Some(
                now + chrono::Duration::from_std(self.active_ttl)
                    .unwrap_or_else(|_| chrono::Duration::minutes(30)),
            ),
            ..Default::default()
        };
        if let Err(err) = self.store.update_session(session_code, patch).await {
            warn!(%session_code, error = %err, "failed to persist session start");
        }

        info!(%session_code, viewer = %requester, "viewer joined");
        Ok(control_mode)
    }

    /// Only the recorded host may flip the control mode; the change is
    /// propagated to the viewer if one is attached.
    pub fn set_control_mode(
        &self,
        session_code: &str,
        requester: Uuid,
        mode: ControlMode,
    ) -> Result<(), RoomError> {
        let viewer = self
            .update(session_code, |room| {
                if room.host_connection_id != requester {
                    return Err(RoomError::Forbidden);
                }
                room.control_mode = mode;
                Ok(room.viewer_connection_id)
            })
            .ok_or(RoomError::RoomNotFound)??;

        if let Some(viewer) = viewer {
            self.registry.deliver(
                viewer,
                ServerMessage::ControlModeChanged {
                    session_code: session_code.to_string(),
                    control_mode: mode,
                },
            );
        }
        Ok(())
    }

    /// Tear a room down and notify every attached connection exactly once.
    /// Idempotent: a second call for the same code is a no-op. A persistence
    /// failure is logged and never blocks in-memory removal.
    pub async fn end_room(&self, session_code: &str, reason: &str) -> bool {
        let Some((_, room)) = self.rooms.remove(session_code) else {
            return false;
        };
        gauge!("porthole_rooms_active", self.rooms.len() as f64);
        counter!("porthole_rooms_closed_total", 1, "reason" => reason.to_string());

        for connection_id in room.participants() {
            self.registry.deliver(
                connection_id,
                ServerMessage::SessionEnded {
                    session_code: session_code.to_string(),
                    reason: reason.to_string(),
                },
            );
            self.registry.set_room_binding(connection_id, None, Role::Unset);
        }

        if let Err(err) = self.persist_ended(session_code).await {
            warn!(%session_code, error = %err, "failed to persist session end");
        }

        info!(%session_code, %reason, "room ended");
        true
    }

    async fn persist_ended(&self, session_code: &str) -> anyhow::Result<()> {
        let now = Utc::now();
        let record = self.store.get_session(session_code).await?;
        let duration = record
            .as_ref()
            .and_then(|r| r.started_at)
            .map(|started| (now - started).num_seconds().max(0))
            .unwrap_or(0);
        self.store
            .update_session(
                session_code,
                SessionPatch {
                    status: Some(SessionStatus::Ended),
                    ended_at: Some(now),
                    duration_secs: Some(duration),
                    ..Default::default()
                },
            )
            .await
    }

    /// Invoked from the registry's disconnect path. Host departure ends the
    /// room; viewer or agent departure only clears the slot.
    pub async fn handle_disconnect(&self, session_code: &str, connection_id: Uuid, role: Role) {
        match role {
            Role::Host => {
                let is_host = self
                    .snapshot(session_code)
                    .map(|room| room.host_connection_id == connection_id)
                    .unwrap_or(false);
                if is_host {
                    self.end_room(session_code, "host-disconnected").await;
                }
            }
            Role::Viewer => {
                let host = self.update(session_code, |room| {
                    if room.viewer_connection_id == Some(connection_id) {
                        room.viewer_connection_id = None;
                        room.signal_state = SignalState::Empty;
                        Some(room.host_connection_id)
                    } else {
                        None
                    }
                });
                if let Some(Some(host)) = host {
                    self.registry.deliver(
                        host,
                        ServerMessage::ViewerLeft {
                            session_code: session_code.to_string(),
                        },
                    );
                }
            }
            Role::Agent => {
                self.update(session_code, |room| {
                    if room.agent_connection_id == Some(connection_id) {
                        room.agent_connection_id = None;
                        room.agent_capabilities.clear();
                    }
                });
            }
            Role::Unset => {
                debug!(%session_code, %connection_id, "disconnect for roomless connection");
            }
        }
    }
}
