use dashmap::DashMap;
use metrics::{counter, gauge};
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::auth::Principal;
use crate::protocol::ServerMessage;
use crate::storage::RecordStore;

/// Role a connection holds inside a room, set at room-attach time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unset,
    Host,
    Viewer,
    Agent,
}

/// Live transport connection plus the authenticated principal behind it.
#[derive(Clone)]
pub struct ConnectionEntry {
    pub connection_id: Uuid,
    pub principal: Principal,
    pub device_id: Option<String>,
    pub session_code: Option<String>,
    pub role: Role,
    pub remote_addr: Option<SocketAddr>,
    tx: mpsc::UnboundedSender<ServerMessage>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("device not found")]
    DeviceNotFound,
}

/// Everything removed alongside a connection, handed to the room directory
/// for cleanup.
pub struct RemovedConnection {
    pub session_code: Option<String>,
    pub role: Role,
}

/// Tracks every live connection. Sole owner of [`ConnectionEntry`] values;
/// one entry per transport connection.
pub struct ConnectionRegistry {
    entries: DashMap<Uuid, ConnectionEntry>,
    store: Arc<dyn RecordStore>,
}

impl ConnectionRegistry {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            entries: DashMap::new(),
            store,
        }
    }

    /// Insert a freshly authenticated connection.
    pub fn insert(
        &self,
        connection_id: Uuid,
        principal: Principal,
        remote_addr: Option<SocketAddr>,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) {
        self.entries.insert(
            connection_id,
            ConnectionEntry {
                connection_id,
                principal,
                device_id: None,
                session_code: None,
                role: Role::Unset,
                remote_addr,
                tx,
            },
        );
        counter!("porthole_connections_total", 1);
        gauge!("porthole_connections_active", self.entries.len() as f64);
    }

    pub fn get(&self, connection_id: Uuid) -> Option<ConnectionEntry> {
        self.entries.get(&connection_id).map(|e| e.value().clone())
    }

    pub fn principal(&self, connection_id: Uuid) -> Option<Principal> {
        self.entries.get(&connection_id).map(|e| e.principal.clone())
    }

    /// Validate device ownership, mark it online, and remember it on the
    /// entry for the offline transition at disconnect.
    pub async fn register_device(
        &self,
        connection_id: Uuid,
        device_id: &str,
    ) -> Result<(), RegistryError> {
        let (principal, remote_addr) = match self.entries.get(&connection_id) {
            Some(entry) => (entry.principal.clone(), entry.remote_addr),
            None => return Err(RegistryError::DeviceNotFound),
        };

        let device = self
            .store
            .find_device_for_user(device_id, &principal.user_id)
            .await
            .map_err(|err| {
                warn!(%device_id, error = %err, "device lookup failed");
                RegistryError::DeviceNotFound
            })?;
        if device.is_none() {
            return Err(RegistryError::DeviceNotFound);
        }

        if let Err(err) = self
            .store
            .mark_device_online(device_id, connection_id, remote_addr)
            .await
        {
            warn!(%device_id, error = %err, "failed to mark device online");
            return Err(RegistryError::DeviceNotFound);
        }

        if let Some(mut entry) = self.entries.get_mut(&connection_id) {
            entry.device_id = Some(device_id.to_string());
        }
        Ok(())
    }

    /// Bind a connection to a room. Pass `None` to detach.
    pub fn set_room_binding(&self, connection_id: Uuid, session_code: Option<String>, role: Role) {
        if let Some(mut entry) = self.entries.get_mut(&connection_id) {
            entry.session_code = session_code;
            entry.role = role;
        }
    }

    /// One-way, fire-and-forget delivery. The result only feeds logging and
    /// metrics; callers never block on the receiver.
    pub fn deliver(&self, connection_id: Uuid, message: ServerMessage) -> bool {
        match self.entries.get(&connection_id) {
            Some(entry) => {
                let delivered = entry.tx.send(message).is_ok();
                if !delivered {
                    debug!(%connection_id, "delivery to closed connection dropped");
                }
                delivered
            }
            None => {
                debug!(%connection_id, "delivery target not registered");
                false
            }
        }
    }

    /// Called exactly once from the disconnect path. Marks a registered
    /// device offline; room cleanup is the directory's job, driven by the
    /// returned membership.
    pub async fn remove(&self, connection_id: Uuid) -> Option<RemovedConnection> {
        let (_, entry) = self.entries.remove(&connection_id)?;
        gauge!("porthole_connections_active", self.entries.len() as f64);

        if let Some(device_id) = &entry.device_id {
            if let Err(err) = self.store.mark_device_offline(device_id).await {
                warn!(%device_id, error = %err, "failed to mark device offline");
            }
        }

        Some(RemovedConnection {
            session_code: entry.session_code,
            role: entry.role,
        })
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{principal, MemoryStore};
    use crate::storage::{DeviceRecord, DeviceStatus};

    fn device(device_id: &str, user_id: &str) -> DeviceRecord {
        DeviceRecord {
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            name: "workstation".to_string(),
            status: DeviceStatus::Offline,
            connection_id: None,
            remote_addr: None,
            last_seen_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn register_device_requires_ownership() {
        let store = Arc::new(MemoryStore::default());
        store.insert_device(device("dev-1", "user-1")).await;
        let registry = ConnectionRegistry::new(store.clone());

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        registry.insert(conn, principal("user-2"), None, tx);

        assert_eq!(
            registry.register_device(conn, "dev-1").await,
            Err(RegistryError::DeviceNotFound)
        );
        assert_eq!(
            store.device_status("dev-1").await,
            Some(DeviceStatus::Offline)
        );
    }

    #[tokio::test]
    async fn register_and_remove_flip_device_status() {
        let store = Arc::new(MemoryStore::default());
        store.insert_device(device("dev-1", "user-1")).await;
        let registry = ConnectionRegistry::new(store.clone());

        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = Uuid::new_v4();
        registry.insert(conn, principal("user-1"), None, tx);

        registry.register_device(conn, "dev-1").await.unwrap();
        assert_eq!(
            store.device_status("dev-1").await,
            Some(DeviceStatus::Online)
        );

        registry.remove(conn).await.unwrap();
        assert_eq!(
            store.device_status("dev-1").await,
            Some(DeviceStatus::Offline)
        );
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn deliver_reports_missing_target() {
        let store = Arc::new(MemoryStore::default());
        let registry = ConnectionRegistry::new(store);
        assert!(!registry.deliver(Uuid::new_v4(), ServerMessage::Pong));
    }
}
