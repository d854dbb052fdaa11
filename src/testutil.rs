//! Shared fixtures for unit tests: an in-memory record store standing in
//! for Redis, and a pre-wired stack of the coordination components.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::agent::AgentBridge;
use crate::auth::Principal;
use crate::control::ControlRouter;
use crate::protocol::{ControlMode, ServerMessage};
use crate::registry::ConnectionRegistry;
use crate::relay::SignalingRelay;
use crate::rooms::RoomDirectory;
use crate::storage::{
    DeviceRecord, DeviceStatus, RecordStore, SessionPatch, SessionRecord, SessionStatus,
};

#[derive(Default)]
pub struct MemoryStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
    devices: Mutex<HashMap<String, DeviceRecord>>,
}

impl MemoryStore {
    pub async fn insert_device(&self, device: DeviceRecord) {
        self.devices
            .lock()
            .await
            .insert(device.device_id.clone(), device);
    }

    pub async fn device_status(&self, device_id: &str) -> Option<DeviceStatus> {
        self.devices.lock().await.get(device_id).map(|d| d.status)
    }

    pub async fn mutate_session(&self, code: &str, f: impl FnOnce(&mut SessionRecord)) {
        if let Some(record) = self.sessions.lock().await.get_mut(code) {
            f(record);
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn find_active_session_by_code(&self, code: &str) -> Result<Option<SessionRecord>> {
        let record = self.get_session(code).await?;
        Ok(record.filter(|r| r.status != SessionStatus::Ended && !r.expired(Utc::now())))
    }

    async fn get_session(&self, code: &str) -> Result<Option<SessionRecord>> {
        Ok(self.sessions.lock().await.get(code).cloned())
    }

    async fn put_session(&self, record: &SessionRecord) -> Result<()> {
        self.sessions
            .lock()
            .await
            .insert(record.session_code.clone(), record.clone());
        Ok(())
    }

    async fn update_session(&self, code: &str, patch: SessionPatch) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions
            .get_mut(code)
            .ok_or_else(|| anyhow::anyhow!("session {code} not found"))?;
        patch.apply(record);
        Ok(())
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        Ok(self.sessions.lock().await.values().cloned().collect())
    }

    async fn find_device_for_user(
        &self,
        device_id: &str,
        user_id: &str,
    ) -> Result<Option<DeviceRecord>> {
        Ok(self
            .devices
            .lock()
            .await
            .get(device_id)
            .filter(|d| d.user_id == user_id)
            .cloned())
    }

    async fn mark_device_online(
        &self,
        device_id: &str,
        connection_id: Uuid,
        remote_addr: Option<SocketAddr>,
    ) -> Result<()> {
        let mut devices = self.devices.lock().await;
        let device = devices
            .get_mut(device_id)
            .ok_or_else(|| anyhow::anyhow!("device {device_id} not found"))?;
        device.status = DeviceStatus::Online;
        device.connection_id = Some(connection_id);
        device.remote_addr = remote_addr.map(|a| a.to_string());
        device.last_seen_at = Utc::now();
        Ok(())
    }

    async fn mark_device_offline(&self, device_id: &str) -> Result<()> {
        let mut devices = self.devices.lock().await;
        if let Some(device) = devices.get_mut(device_id) {
            device.status = DeviceStatus::Offline;
            device.connection_id = None;
            device.last_seen_at = Utc::now();
        }
        Ok(())
    }
}

pub fn principal(user_id: &str) -> Principal {
    Principal {
        user_id: user_id.to_string(),
        email: format!("{user_id}@example.com"),
    }
}

/// Pull everything currently queued for a connection.
pub fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        messages.push(msg);
    }
    messages
}

/// The full coordination stack wired against a [`MemoryStore`], fresh per
/// test.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomDirectory>,
    pub relay: SignalingRelay,
    pub control: ControlRouter,
    pub agents: AgentBridge,
}

impl Harness {
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::default());
        let record_store: Arc<dyn RecordStore> = store.clone();
        let registry = Arc::new(ConnectionRegistry::new(record_store.clone()));
        let rooms = Arc::new(RoomDirectory::new(
            registry.clone(),
            record_store.clone(),
            Duration::from_secs(1_800),
        ));
        let relay = SignalingRelay::new(rooms.clone(), registry.clone(), record_store.clone());
        let control = ControlRouter::new(rooms.clone(), registry.clone(), record_store.clone());
        let agents = AgentBridge::new(rooms.clone(), registry.clone());

        Self {
            store,
            registry,
            rooms,
            relay,
            control,
            agents,
        }
    }

    pub fn connect(&self, user_id: &str) -> (Uuid, mpsc::UnboundedReceiver<ServerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection_id = Uuid::new_v4();
        self.registry
            .insert(connection_id, principal(user_id), None, tx);
        (connection_id, rx)
    }

    pub async fn seed_session(&self, code: &str, host_user: &str) {
        let record = SessionRecord::new(
            code.to_string(),
            host_user.to_string(),
            ControlMode::FullControl,
            true,
            true,
            Duration::from_secs(600),
        );
        self.store.put_session(&record).await.unwrap();
    }

    pub async fn seed_expired_session(&self, code: &str, host_user: &str) {
        self.seed_session(code, host_user).await;
        self.expire_session(code).await;
    }

    pub async fn expire_session(&self, code: &str) {
        self.store
            .mutate_session(code, |r| {
                r.expires_at = Utc::now() - ChronoDuration::milliseconds(1);
            })
            .await;
    }

    pub async fn set_session_permissions(&self, code: &str, keyboard: bool, mouse: bool) {
        self.store
            .mutate_session(code, |r| {
                r.allow_keyboard = keyboard;
                r.allow_mouse = mouse;
            })
            .await;
    }

    pub async fn set_session_status(&self, code: &str, status: SessionStatus) {
        self.store.mutate_session(code, |r| r.status = status).await;
    }

    pub async fn session_record(&self, code: &str) -> Option<SessionRecord> {
        self.store.get_session(code).await.unwrap()
    }

    pub async fn session_status(&self, code: &str) -> Option<SessionStatus> {
        self.session_record(code).await.map(|r| r.status)
    }
}
