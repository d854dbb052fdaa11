use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use uuid::Uuid;

use crate::protocol::ControlMode;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Active,
    Ended,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// Persisted session record. The system of record for session existence;
/// the in-memory room directory is only a cache of who is connected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: Uuid,
    pub session_code: String,
    pub host_user_id: String,
    pub status: SessionStatus,
    pub connection_type: ControlMode,
    pub allow_keyboard: bool,
    pub allow_mouse: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_secs: Option<i64>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub connection_state: Option<String>,
}

impl SessionRecord {
    pub fn new(
        session_code: String,
        host_user_id: String,
        connection_type: ControlMode,
        allow_keyboard: bool,
        allow_mouse: bool,
        pending_ttl: std::time::Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4(),
            session_code,
            host_user_id,
            status: SessionStatus::Pending,
            connection_type,
            allow_keyboard,
            allow_mouse,
            created_at: now,
            started_at: None,
            ended_at: None,
            duration_secs: None,
            expires_at: now + Duration::from_std(pending_ttl).unwrap_or(Duration::minutes(10)),
            connection_state: None,
        }
    }

    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_id: String,
    pub user_id: String,
    pub name: String,
    pub status: DeviceStatus,
    #[serde(default)]
    pub connection_id: Option<Uuid>,
    #[serde(default)]
    pub remote_addr: Option<String>,
    pub last_seen_at: DateTime<Utc>,
}

/// Partial update applied to a persisted session. Absent fields are left
/// untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_secs: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub connection_state: Option<String>,
}

impl SessionPatch {
    pub fn apply(self, record: &mut SessionRecord) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(started_at) = self.started_at {
            record.started_at = Some(started_at);
        }
        if let Some(ended_at) = self.ended_at {
            record.ended_at = Some(ended_at);
        }
        if let Some(duration) = self.duration_secs {
            record.duration_secs = Some(duration);
        }
        if let Some(expires_at) = self.expires_at {
            record.expires_at = expires_at;
        }
        if let Some(state) = self.connection_state {
            record.connection_state = Some(state);
        }
    }
}

/// Persistence collaborator consumed by the coordination core. Keyed by
/// session code for sessions and device id for devices.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns the record only if it is neither ended nor past its expiry.
    async fn find_active_session_by_code(&self, code: &str) -> Result<Option<SessionRecord>>;
    /// Raw lookup, regardless of status.
    async fn get_session(&self, code: &str) -> Result<Option<SessionRecord>>;
    async fn put_session(&self, record: &SessionRecord) -> Result<()>;
    async fn update_session(&self, code: &str, patch: SessionPatch) -> Result<()>;
    async fn list_sessions(&self) -> Result<Vec<SessionRecord>>;

    async fn find_device_for_user(
        &self,
        device_id: &str,
        user_id: &str,
    ) -> Result<Option<DeviceRecord>>;
    async fn mark_device_online(
        &self,
        device_id: &str,
        connection_id: Uuid,
        remote_addr: Option<SocketAddr>,
    ) -> Result<()>;
    async fn mark_device_offline(&self, device_id: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
    retention_seconds: u64,
}

impl RedisStore {
    pub async fn connect(redis_url: &str, retention_seconds: u64) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self {
            redis,
            retention_seconds,
        })
    }

    async fn write_session(&self, record: &SessionRecord) -> Result<()> {
        let mut conn = self.redis.clone();
        let key = session_key(&record.session_code);
        let value = serde_json::to_string(record)?;
        conn.set_ex::<_, _, ()>(&key, value, self.retention_seconds)
            .await?;
        Ok(())
    }

    async fn write_device(&self, record: &DeviceRecord) -> Result<()> {
        let mut conn = self.redis.clone();
        let key = device_key(&record.device_id);
        let value = serde_json::to_string(record)?;
        conn.set_ex::<_, _, ()>(&key, value, self.retention_seconds)
            .await?;
        Ok(())
    }

    async fn read_device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(device_key(device_id)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl RecordStore for RedisStore {
    async fn find_active_session_by_code(&self, code: &str) -> Result<Option<SessionRecord>> {
        let record = self.get_session(code).await?;
        Ok(record.filter(|r| r.status != SessionStatus::Ended && !r.expired(Utc::now())))
    }

    async fn get_session(&self, code: &str) -> Result<Option<SessionRecord>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(session_key(code)).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put_session(&self, record: &SessionRecord) -> Result<()> {
        self.write_session(record).await
    }

    async fn update_session(&self, code: &str, patch: SessionPatch) -> Result<()> {
        let Some(mut record) = self.get_session(code).await? else {
            anyhow::bail!("session {code} not found");
        };
        patch.apply(&mut record);
        self.write_session(&record).await
    }

    async fn list_sessions(&self) -> Result<Vec<SessionRecord>> {
        let mut conn = self.redis.clone();
        let mut cursor: u64 = 0;
        let mut results = Vec::new();
        loop {
            let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .cursor_arg(cursor)
                .arg("MATCH")
                .arg("session:*")
                .arg("COUNT")
                .arg(100u32)
                .query_async(&mut conn)
                .await?;
            cursor = next_cursor;
            if !keys.is_empty() {
                let values: Vec<Option<String>> =
                    redis::cmd("MGET").arg(keys).query_async(&mut conn).await?;
                for v in values.into_iter().flatten() {
                    if let Ok(record) = serde_json::from_str::<SessionRecord>(&v) {
                        results.push(record);
                    }
                }
            }
            if cursor == 0 {
                break;
            }
        }
        Ok(results)
    }

    async fn find_device_for_user(
        &self,
        device_id: &str,
        user_id: &str,
    ) -> Result<Option<DeviceRecord>> {
        let device = self.read_device(device_id).await?;
        Ok(device.filter(|d| d.user_id == user_id))
    }

    async fn mark_device_online(
        &self,
        device_id: &str,
        connection_id: Uuid,
        remote_addr: Option<SocketAddr>,
    ) -> Result<()> {
        let Some(mut device) = self.read_device(device_id).await? else {
            anyhow::bail!("device {device_id} not found");
        };
        device.status = DeviceStatus::Online;
        device.connection_id = Some(connection_id);
        device.remote_addr = remote_addr.map(|a| a.to_string());
        device.last_seen_at = Utc::now();
        self.write_device(&device).await
    }

    async fn mark_device_offline(&self, device_id: &str) -> Result<()> {
        let Some(mut device) = self.read_device(device_id).await? else {
            return Ok(());
        };
        device.status = DeviceStatus::Offline;
        device.connection_id = None;
        device.last_seen_at = Utc::now();
        self.write_device(&device).await
    }
}

fn session_key(code: &str) -> String {
    format!("session:{}", code)
}

fn device_key(device_id: &str) -> String {
    format!("device:{}", device_id)
}
