use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub redis_url: String,
    /// Retention TTL applied to persisted records, independent of session
    /// expiry which is tracked on the record itself.
    pub record_ttl_seconds: u64,
    /// Window granted to an unused session code before the reaper claims it.
    pub pending_ttl: Duration,
    /// Extended window once a viewer has joined.
    pub active_ttl: Duration,
    pub reaper_interval: Duration,
    /// A connection must authenticate within this window or it is closed.
    pub handshake_timeout: Duration,
    pub auth_secret: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            port: env::var("PORTHOLE_PORT")
                .ok()
                .and_then(|p| p.parse().ok())
                .unwrap_or(8080),
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            record_ttl_seconds: env::var("PORTHOLE_RECORD_TTL")
                .ok()
                .and_then(|t| t.parse().ok())
                .unwrap_or(86_400),
            pending_ttl: duration_env("PORTHOLE_PENDING_TTL", 600),
            active_ttl: duration_env("PORTHOLE_ACTIVE_TTL", 1_800),
            reaper_interval: duration_env("PORTHOLE_REAPER_INTERVAL", 60),
            handshake_timeout: duration_env("PORTHOLE_HANDSHAKE_TIMEOUT", 10),
            auth_secret: env::var("PORTHOLE_AUTH_SECRET")
                .unwrap_or_else(|_| "porthole-dev-secret".to_string()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            redis_url: "redis://localhost:6379".to_string(),
            record_ttl_seconds: 86_400,
            pending_ttl: Duration::from_secs(600),
            active_ttl: Duration::from_secs(1_800),
            reaper_interval: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            auth_secret: "porthole-dev-secret".to_string(),
        }
    }
}

fn duration_env(key: &str, default_secs: u64) -> Duration {
    Duration::from_secs(
        env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default_secs),
    )
}
