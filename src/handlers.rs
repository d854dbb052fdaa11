use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, error};
use uuid::Uuid;

use crate::auth::Principal;
use crate::protocol::ControlMode;
use crate::storage::{SessionPatch, SessionRecord, SessionStatus};
use crate::websocket::AppState;

/// Session codes must be typeable over the phone: uppercase, no glyphs
/// that read ambiguously (no I, L, O, 0, 1).
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
const CODE_LEN: usize = 6;

pub fn generate_session_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LEN)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

fn bearer_principal(state: &AppState, headers: &HeaderMap) -> Result<Principal, StatusCode> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;
    state
        .verifier
        .verify(token)
        .map_err(|_| StatusCode::UNAUTHORIZED)
}

#[derive(Debug, Deserialize, Default)]
pub struct CreateSessionRequest {
    #[serde(default)]
    pub connection_type: Option<ControlMode>,
    #[serde(default)]
    pub allow_keyboard: Option<bool>,
    #[serde(default)]
    pub allow_mouse: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    pub session_code: String,
    pub expires_at: DateTime<Utc>,
}

/// POST /sessions - create a session record. The room itself is opened
/// later, over the socket, by `session:create`.
pub async fn create_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateSessionRequest>,
) -> Result<Json<CreateSessionResponse>, StatusCode> {
    let principal = bearer_principal(&state, &headers)?;

    // Codes collide rarely but cheaply; retry a few times before giving up.
    let mut code = generate_session_code();
    for _ in 0..4 {
        match state.store.get_session(&code).await {
            Ok(None) => break,
            Ok(Some(_)) => code = generate_session_code(),
            Err(err) => {
                error!(error = %err, "session lookup failed");
                return Err(StatusCode::INTERNAL_SERVER_ERROR);
            }
        }
    }

    let record = SessionRecord::new(
        code.clone(),
        principal.user_id,
        payload.connection_type.unwrap_or(ControlMode::FullControl),
        payload.allow_keyboard.unwrap_or(true),
        payload.allow_mouse.unwrap_or(true),
        state.config.pending_ttl,
    );

    if let Err(err) = state.store.put_session(&record).await {
        error!(error = %err, "failed to persist session");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }

    debug!(session_code = %code, "session created");
    Ok(Json(CreateSessionResponse {
        session_id: record.session_id,
        session_code: record.session_code,
        expires_at: record.expires_at,
    }))
}

#[derive(Debug, Serialize)]
pub struct SessionStatusResponse {
    pub exists: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

/// GET /sessions/{code} - existence and status probe.
pub async fn get_session_status(
    State(state): State<AppState>,
    Path(session_code): Path<String>,
) -> Result<Json<SessionStatusResponse>, StatusCode> {
    match state.store.get_session(&session_code).await {
        Ok(Some(record)) => Ok(Json(SessionStatusResponse {
            exists: true,
            status: Some(record.status),
            created_at: Some(record.created_at),
            expires_at: Some(record.expires_at),
        })),
        Ok(None) => Ok(Json(SessionStatusResponse {
            exists: false,
            status: None,
            created_at: None,
            expires_at: None,
        })),
        Err(err) => {
            error!(error = %err, "failed to read session");
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EndSessionResponse {
    pub ended: bool,
}

/// POST /sessions/{code}/end - explicit end by the recorded host. Tears
/// down a live room too; otherwise just flips the persisted record.
pub async fn end_session(
    State(state): State<AppState>,
    Path(session_code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<EndSessionResponse>, StatusCode> {
    let principal = bearer_principal(&state, &headers)?;

    let record = match state.store.get_session(&session_code).await {
        Ok(Some(record)) => record,
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(err) => {
            error!(error = %err, "failed to read session");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };
    if record.host_user_id != principal.user_id {
        return Err(StatusCode::FORBIDDEN);
    }

    if !state.rooms.end_room(&session_code, "ended").await
        && record.status != SessionStatus::Ended
    {
        let now = Utc::now();
        let duration = record
            .started_at
            .map(|started| (now - started).num_seconds().max(0))
            .unwrap_or(0);
        if let Err(err) = state
            .store
            .update_session(
                &session_code,
                SessionPatch {
                    status: Some(SessionStatus::Ended),
                    ended_at: Some(now),
                    duration_secs: Some(duration),
                    ..Default::default()
                },
            )
            .await
        {
            error!(error = %err, "failed to persist session end");
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }

    Ok(Json(EndSessionResponse { ended: true }))
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
}

/// GET /health
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: "ok" })
}

/// GET /metrics - Prometheus exposition.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.metrics.render()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_codes_are_six_unambiguous_uppercase_chars() {
        for _ in 0..200 {
            let code = generate_session_code();
            assert_eq!(code.len(), 6);
            for c in code.chars() {
                assert!(c.is_ascii_uppercase() || c.is_ascii_digit());
                assert!(!"ILO01".contains(c), "ambiguous char {c} in {code}");
            }
        }
    }

    #[test]
    fn session_codes_vary() {
        let a = generate_session_code();
        let b = generate_session_code();
        let c = generate_session_code();
        assert!(a != b || b != c);
    }
}
