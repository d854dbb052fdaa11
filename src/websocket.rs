use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::agent::AgentBridge;
use crate::auth::{Principal, TokenVerifier};
use crate::config::Config;
use crate::control::ControlRouter;
use crate::protocol::{generate_connection_id, ClientMessage, ServerMessage};
use crate::registry::{ConnectionRegistry, RegistryError, Role};
use crate::relay::SignalingRelay;
use crate::rooms::{RoomDirectory, RoomError};
use crate::storage::RecordStore;

/// Shared state handed to every connection task and REST handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn RecordStore>,
    pub verifier: Arc<TokenVerifier>,
    pub registry: Arc<ConnectionRegistry>,
    pub rooms: Arc<RoomDirectory>,
    pub relay: Arc<SignalingRelay>,
    pub control: Arc<ControlRouter>,
    pub agents: Arc<AgentBridge>,
    pub metrics: PrometheusHandle,
}

pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

async fn handle_socket(socket: WebSocket, state: AppState, remote_addr: SocketAddr) {
    let connection_id = generate_connection_id();
    let (mut sender, mut receiver) = socket.split();

    // Per-connection outbound channel; a dedicated writer task drains it so
    // forwarding never blocks on a slow receiver.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let writer_id = connection_id;
    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(connection = %writer_id, "writer task ended");
    });

    // Authentication must complete before anything else; a connection that
    // fails is closed without ever entering the registry.
    let principal = match authenticate(&mut receiver, &state, &tx).await {
        Some(principal) => principal,
        None => {
            debug!(connection = %connection_id, %remote_addr, "handshake failed, closing");
            return;
        }
    };

    state
        .registry
        .insert(connection_id, principal.clone(), Some(remote_addr), tx.clone());
    let _ = tx.send(ServerMessage::AuthOk {
        user_id: principal.user_id.clone(),
        email: principal.email.clone(),
    });
    debug!(connection = %connection_id, user = %principal.user_id, "connection authenticated");

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(connection = %connection_id, error = %err, "websocket error");
                break;
            }
        };

        match frame {
            Message::Text(text) => {
                handle_text(&text, connection_id, &state, &tx).await;
            }
            Message::Binary(data) => {
                // Some clients send JSON in binary frames; accept them too.
                if let Ok(text) = String::from_utf8(data) {
                    handle_text(&text, connection_id, &state, &tx).await;
                } else {
                    debug!(connection = %connection_id, "non-utf8 binary frame ignored");
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Disconnect path: runs exactly once per connection. Device-offline and
    // room cleanup must happen even if the peer vanished abruptly.
    if let Some(removed) = state.registry.remove(connection_id).await {
        if let Some(session_code) = removed.session_code {
            state
                .rooms
                .handle_disconnect(&session_code, connection_id, removed.role)
                .await;
        }
    }
    debug!(connection = %connection_id, "disconnected");
}

/// First frame must be `auth` and must verify within the handshake window.
async fn authenticate(
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
    state: &AppState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) -> Option<Principal> {
    let first = match timeout(state.config.handshake_timeout, receiver.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => text,
        Ok(_) => {
            let _ = tx.send(error_event("unauthenticated", "authentication required"));
            return None;
        }
        Err(_) => {
            let _ = tx.send(error_event("unauthenticated", "authentication timed out"));
            return None;
        }
    };

    let token = match serde_json::from_str::<ClientMessage>(&first) {
        Ok(ClientMessage::Auth { token }) => token,
        Ok(_) | Err(_) => {
            let _ = tx.send(error_event("unauthenticated", "authentication required"));
            return None;
        }
    };

    match state.verifier.verify(&token) {
        Ok(principal) => Some(principal),
        Err(err) => {
            warn!(error = %err, "authentication rejected");
            let _ = tx.send(error_event(err.code(), &err.to_string()));
            None
        }
    }
}

async fn handle_text(
    text: &str,
    connection_id: Uuid,
    state: &AppState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(message) => {
            if let Err(err) = dispatch(message, connection_id, state, tx).await {
                error!(connection = %connection_id, error = %err, "message handling failed");
                let _ = tx.send(error_event("internal", "failed to process message"));
            }
        }
        Err(err) => {
            debug!(connection = %connection_id, error = %err, "unparseable message");
            let _ = tx.send(error_event("bad_request", "invalid message format"));
        }
    }
}

async fn dispatch(
    message: ClientMessage,
    connection_id: Uuid,
    state: &AppState,
    tx: &mpsc::UnboundedSender<ServerMessage>,
) -> anyhow::Result<()> {
    match message {
        ClientMessage::Auth { .. } => {
            let _ = tx.send(error_event("bad_request", "already authenticated"));
        }

        ClientMessage::DeviceRegister { device_id } => {
            match state.registry.register_device(connection_id, &device_id).await {
                Ok(()) => {
                    let _ = tx.send(ServerMessage::DeviceRegistered { device_id });
                }
                Err(RegistryError::DeviceNotFound) => {
                    let _ = tx.send(error_event("device_not_found", "device not found"));
                }
            }
        }

        ClientMessage::SessionCreate { session_code } => {
            match state.rooms.create_room(&session_code, connection_id).await {
                Ok(()) => {
                    let _ = tx.send(ServerMessage::SessionCreated { session_code });
                }
                Err(err) => {
                    let _ = tx.send(room_error_event(&err));
                }
            }
        }

        ClientMessage::SessionJoin { session_code } => {
            match state.rooms.join_room(&session_code, connection_id).await {
                Ok(control_mode) => {
                    let _ = tx.send(ServerMessage::SessionJoined {
                        session_code,
                        control_mode,
                    });
                }
                Err(err) => {
                    let _ = tx.send(room_error_event(&err));
                }
            }
        }

        ClientMessage::Offer {
            session_code,
            offer,
        } => {
            if let Err(err) = state.relay.forward_offer(&session_code, connection_id, offer) {
                let _ = tx.send(room_error_event(&err));
            }
        }

        ClientMessage::Answer {
            session_code,
            answer,
        } => {
            if let Err(err) = state
                .relay
                .forward_answer(&session_code, connection_id, answer)
            {
                let _ = tx.send(room_error_event(&err));
            }
        }

        ClientMessage::IceCandidate {
            session_code,
            candidate,
        } => {
            if let Err(err) =
                state
                    .relay
                    .forward_ice_candidate(&session_code, connection_id, candidate)
            {
                let _ = tx.send(room_error_event(&err));
            }
        }

        ClientMessage::ConnectionState {
            session_code,
            state: conn_state,
        } => {
            if let Err(err) = state
                .relay
                .report_connection_state(&session_code, connection_id, &conn_state)
                .await
            {
                let _ = tx.send(room_error_event(&err));
            }
        }

        ClientMessage::ControlEvent {
            session_code,
            event,
        } => {
            state
                .control
                .route_control_event(&session_code, connection_id, event)
                .await;
        }

        ClientMessage::ControlModeChange {
            session_code,
            control_mode,
        } => {
            match state
                .rooms
                .set_control_mode(&session_code, connection_id, control_mode)
            {
                Ok(()) => {}
                Err(RoomError::Forbidden) => {
                    let _ = tx.send(error_event(
                        "forbidden",
                        "only the host can update control settings",
                    ));
                }
                Err(err) => {
                    let _ = tx.send(room_error_event(&err));
                }
            }
        }

        ClientMessage::AgentRegister {
            session_code,
            agent_type,
            capabilities,
        } => {
            if let Err(err) =
                state
                    .agents
                    .register_agent(&session_code, connection_id, &agent_type, capabilities)
            {
                let _ = tx.send(room_error_event(&err));
            }
        }

        ClientMessage::AgentStatus {
            session_code,
            status,
        } => {
            if let Err(err) =
                state
                    .agents
                    .report_agent_status(&session_code, connection_id, &status)
            {
                let _ = tx.send(room_error_event(&err));
            }
        }

        ClientMessage::SessionEnd { session_code } => {
            let role = state
                .registry
                .get(connection_id)
                .map(|entry| entry.role)
                .unwrap_or(Role::Unset);
            let allowed = matches!(role, Role::Host | Role::Viewer)
                && state
                    .rooms
                    .snapshot(&session_code)
                    .map(|room| room.participants().contains(&connection_id))
                    .unwrap_or(false);
            if allowed {
                state.rooms.end_room(&session_code, "ended").await;
            } else {
                let _ = tx.send(room_error_event(&RoomError::Forbidden));
            }
        }

        ClientMessage::Chat {
            session_code,
            message,
        } => {
            let Some(room) = state.rooms.snapshot(&session_code) else {
                let _ = tx.send(room_error_event(&RoomError::RoomNotFound));
                return Ok(());
            };
            if !room.participants().contains(&connection_id) {
                let _ = tx.send(room_error_event(&RoomError::Forbidden));
                return Ok(());
            }
            let from = state
                .registry
                .principal(connection_id)
                .map(|p| p.email)
                .unwrap_or_default();
            for target in room.participants() {
                if target != connection_id {
                    state.registry.deliver(
                        target,
                        ServerMessage::Chat {
                            session_code: session_code.clone(),
                            from: from.clone(),
                            message: message.clone(),
                        },
                    );
                }
            }
        }

        ClientMessage::Ping => {
            let _ = tx.send(ServerMessage::Pong);
        }
    }

    Ok(())
}

fn error_event(code: &str, message: &str) -> ServerMessage {
    ServerMessage::Error {
        code: code.to_string(),
        message: message.to_string(),
    }
}

fn room_error_event(err: &RoomError) -> ServerMessage {
    ServerMessage::Error {
        code: err.code().to_string(),
        message: err.to_string(),
    }
}
