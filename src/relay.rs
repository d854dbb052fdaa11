use metrics::counter;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::protocol::ServerMessage;
use crate::registry::ConnectionRegistry;
use crate::rooms::{RoomDirectory, RoomError, SignalState};
use crate::storage::{RecordStore, SessionPatch, SessionStatus};

/// Relays SDP and ICE blobs between the two peers of a room. A dumb
/// forwarder: payloads are never parsed beyond the outer message type, so a
/// malformed blob can only break one peer's negotiation, never the server.
pub struct SignalingRelay {
    rooms: Arc<RoomDirectory>,
    registry: Arc<ConnectionRegistry>,
    store: Arc<dyn RecordStore>,
}

impl SignalingRelay {
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

    /// Host-only. Forwarded verbatim to the viewer when one is attached;
    /// dropped silently while the room is still waiting for a viewer.
    pub fn forward_offer(
        &self,
        session_code: &str,
        sender: Uuid,
        offer: Value,
    ) -> Result<(), RoomError> {
        let viewer = self
            .rooms
            .update(session_code, |room| {
                if room.host_connection_id != sender {
                    return Err(RoomError::Forbidden);
                }
                room.signal_state = SignalState::Offering;
                Ok(room.viewer_connection_id)
            })
            .ok_or(RoomError::RoomNotFound)??;

        match viewer {
            Some(viewer) => {
                self.registry.deliver(
                    viewer,
                    ServerMessage::Offer {
                        session_code: session_code.to_string(),
                        offer,
                    },
                );
                counter!("porthole_signals_forwarded_total", 1, "kind" => "offer");
            }
            None => debug!(%session_code, "offer with no viewer attached, dropped"),
        }
        Ok(())
    }

    /// Viewer-only, and only once an offer is outstanding. An answer from a
    /// connection that is not the registered viewer, or before any offer was
    /// sent, is rejected rather than ignored.
    pub fn forward_answer(
        &self,
        session_code: &str,
        sender: Uuid,
        answer: Value,
    ) -> Result<(), RoomError> {
        let host = self
            .rooms
            .update(session_code, |room| {
                if room.viewer_connection_id != Some(sender) {
                    return Err(RoomError::Forbidden);
                }
                if !matches!(
                    room.signal_state,
                    SignalState::Offering | SignalState::Answering
                ) {
                    return Err(RoomError::Forbidden);
                }
                room.signal_state = SignalState::Answering;
                Ok(room.host_connection_id)
            })
            .ok_or(RoomError::RoomNotFound)??;

        self.registry.deliver(
            host,
            ServerMessage::Answer {
                session_code: session_code.to_string(),
                answer,
            },
        );
        counter!("porthole_signals_forwarded_total", 1, "kind" => "answer");
        Ok(())
    }

    /// No sender-role restriction; both peers emit candidates. The target is
    /// simply the other participant. Candidates are never buffered here;
    /// holding them until the remote description is set is the peer's job.
    pub fn forward_ice_candidate(
        &self,
        session_code: &str,
        sender: Uuid,
        candidate: Value,
    ) -> Result<(), RoomError> {
        let room = self
            .rooms
            .snapshot(session_code)
            .ok_or(RoomError::RoomNotFound)?;

        let target = if room.host_connection_id == sender {
            room.viewer_connection_id
        } else if room.viewer_connection_id == Some(sender) {
            Some(room.host_connection_id)
        } else {
            debug!(%session_code, %sender, "ice candidate from non-peer, dropped");
            None
        };

        if let Some(target) = target {
            self.registry.deliver(
                target,
                ServerMessage::IceCandidate {
                    session_code: session_code.to_string(),
                    candidate,
                },
            );
            counter!("porthole_signals_forwarded_total", 1, "kind" => "ice");
        }
        Ok(())
    }

    /// Persists the reported state onto the session record and rebroadcasts
    /// to the other participants. A failed or disconnected report leaves the
    /// room in place; recovery is a peer-initiated renegotiated offer that
    /// this relay merely forwards.
    pub async fn report_connection_state(
        &self,
        session_code: &str,
        sender: Uuid,
        state: &str,
    ) -> Result<(), RoomError> {
        let participants = self
            .rooms
            .update(session_code, |room| {
                if room.host_connection_id != sender
                    && room.viewer_connection_id != Some(sender)
                {
                    return None;
                }
                match state {
                    "connected" | "completed" => room.signal_state = SignalState::Connected,
                    "failed" | "disconnected" => room.signal_state = SignalState::Failed,
                    _ => {}
                }
                Some(room.participants())
            })
            .ok_or(RoomError::RoomNotFound)?;

        let Some(participants) = participants else {
            debug!(%session_code, %sender, "connection state from non-peer, dropped");
            return Ok(());
        };

        if let Err(err) = self.persist_state(session_code, state).await {
            warn!(%session_code, error = %err, "failed to persist connection state");
        }

        for target in participants {
            if target != sender {
                self.registry.deliver(
                    target,
                    ServerMessage::ConnectionState {
                        session_code: session_code.to_string(),
                        state: state.to_string(),
                    },
                );
            }
        }
        Ok(())
    }

    async fn persist_state(&self, session_code: &str, state: &str) -> anyhow::Result<()> {
        match state {
            "connected" | "completed" => {
                self.store
                    .update_session(
                        session_code,
                        SessionPatch {
                            status: Some(SessionStatus::Active),
                            connection_state: Some(state.to_string()),
                            ..Default::default()
                        },
                    )
                    .await
            }
            "failed" | "disconnected" => {
                let now = chrono::Utc::now();
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
                            connection_state: Some(state.to_string()),
                            ..Default::default()
                        },
                    )
                    .await
            }
            _ => {
                self.store
                    .update_session(
                        session_code,
                        SessionPatch {
                            connection_state: Some(state.to_string()),
                            ..Default::default()
                        },
                    )
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ServerMessage;
    use crate::testutil::{drain, Harness};

    #[tokio::test]
    async fn offer_is_host_only() {
        let h = Harness::new().await;
        h.seed_session("AB23CD", "host-user").await;
        let (host, _host_rx) = h.connect("host-user");
        let (viewer, _viewer_rx) = h.connect("viewer-user");

        h.rooms.create_room("AB23CD", host).await.unwrap();
        h.rooms.join_room("AB23CD", viewer).await.unwrap();

        let err = h
            .relay
            .forward_offer("AB23CD", viewer, serde_json::json!({"sdp": "X"}))
            .unwrap_err();
        assert_eq!(err, RoomError::Forbidden);
        assert_eq!(
            h.rooms.snapshot("AB23CD").unwrap().signal_state,
            SignalState::Empty
        );
    }

    #[tokio::test]
    async fn answer_requires_viewer_and_outstanding_offer() {
        let h = Harness::new().await;
        h.seed_session("AB23CD", "host-user").await;
        let (host, _host_rx) = h.connect("host-user");
        let (viewer, _viewer_rx) = h.connect("viewer-user");

        h.rooms.create_room("AB23CD", host).await.unwrap();
        h.rooms.join_room("AB23CD", viewer).await.unwrap();

        // No offer yet: rejected, not tracked.
        let err = h
            .relay
            .forward_answer("AB23CD", viewer, serde_json::json!({"sdp": "A"}))
            .unwrap_err();
        assert_eq!(err, RoomError::Forbidden);

        h.relay
            .forward_offer("AB23CD", host, serde_json::json!({"sdp": "X"}))
            .unwrap();

        // Host cannot answer its own offer.
        let err = h
            .relay
            .forward_answer("AB23CD", host, serde_json::json!({"sdp": "A"}))
            .unwrap_err();
        assert_eq!(err, RoomError::Forbidden);

        h.relay
            .forward_answer("AB23CD", viewer, serde_json::json!({"sdp": "A"}))
            .unwrap();
        assert_eq!(
            h.rooms.snapshot("AB23CD").unwrap().signal_state,
            SignalState::Answering
        );
    }

    #[tokio::test]
    async fn offer_payload_reaches_viewer_unaltered() {
        let h = Harness::new().await;
        h.seed_session("AB12CD", "host-user").await;
        let (host, _host_rx) = h.connect("host-user");
        let (viewer, mut viewer_rx) = h.connect("viewer-user");

        h.rooms.create_room("AB12CD", host).await.unwrap();
        h.rooms.join_room("AB12CD", viewer).await.unwrap();
        drain(&mut viewer_rx);

        let payload = serde_json::json!({"type": "offer", "sdp": "X"});
        h.relay
            .forward_offer("AB12CD", host, payload.clone())
            .unwrap();

        let received = drain(&mut viewer_rx);
        match received.as_slice() {
            [ServerMessage::Offer {
                session_code,
                offer,
            }] => {
                assert_eq!(session_code, "AB12CD");
                assert_eq!(offer, &payload);
            }
            other => panic!("expected exactly one offer, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn offer_without_viewer_is_dropped_silently() {
        let h = Harness::new().await;
        h.seed_session("AB23CD", "host-user").await;
        let (host, _host_rx) = h.connect("host-user");

        h.rooms.create_room("AB23CD", host).await.unwrap();
        h.relay
            .forward_offer("AB23CD", host, serde_json::json!({"sdp": "X"}))
            .unwrap();
        assert_eq!(
            h.rooms.snapshot("AB23CD").unwrap().signal_state,
            SignalState::Offering
        );
    }

    #[tokio::test]
    async fn ice_candidates_cross_to_the_other_peer() {
        let h = Harness::new().await;
        h.seed_session("AB23CD", "host-user").await;
        let (host, mut host_rx) = h.connect("host-user");
        let (viewer, mut viewer_rx) = h.connect("viewer-user");

        h.rooms.create_room("AB23CD", host).await.unwrap();
        h.rooms.join_room("AB23CD", viewer).await.unwrap();
        drain(&mut host_rx);
        drain(&mut viewer_rx);

        h.relay
            .forward_ice_candidate("AB23CD", host, serde_json::json!({"candidate": "h"}))
            .unwrap();
        h.relay
            .forward_ice_candidate("AB23CD", viewer, serde_json::json!({"candidate": "v"}))
            .unwrap();

        assert!(drain(&mut viewer_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::IceCandidate { .. })));
        assert!(drain(&mut host_rx)
            .iter()
            .any(|m| matches!(m, ServerMessage::IceCandidate { .. })));
    }

    #[tokio::test]
    async fn failed_state_persists_session_end_but_keeps_room() {
        let h = Harness::new().await;
        h.seed_session("AB23CD", "host-user").await;
        let (host, _host_rx) = h.connect("host-user");
        let (viewer, _viewer_rx) = h.connect("viewer-user");

        h.rooms.create_room("AB23CD", host).await.unwrap();
        h.rooms.join_room("AB23CD", viewer).await.unwrap();

        h.relay
            .report_connection_state("AB23CD", viewer, "failed")
            .await
            .unwrap();

        assert_eq!(
            h.rooms.snapshot("AB23CD").unwrap().signal_state,
            SignalState::Failed
        );
        assert!(h.rooms.contains("AB23CD"));
        assert_eq!(
            h.session_status("AB23CD").await,
            Some(SessionStatus::Ended)
        );

        // Recovery path: a renegotiated offer from the host is accepted.
        h.relay
            .forward_offer("AB23CD", host, serde_json::json!({"sdp": "restart"}))
            .unwrap();
        assert_eq!(
            h.rooms.snapshot("AB23CD").unwrap().signal_state,
            SignalState::Offering
        );
    }

    #[tokio::test]
    async fn connected_state_rebroadcasts_and_activates() {
        let h = Harness::new().await;
        h.seed_session("AB23CD", "host-user").await;
        let (host, mut host_rx) = h.connect("host-user");
        let (viewer, _viewer_rx) = h.connect("viewer-user");

        h.rooms.create_room("AB23CD", host).await.unwrap();
        h.rooms.join_room("AB23CD", viewer).await.unwrap();
        drain(&mut host_rx);

        h.relay
            .report_connection_state("AB23CD", viewer, "connected")
            .await
            .unwrap();

        assert_eq!(
            h.rooms.snapshot("AB23CD").unwrap().signal_state,
            SignalState::Connected
        );
        assert!(drain(&mut host_rx).iter().any(|m| matches!(
            m,
            ServerMessage::ConnectionState { state, .. } if state == "connected"
        )));
        assert_eq!(
            h.session_status("AB23CD").await,
            Some(SessionStatus::Active)
        );
    }
}
