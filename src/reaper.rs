use chrono::Utc;
use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::rooms::RoomDirectory;
use crate::storage::{RecordStore, SessionPatch, SessionStatus};

/// Periodic sweep that reclaims sessions whose deadline has passed. Rooms
/// themselves keep no timers; an unused room simply waits here for its
/// record to expire.
pub fn spawn_reaper(
    rooms: Arc<RoomDirectory>,
    store: Arc<dyn RecordStore>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match sweep_expired(&rooms, store.as_ref()).await {
                Ok(0) => {}
                Ok(count) => info!(count, "reaped expired sessions"),
                Err(err) => warn!(error = %err, "expiry sweep failed"),
            }
        }
    })
}

/// One sweep pass. Every persisted session past its expiry and not yet
/// ended transitions to ended; a live room for it is torn down with reason
/// `expired`, which notifies all attached participants.
pub async fn sweep_expired(
    rooms: &RoomDirectory,
    store: &dyn RecordStore,
) -> anyhow::Result<usize> {
    let now = Utc::now();
    let mut reaped = 0usize;

    for record in store.list_sessions().await? {
        if record.status == SessionStatus::Ended || !record.expired(now) {
            continue;
        }

        let code = record.session_code.as_str();
        if rooms.end_room(code, "expired").await {
            // end_room already persisted the terminal status.
        } else {
            let duration = record
                .started_at
                .map(|started| (now - started).num_seconds().max(0))
                .unwrap_or(0);
            if let Err(err) = store
                .update_session(
                    code,
                    SessionPatch {
                        status: Some(SessionStatus::Ended),
                        ended_at: Some(now),
                        duration_secs: Some(duration),
                        ..Default::default()
                    },
                )
                .await
            {
                warn!(session_code = %code, error = %err, "failed to persist reaped session");
                continue;
            }
        }
        counter!("porthole_sessions_reaped_total", 1);
        reaped += 1;
    }

    Ok(reaped)
}
