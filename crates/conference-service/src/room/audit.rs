//! Membership audit stream.
//!
//! Joins and departures are published on a broadcast channel. Subscribers
//! run off the request path; a lagging subscriber loses entries, the room
//! never waits for it.

use chrono::{DateTime, Utc};
use common::types::ConnectionId;
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) const AUDIT_CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Joined,
    Left,
    Superseded,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Joined => "joined",
            AuditAction::Left => "left",
            AuditAction::Superseded => "superseded",
        }
    }
}

/// One membership change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEvent {
    pub action: AuditAction,
    pub meeting_id: String,
    pub user_id: String,
    pub connection_id: ConnectionId,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    pub(crate) fn now(
        action: AuditAction,
        meeting_id: &str,
        user_id: &str,
        connection_id: ConnectionId,
    ) -> Self {
        Self {
            action,
            meeting_id: meeting_id.to_string(),
            user_id: user_id.to_string(),
            connection_id,
            at: Utc::now(),
        }
    }
}

/// Write every membership change to the `cs.audit` log target until
/// cancelled or the room service is dropped.
pub fn spawn_audit_logger(
    mut events: broadcast::Receiver<AuditEvent>,
    cancel_token: CancellationToken,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut logged = 0u64;
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    debug!(target: "cs.audit", "Audit logger cancelled");
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => {
                        info!(
                            target: "cs.audit",
                            action = event.action.as_str(),
                            meeting_id = %event.meeting_id,
                            user_id = %event.user_id,
                            connection_id = %event.connection_id,
                            at = %event.at.to_rfc3339(),
                            "Membership changed"
                        );
                        logged += 1;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "cs.audit", skipped = skipped, "Audit logger lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
        logged
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_audit_event_serializes_snake_case_action() {
        let event = AuditEvent::now(AuditAction::Superseded, "m1", "alice", ConnectionId::new());
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(json["action"], "superseded");
        assert_eq!(json["meeting_id"], "m1");
    }

    #[tokio::test]
    async fn test_logger_drains_until_sender_dropped() {
        let (tx, rx) = broadcast::channel(8);
        let logger = spawn_audit_logger(rx, CancellationToken::new());

        tx.send(AuditEvent::now(AuditAction::Joined, "m1", "alice", ConnectionId::new()))
            .unwrap();
        tx.send(AuditEvent::now(AuditAction::Left, "m1", "alice", ConnectionId::new()))
            .unwrap();
        drop(tx);

        assert_eq!(logger.await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_logger_stops_on_cancel() {
        let (_tx, rx) = broadcast::channel::<AuditEvent>(8);
        let token = CancellationToken::new();
        let logger = spawn_audit_logger(rx, token.clone());

        token.cancel();

        assert_eq!(logger.await.unwrap(), 0);
    }
}
