//! Registry of attached signaling connections and their outbound queues.

use super::protocol::ServerMessage;
use crate::events::{EventSink, SessionEvent};
use crate::observability::metrics;
use common::types::ConnectionId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Clone)]
struct Outbound {
    sender: mpsc::Sender<ServerMessage>,
    cancel_token: CancellationToken,
}

/// Attached connections, keyed by connection id.
///
/// Events are pushed with `try_send`: a full queue drops the event for that
/// recipient instead of blocking the room.
#[derive(Default)]
pub struct ConnectionHub {
    connections: Mutex<HashMap<ConnectionId, Outbound>>,
}

impl ConnectionHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Outbound>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach a connection's outbound queue. `cancel_token` stops the
    /// connection's reader when it is superseded.
    pub fn register(
        &self,
        connection_id: ConnectionId,
        sender: mpsc::Sender<ServerMessage>,
        cancel_token: CancellationToken,
    ) {
        let count = {
            let mut connections = self.connections();
            connections.insert(
                connection_id,
                Outbound {
                    sender,
                    cancel_token,
                },
            );
            connections.len()
        };
        metrics::set_connections_active(count as u64);
    }

    /// Detach a connection. Idempotent.
    pub fn unregister(&self, connection_id: ConnectionId) {
        let count = {
            let mut connections = self.connections();
            connections.remove(&connection_id);
            connections.len()
        };
        metrics::set_connections_active(count as u64);
    }

    #[must_use]
    pub fn is_attached(&self, connection_id: ConnectionId) -> bool {
        self.connections().contains_key(&connection_id)
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections().len()
    }

    fn outbound(&self, connection_id: ConnectionId) -> Option<Outbound> {
        self.connections().get(&connection_id).cloned()
    }
}

impl EventSink for ConnectionHub {
    fn deliver(&self, recipients: &[ConnectionId], event: &SessionEvent) {
        let targets: Vec<(ConnectionId, mpsc::Sender<ServerMessage>)> = {
            let connections = self.connections();
            recipients
                .iter()
                .filter_map(|id| connections.get(id).map(|o| (*id, o.sender.clone())))
                .collect()
        };

        for (connection_id, sender) in targets {
            match sender.try_send(ServerMessage::Event(event.clone())) {
                Ok(()) => {}
                Err(TrySendError::Full(_) | TrySendError::Closed(_)) => {
                    metrics::record_event_dropped(event.name());
                    debug!(
                        target: "cs.gateway",
                        connection_id = %connection_id,
                        event = event.name(),
                        "Outbound queue unavailable, event dropped"
                    );
                }
            }
        }
    }

    fn supersede(&self, connection_id: ConnectionId) {
        let Some(outbound) = self.outbound(connection_id) else {
            return;
        };
        if outbound.sender.try_send(ServerMessage::superseded()).is_err() {
            debug!(
                target: "cs.gateway",
                connection_id = %connection_id,
                "Superseded notice could not be queued"
            );
        }
        outbound.cancel_token.cancel();
        info!(
            target: "cs.gateway",
            connection_id = %connection_id,
            "Connection superseded"
        );
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::events::ParticipantMuted;

    fn muted() -> SessionEvent {
        SessionEvent::ParticipantMuted(ParticipantMuted {
            user_id: "alice".to_string(),
            is_muted: true,
        })
    }

    #[tokio::test]
    async fn test_deliver_reaches_only_listed_connections() {
        let hub = ConnectionHub::new();
        let (a_tx, mut a_rx) = mpsc::channel(4);
        let (b_tx, mut b_rx) = mpsc::channel(4);
        let a = ConnectionId::new();
        let b = ConnectionId::new();
        hub.register(a, a_tx, CancellationToken::new());
        hub.register(b, b_tx, CancellationToken::new());

        hub.deliver(&[a, ConnectionId::new()], &muted());

        assert!(matches!(a_rx.try_recv().unwrap(), ServerMessage::Event(_)));
        assert!(b_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_full_queue_drops_instead_of_blocking() {
        let hub = ConnectionHub::new();
        let (tx, mut rx) = mpsc::channel(1);
        let conn = ConnectionId::new();
        hub.register(conn, tx, CancellationToken::new());

        hub.deliver(&[conn], &muted());
        hub.deliver(&[conn], &muted());

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_supersede_sends_closing_and_cancels() {
        let hub = ConnectionHub::new();
        let (tx, mut rx) = mpsc::channel(4);
        let token = CancellationToken::new();
        let conn = ConnectionId::new();
        hub.register(conn, tx, token.clone());

        hub.supersede(conn);

        assert!(token.is_cancelled());
        assert_eq!(rx.try_recv().unwrap(), ServerMessage::superseded());
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let hub = ConnectionHub::new();
        let (tx, _rx) = mpsc::channel(1);
        let conn = ConnectionId::new();
        hub.register(conn, tx, CancellationToken::new());

        hub.unregister(conn);
        hub.unregister(conn);

        assert!(!hub.is_attached(conn));
        assert_eq!(hub.connection_count(), 0);
    }
}
