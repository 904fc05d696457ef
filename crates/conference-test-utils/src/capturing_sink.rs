//! Event sink that records every delivery.

use common::types::ConnectionId;
use conference_service::events::{EventSink, SessionEvent};
use std::sync::Mutex;

/// Records events per recipient and superseded connections, in order.
#[derive(Default)]
pub struct CapturingSink {
    delivered: Mutex<Vec<(ConnectionId, SessionEvent)>>,
    superseded: Mutex<Vec<ConnectionId>>,
}

impl CapturingSink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events delivered to one connection, oldest first.
    #[must_use]
    pub fn events_for(&self, connection_id: ConnectionId) -> Vec<SessionEvent> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| *to == connection_id)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Wire names of the events delivered to one connection.
    #[must_use]
    pub fn event_names_for(&self, connection_id: ConnectionId) -> Vec<&'static str> {
        self.events_for(connection_id)
            .iter()
            .map(SessionEvent::name)
            .collect()
    }

    #[must_use]
    pub fn superseded(&self) -> Vec<ConnectionId> {
        self.superseded.lock().unwrap().clone()
    }

    /// Forget everything recorded so far.
    pub fn clear(&self) {
        self.delivered.lock().unwrap().clear();
        self.superseded.lock().unwrap().clear();
    }
}

impl EventSink for CapturingSink {
    fn deliver(&self, recipients: &[ConnectionId], event: &SessionEvent) {
        let mut delivered = self.delivered.lock().unwrap();
        for recipient in recipients {
            delivered.push((*recipient, event.clone()));
        }
    }

    fn supersede(&self, connection_id: ConnectionId) {
        self.superseded.lock().unwrap().push(connection_id);
    }
}
