//! Server-to-client events and the sink that fans them out.
//!
//! Room and media components decide *who* receives an event (from presence);
//! the sink only delivers. Delivery is best-effort and at-most-once per
//! recipient; a member that misses an event reconciles from its next snapshot.

use crate::media::MediaKind;
use common::types::ConnectionId;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantJoined {
    pub user_id: String,
    pub connection_id: ConnectionId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantLeft {
    pub user_id: String,
    pub connection_id: ConnectionId,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantMuted {
    pub user_id: String,
    pub is_muted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantVideoToggled {
    pub user_id: String,
    pub is_video_off: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducer {
    pub producer_id: String,
    pub meeting_id: String,
    pub user_id: String,
    pub kind: MediaKind,
    /// Opaque client tag supplied with `produce`.
    #[serde(skip_serializing_if = "Value::is_null")]
    pub app_data: Value,
}

/// Chat message relayed to every member. Never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub meeting_id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    /// Server-assigned Unix time in milliseconds.
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerClosed {
    pub consumer_id: String,
    pub producer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaUnavailable {
    pub meeting_id: String,
}

/// Every event a client can receive outside a request/response exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum SessionEvent {
    ParticipantJoined(ParticipantJoined),
    ParticipantLeft(ParticipantLeft),
    ParticipantMuted(ParticipantMuted),
    ParticipantVideoToggled(ParticipantVideoToggled),
    NewProducer(NewProducer),
    ChatMessage(ChatMessage),
    ConsumerClosed(ConsumerClosed),
    MediaUnavailable(MediaUnavailable),
}

impl SessionEvent {
    /// Wire name, also used as a bounded metric label.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::ParticipantJoined(_) => "participant-joined",
            SessionEvent::ParticipantLeft(_) => "participant-left",
            SessionEvent::ParticipantMuted(_) => "participant-muted",
            SessionEvent::ParticipantVideoToggled(_) => "participant-video-toggled",
            SessionEvent::NewProducer(_) => "new-producer",
            SessionEvent::ChatMessage(_) => "chat-message",
            SessionEvent::ConsumerClosed(_) => "consumer-closed",
            SessionEvent::MediaUnavailable(_) => "media-unavailable",
        }
    }
}

/// Delivery side of room fan-out.
///
/// Implementations must not block: a slow recipient loses events rather than
/// stalling the room.
pub trait EventSink: Send + Sync {
    /// Deliver `event` to each listed connection that is still attached.
    fn deliver(&self, recipients: &[ConnectionId], event: &SessionEvent);

    /// Tell a connection it was replaced by a newer one for the same user and
    /// close it.
    fn supersede(&self, connection_id: ConnectionId);
}


#[cfg(test)]
pub(crate) mod test_support {
    use super::{EventSink, SessionEvent};
    use common::types::ConnectionId;
    use std::sync::{Mutex, PoisonError};

    /// Sink that records deliveries and supersede notices.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        delivered: Mutex<Vec<(Vec<ConnectionId>, SessionEvent)>>,
        superseded: Mutex<Vec<ConnectionId>>,
    }

    impl RecordingSink {
        pub(crate) fn events_for(&self, connection_id: ConnectionId) -> Vec<SessionEvent> {
            self.delivered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|(to, _)| to.contains(&connection_id))
                .map(|(_, event)| event.clone())
                .collect()
        }

        pub(crate) fn superseded(&self) -> Vec<ConnectionId> {
            self.superseded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }
    }

    impl EventSink for RecordingSink {
        fn deliver(&self, recipients: &[ConnectionId], event: &SessionEvent) {
            self.delivered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((recipients.to_vec(), event.clone()));
        }

        fn supersede(&self, connection_id: ConnectionId) {
            self.superseded
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(connection_id);
        }
    }
}
