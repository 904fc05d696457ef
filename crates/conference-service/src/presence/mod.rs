//! Presence store: meeting → participants, connection → owning participant.
//!
//! The room service and media fan-out consult the store for every broadcast
//! decision. Two backends ship:
//!
//! - [`InMemoryPresenceStore`] - single-process default
//! - [`RedisPresenceStore`] - shared state across instances
//!
//! Both guarantee that one connection id maps to at most one participant in
//! at most one meeting, and that removal is atomic (a concurrent second
//! removal of the same connection observes `None`).

mod lua_scripts;
pub mod memory;
pub mod redis;

pub use memory::InMemoryPresenceStore;
pub use redis::RedisPresenceStore;

use crate::errors::SessionError;
use async_trait::async_trait;
use common::types::ConnectionId;
use serde::{Deserialize, Serialize};

/// A participant as seen by every member of a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub user_id: String,
    pub connection_id: ConnectionId,
    pub display_name: String,
    pub is_muted: bool,
    pub is_video_off: bool,
}

impl Participant {
    /// New participant with audio and video on.
    #[must_use]
    pub fn new(
        user_id: impl Into<String>,
        connection_id: ConnectionId,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            connection_id,
            display_name: display_name.into(),
            is_muted: false,
            is_video_off: false,
        }
    }
}

/// A participant together with the meeting it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceRecord {
    pub meeting_id: String,
    pub participant: Participant,
}

/// State toggle applied to an existing participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParticipantUpdate {
    Muted(bool),
    VideoOff(bool),
}

impl ParticipantUpdate {
    pub(crate) fn apply(self, participant: &mut Participant) {
        match self {
            ParticipantUpdate::Muted(muted) => participant.is_muted = muted,
            ParticipantUpdate::VideoOff(off) => participant.is_video_off = off,
        }
    }
}

/// Presence backend.
///
/// Errors are reported as `SessionError::Presence` and never leak backend
/// details to clients.
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Register `participant` in `meeting_id`, keyed by its connection id.
    /// Re-adding the same connection replaces its entry.
    async fn add_participant(
        &self,
        meeting_id: &str,
        participant: Participant,
    ) -> Result<(), SessionError>;

    /// Remove a connection's participant. Returns `None` if the connection is
    /// not registered (already removed or never joined).
    async fn remove_participant(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<PresenceRecord>, SessionError>;

    /// All participants of a meeting.
    async fn participants(&self, meeting_id: &str) -> Result<Vec<Participant>, SessionError>;

    /// Participant and meeting owned by a connection.
    async fn lookup(&self, connection_id: ConnectionId)
        -> Result<Option<PresenceRecord>, SessionError>;

    /// Apply a toggle to a connection's participant and return the updated
    /// record, or `None` if the connection is not registered.
    async fn update_participant(
        &self,
        connection_id: ConnectionId,
        update: ParticipantUpdate,
    ) -> Result<Option<PresenceRecord>, SessionError>;
}
