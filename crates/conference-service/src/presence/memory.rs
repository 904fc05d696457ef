//! In-memory presence backend.

use super::{Participant, ParticipantUpdate, PresenceRecord, PresenceStore};
use crate::errors::SessionError;
use async_trait::async_trait;
use common::types::ConnectionId;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Default)]
struct Rooms {
    /// Participants per meeting, in join order.
    meetings: HashMap<String, Vec<Participant>>,
    /// Owning meeting per connection.
    connections: HashMap<ConnectionId, String>,
}

impl Rooms {
    fn take(&mut self, connection_id: ConnectionId) -> Option<PresenceRecord> {
        let meeting_id = self.connections.remove(&connection_id)?;
        let members = self.meetings.get_mut(&meeting_id)?;
        let position = members
            .iter()
            .position(|p| p.connection_id == connection_id)?;
        let participant = members.remove(position);
        if members.is_empty() {
            self.meetings.remove(&meeting_id);
        }
        Some(PresenceRecord {
            meeting_id,
            participant,
        })
    }

    fn find_mut(&mut self, connection_id: ConnectionId) -> Option<(String, &mut Participant)> {
        let meeting_id = self.connections.get(&connection_id)?.clone();
        let participant = self
            .meetings
            .get_mut(&meeting_id)?
            .iter_mut()
            .find(|p| p.connection_id == connection_id)?;
        Some((meeting_id, participant))
    }
}

/// Presence kept in process memory. Lost on restart.
#[derive(Default)]
pub struct InMemoryPresenceStore {
    rooms: Mutex<Rooms>,
}

impl InMemoryPresenceStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn rooms(&self) -> MutexGuard<'_, Rooms> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of meetings with at least one participant.
    #[must_use]
    pub fn meeting_count(&self) -> usize {
        self.rooms().meetings.len()
    }
}

#[async_trait]
impl PresenceStore for InMemoryPresenceStore {
    async fn add_participant(
        &self,
        meeting_id: &str,
        participant: Participant,
    ) -> Result<(), SessionError> {
        let mut rooms = self.rooms();
        rooms.take(participant.connection_id);
        rooms
            .connections
            .insert(participant.connection_id, meeting_id.to_string());
        rooms
            .meetings
            .entry(meeting_id.to_string())
            .or_default()
            .push(participant);
        Ok(())
    }

    async fn remove_participant(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<PresenceRecord>, SessionError> {
        Ok(self.rooms().take(connection_id))
    }

    async fn participants(&self, meeting_id: &str) -> Result<Vec<Participant>, SessionError> {
        Ok(self
            .rooms()
            .meetings
            .get(meeting_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn lookup(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<PresenceRecord>, SessionError> {
        let mut rooms = self.rooms();
        Ok(rooms
            .find_mut(connection_id)
            .map(|(meeting_id, participant)| PresenceRecord {
                meeting_id,
                participant: participant.clone(),
            }))
    }

    async fn update_participant(
        &self,
        connection_id: ConnectionId,
        update: ParticipantUpdate,
    ) -> Result<Option<PresenceRecord>, SessionError> {
        let mut rooms = self.rooms();
        Ok(rooms
            .find_mut(connection_id)
            .map(|(meeting_id, participant)| {
                update.apply(participant);
                PresenceRecord {
                    meeting_id,
                    participant: participant.clone(),
                }
            }))
    }
}
