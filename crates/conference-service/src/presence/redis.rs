//! Redis presence backend.
//!
//! Shares presence across service instances. Writes that touch more than one
//! key run as Lua scripts (see [`super::lua_scripts`]).
//!
//! # Connection Pattern
//!
//! `MultiplexedConnection` is cheap to clone and safe to use concurrently, so
//! each operation clones it instead of sharing a locked connection.

use super::lua_scripts;
use super::{Participant, ParticipantUpdate, PresenceRecord, PresenceStore};
use crate::errors::SessionError;
use async_trait::async_trait;
use common::types::ConnectionId;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client, Script};
use std::collections::HashMap;
use tracing::{error, instrument, warn};

fn connection_key(connection_id: ConnectionId) -> String {
    format!("connection:{connection_id}:meeting")
}

fn participants_key(meeting_id: &str) -> String {
    format!("meeting:{meeting_id}:participants")
}

fn decode_participant(raw: &str) -> Result<Participant, SessionError> {
    serde_json::from_str(raw)
        .map_err(|e| SessionError::Presence(format!("Corrupt participant entry: {e}")))
}

fn decode_record(meeting_id: String, raw: &str) -> Result<PresenceRecord, SessionError> {
    Ok(PresenceRecord {
        meeting_id,
        participant: decode_participant(raw)?,
    })
}

fn redis_error(operation: &'static str, e: &redis::RedisError) -> SessionError {
    warn!(
        target: "cs.presence",
        operation = operation,
        error = %e,
        "Redis presence operation failed"
    );
    SessionError::Presence(format!("{operation} failed: {e}"))
}

/// Presence stored in Redis.
#[derive(Clone)]
pub struct RedisPresenceStore {
    connection: MultiplexedConnection,
    add_script: Script,
    remove_script: Script,
    lookup_script: Script,
    update_script: Script,
}

impl RedisPresenceStore {
    /// Connect to Redis.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Presence` if the URL is invalid or the
    /// connection fails.
    pub async fn connect(redis_url: &str) -> Result<Self, SessionError> {
        let client = Client::open(redis_url).map_err(|e| {
            // Do NOT log redis_url: it may embed credentials
            error!(target: "cs.presence", error = %e, "Failed to open Redis client");
            SessionError::Presence(format!("Failed to open Redis client: {e}"))
        })?;

        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| {
                error!(target: "cs.presence", error = %e, "Failed to connect to Redis");
                SessionError::Presence(format!("Failed to connect to Redis: {e}"))
            })?;

        Ok(Self {
            connection,
            add_script: Script::new(lua_scripts::ADD_PARTICIPANT),
            remove_script: Script::new(lua_scripts::REMOVE_PARTICIPANT),
            lookup_script: Script::new(lua_scripts::LOOKUP_PARTICIPANT),
            update_script: Script::new(lua_scripts::UPDATE_PARTICIPANT_FLAG),
        })
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    #[instrument(skip_all, fields(meeting_id = %meeting_id, connection_id = %participant.connection_id))]
    async fn add_participant(
        &self,
        meeting_id: &str,
        participant: Participant,
    ) -> Result<(), SessionError> {
        let mut conn = self.connection.clone();
        let encoded = serde_json::to_string(&participant)
            .map_err(|e| SessionError::Internal(format!("Failed to encode participant: {e}")))?;

        let _: i64 = self
            .add_script
            .key(connection_key(participant.connection_id))
            .key(participants_key(meeting_id))
            .arg(participant.connection_id.to_string())
            .arg(meeting_id)
            .arg(encoded)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("add_participant", &e))?;
        Ok(())
    }

    #[instrument(skip_all, fields(connection_id = %connection_id))]
    async fn remove_participant(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<PresenceRecord>, SessionError> {
        let mut conn = self.connection.clone();
        let removed: Option<(String, String)> = self
            .remove_script
            .key(connection_key(connection_id))
            .arg(connection_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("remove_participant", &e))?;

        removed
            .map(|(meeting_id, raw)| decode_record(meeting_id, &raw))
            .transpose()
    }

    #[instrument(skip_all, fields(meeting_id = %meeting_id))]
    async fn participants(&self, meeting_id: &str) -> Result<Vec<Participant>, SessionError> {
        let mut conn = self.connection.clone();
        let entries: HashMap<String, String> = conn
            .hgetall(participants_key(meeting_id))
            .await
            .map_err(|e| redis_error("participants", &e))?;

        let mut participants: Vec<Participant> = entries
            .values()
            .filter_map(|raw| match decode_participant(raw) {
                Ok(participant) => Some(participant),
                Err(e) => {
                    warn!(
                        target: "cs.presence",
                        meeting_id = %meeting_id,
                        error = %e,
                        "Skipping corrupt participant entry"
                    );
                    None
                }
            })
            .collect();
        participants.sort_by(|a, b| {
            a.user_id
                .cmp(&b.user_id)
                .then(a.connection_id.cmp(&b.connection_id))
        });
        Ok(participants)
    }

    #[instrument(skip_all, fields(connection_id = %connection_id))]
    async fn lookup(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<PresenceRecord>, SessionError> {
        let mut conn = self.connection.clone();
        let found: Option<(String, String)> = self
            .lookup_script
            .key(connection_key(connection_id))
            .arg(connection_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("lookup", &e))?;

        found
            .map(|(meeting_id, raw)| decode_record(meeting_id, &raw))
            .transpose()
    }

    #[instrument(skip_all, fields(connection_id = %connection_id))]
    async fn update_participant(
        &self,
        connection_id: ConnectionId,
        update: ParticipantUpdate,
    ) -> Result<Option<PresenceRecord>, SessionError> {
        let (field, value) = match update {
            ParticipantUpdate::Muted(muted) => ("isMuted", muted),
            ParticipantUpdate::VideoOff(off) => ("isVideoOff", off),
        };

        let mut conn = self.connection.clone();
        let updated: Option<(String, String)> = self
            .update_script
            .key(connection_key(connection_id))
            .arg(connection_id.to_string())
            .arg(field)
            .arg(if value { "1" } else { "0" })
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("update_participant", &e))?;

        updated
            .map(|(meeting_id, raw)| decode_record(meeting_id, &raw))
            .transpose()
    }
}
