//! Room service: membership, participant state and chat relay.
//!
//! Operations on one meeting are serialized by a per-meeting async lock, so
//! a superseding join and the departure of the connection it replaces can
//! never both broadcast `participant-left`. Presence is the single source of
//! truth for who receives a broadcast.

pub mod audit;
pub mod policy;

pub use audit::{spawn_audit_logger, AuditAction, AuditEvent};
pub use policy::{AllowAllAuthorizer, MeetingAuthorizer, MutationPolicy, SelfOnlyPolicy};

use crate::config::DEFAULT_MAX_CHAT_LENGTH;
use crate::errors::SessionError;
use crate::events::{
    ChatMessage, EventSink, ParticipantJoined, ParticipantLeft, ParticipantMuted,
    ParticipantVideoToggled, SessionEvent,
};
use crate::media::MediaSessionManager;
use crate::presence::{Participant, ParticipantUpdate, PresenceRecord, PresenceStore};
use common::types::ConnectionId;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tracing::{info, instrument, warn};

/// Participant list returned to a joiner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshot {
    pub meeting_id: String,
    /// Every member including the joiner.
    pub participants: Vec<Participant>,
}

/// Result of a successful leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub meeting_id: String,
    pub user_id: String,
}

/// Membership and in-room state for every meeting hosted by this process.
pub struct RoomService {
    presence: Arc<dyn PresenceStore>,
    media: Arc<MediaSessionManager>,
    sink: Arc<dyn EventSink>,
    authorizer: Arc<dyn MeetingAuthorizer>,
    policy: Arc<dyn MutationPolicy>,
    meeting_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    /// Last chat timestamp handed out, in Unix milliseconds.
    chat_clock: AtomicI64,
    audit: broadcast::Sender<AuditEvent>,
    max_chat_length: usize,
}

impl RoomService {
    /// Room service with the allow-all authorizer and self-only policy.
    pub fn new(
        presence: Arc<dyn PresenceStore>,
        media: Arc<MediaSessionManager>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let (audit, _) = broadcast::channel(audit::AUDIT_CHANNEL_CAPACITY);
        Self {
            presence,
            media,
            sink,
            authorizer: Arc::new(AllowAllAuthorizer),
            policy: Arc::new(SelfOnlyPolicy),
            meeting_locks: Mutex::new(HashMap::new()),
            chat_clock: AtomicI64::new(0),
            audit,
            max_chat_length: DEFAULT_MAX_CHAT_LENGTH,
        }
    }

    #[must_use]
    pub fn with_authorizer(mut self, authorizer: Arc<dyn MeetingAuthorizer>) -> Self {
        self.authorizer = authorizer;
        self
    }

    #[must_use]
    pub fn with_policy(mut self, policy: Arc<dyn MutationPolicy>) -> Self {
        self.policy = policy;
        self
    }

    #[must_use]
    pub fn with_max_chat_length(mut self, max_chat_length: usize) -> Self {
        self.max_chat_length = max_chat_length;
        self
    }

    #[must_use]
    pub fn media(&self) -> &Arc<MediaSessionManager> {
        &self.media
    }

    /// Subscribe to membership changes.
    pub fn subscribe_audit(&self) -> broadcast::Receiver<AuditEvent> {
        self.audit.subscribe()
    }

    fn locks(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.meeting_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn meeting_lock(&self, meeting_id: &str) -> Arc<AsyncMutex<()>> {
        Arc::clone(self.locks().entry(meeting_id.to_string()).or_default())
    }

    /// Forget a meeting's lock once nobody else holds a reference to it.
    fn prune_meeting_lock(&self, meeting_id: &str) {
        let mut locks = self.locks();
        if locks
            .get(meeting_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(meeting_id);
        }
    }

    fn publish_audit(&self, event: AuditEvent) {
        // No subscribers is fine
        let _ = self.audit.send(event);
    }

    async fn members(&self, meeting_id: &str) -> Result<Vec<ConnectionId>, SessionError> {
        Ok(self
            .presence
            .participants(meeting_id)
            .await?
            .into_iter()
            .map(|p| p.connection_id)
            .collect())
    }

    /// Register a connection as a participant of `meeting_id`.
    ///
    /// A live connection of the same user in the same meeting is superseded:
    /// its media is closed, its presence removed, it is told it was replaced,
    /// and `participant-left` goes out before the new `participant-joined`.
    ///
    /// # Errors
    ///
    /// `BadRequest` for empty ids, `Unauthorized` from the authorizer,
    /// `AlreadyJoined` if this connection already belongs to a room.
    #[instrument(
        skip_all,
        name = "cs.room.join",
        fields(meeting_id = %meeting_id, user_id = %user_id, connection_id = %connection_id)
    )]
    pub async fn join(
        &self,
        connection_id: ConnectionId,
        meeting_id: &str,
        user_id: &str,
        display_name: &str,
    ) -> Result<RoomSnapshot, SessionError> {
        if meeting_id.is_empty() || user_id.is_empty() {
            return Err(SessionError::BadRequest(
                "meetingId and userId are required".to_string(),
            ));
        }
        self.authorizer.authorize(meeting_id, user_id).await?;
        if let Some(existing) = self.presence.lookup(connection_id).await? {
            return Err(SessionError::AlreadyJoined(existing.meeting_id));
        }

        let joined = {
            let lock = self.meeting_lock(meeting_id);
            let _guard = lock.lock().await;
            self.join_locked(connection_id, meeting_id, user_id, display_name)
                .await
        };
        self.prune_meeting_lock(meeting_id);
        joined
    }

    /// Caller holds the meeting lock.
    async fn join_locked(
        &self,
        connection_id: ConnectionId,
        meeting_id: &str,
        user_id: &str,
        display_name: &str,
    ) -> Result<RoomSnapshot, SessionError> {
        let prior: Vec<ConnectionId> = self
            .presence
            .participants(meeting_id)
            .await?
            .into_iter()
            .filter(|p| p.user_id == user_id && p.connection_id != connection_id)
            .map(|p| p.connection_id)
            .collect();
        for old_connection in prior {
            self.supersede(meeting_id, old_connection).await?;
        }

        self.presence
            .add_participant(
                meeting_id,
                Participant::new(user_id, connection_id, display_name),
            )
            .await?;
        self.media.open(connection_id, meeting_id, user_id).await;

        let participants = self.presence.participants(meeting_id).await?;
        let others: Vec<ConnectionId> = participants
            .iter()
            .map(|p| p.connection_id)
            .filter(|id| *id != connection_id)
            .collect();
        self.sink.deliver(
            &others,
            &SessionEvent::ParticipantJoined(ParticipantJoined {
                user_id: user_id.to_string(),
                connection_id,
                name: display_name.to_string(),
            }),
        );
        self.publish_audit(AuditEvent::now(
            AuditAction::Joined,
            meeting_id,
            user_id,
            connection_id,
        ));

        info!(
            target: "cs.room",
            meeting_id = %meeting_id,
            user_id = %user_id,
            connection_id = %connection_id,
            participants = participants.len(),
            "Participant joined"
        );
        Ok(RoomSnapshot {
            meeting_id: meeting_id.to_string(),
            participants,
        })
    }

    /// Replace `old_connection`. Caller holds the meeting lock.
    async fn supersede(
        &self,
        meeting_id: &str,
        old_connection: ConnectionId,
    ) -> Result<(), SessionError> {
        self.media.close_for_connection(old_connection).await;
        let Some(removed) = self.presence.remove_participant(old_connection).await? else {
            return Ok(());
        };
        self.sink.supersede(old_connection);

        let remaining = self.members(meeting_id).await?;
        self.sink.deliver(
            &remaining,
            &SessionEvent::ParticipantLeft(ParticipantLeft {
                user_id: removed.participant.user_id.clone(),
                connection_id: old_connection,
                name: removed.participant.display_name.clone(),
            }),
        );
        self.publish_audit(AuditEvent::now(
            AuditAction::Superseded,
            meeting_id,
            &removed.participant.user_id,
            old_connection,
        ));
        info!(
            target: "cs.room",
            meeting_id = %meeting_id,
            user_id = %removed.participant.user_id,
            connection_id = %old_connection,
            "Connection superseded by re-join"
        );
        Ok(())
    }

    /// Remove a connection from its room. Idempotent: returns `None` if the
    /// connection is not (or no longer) a participant. Media is closed either
    /// way.
    ///
    /// # Errors
    ///
    /// Presence backend failures.
    #[instrument(skip_all, name = "cs.room.leave", fields(connection_id = %connection_id))]
    pub async fn leave(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Option<Departure>, SessionError> {
        self.media.close_for_connection(connection_id).await;

        let Some(record) = self.presence.lookup(connection_id).await? else {
            return Ok(None);
        };
        let meeting_id = record.meeting_id;

        let departure = {
            let lock = self.meeting_lock(&meeting_id);
            let _guard = lock.lock().await;

            match self.presence.remove_participant(connection_id).await? {
                Some(removed) => {
                    let remaining = self.members(&meeting_id).await?;
                    self.sink.deliver(
                        &remaining,
                        &SessionEvent::ParticipantLeft(ParticipantLeft {
                            user_id: removed.participant.user_id.clone(),
                            connection_id,
                            name: removed.participant.display_name.clone(),
                        }),
                    );
                    self.publish_audit(AuditEvent::now(
                        AuditAction::Left,
                        &meeting_id,
                        &removed.participant.user_id,
                        connection_id,
                    ));
                    info!(
                        target: "cs.room",
                        meeting_id = %meeting_id,
                        user_id = %removed.participant.user_id,
                        connection_id = %connection_id,
                        remaining = remaining.len(),
                        "Participant left"
                    );
                    Some(Departure {
                        meeting_id: meeting_id.clone(),
                        user_id: removed.participant.user_id,
                    })
                }
                None => None,
            }
        };
        self.prune_meeting_lock(&meeting_id);
        Ok(departure)
    }

    /// Set `target`'s mute flag on behalf of `actor` and broadcast it.
    ///
    /// Returns `false` when the mutation policy refuses; the refusal is
    /// logged and nothing changes.
    ///
    /// # Errors
    ///
    /// `NotJoined` if the actor is not in a room, `NotFound` if the target is
    /// not a participant.
    pub async fn set_muted(
        &self,
        actor: ConnectionId,
        target: ConnectionId,
        muted: bool,
    ) -> Result<bool, SessionError> {
        self.mutate(actor, target, ParticipantUpdate::Muted(muted))
            .await
    }

    /// Set `target`'s video-off flag on behalf of `actor` and broadcast it.
    ///
    /// # Errors
    ///
    /// As for [`set_muted`](Self::set_muted).
    pub async fn set_video_off(
        &self,
        actor: ConnectionId,
        target: ConnectionId,
        off: bool,
    ) -> Result<bool, SessionError> {
        self.mutate(actor, target, ParticipantUpdate::VideoOff(off))
            .await
    }

    #[instrument(skip_all, name = "cs.room.mutate", fields(actor = %actor, target = %target))]
    async fn mutate(
        &self,
        actor: ConnectionId,
        target: ConnectionId,
        update: ParticipantUpdate,
    ) -> Result<bool, SessionError> {
        let actor_record = self
            .presence
            .lookup(actor)
            .await?
            .ok_or(SessionError::NotJoined)?;
        let target_record: PresenceRecord = if target == actor {
            actor_record.clone()
        } else {
            self.presence
                .lookup(target)
                .await?
                .ok_or_else(|| SessionError::NotFound {
                    kind: "participant",
                    id: target.to_string(),
                })?
        };

        if !self.policy.may_mutate(&actor_record, &target_record) {
            warn!(
                target: "cs.room",
                meeting_id = %actor_record.meeting_id,
                actor = %actor,
                target = %target,
                "Participant mutation refused by policy"
            );
            return Ok(false);
        }

        let meeting_id = target_record.meeting_id;
        let applied = {
            let lock = self.meeting_lock(&meeting_id);
            let _guard = lock.lock().await;
            self.apply_update(&meeting_id, target, update).await
        };
        self.prune_meeting_lock(&meeting_id);
        applied.map(|()| true)
    }

    /// Store and broadcast a toggle. Caller holds the meeting lock.
    async fn apply_update(
        &self,
        meeting_id: &str,
        target: ConnectionId,
        update: ParticipantUpdate,
    ) -> Result<(), SessionError> {
        let updated = self
            .presence
            .update_participant(target, update)
            .await?
            .ok_or(SessionError::NotJoined)?;
        let event = match update {
            ParticipantUpdate::Muted(is_muted) => SessionEvent::ParticipantMuted(ParticipantMuted {
                user_id: updated.participant.user_id.clone(),
                is_muted,
            }),
            ParticipantUpdate::VideoOff(is_video_off) => {
                SessionEvent::ParticipantVideoToggled(ParticipantVideoToggled {
                    user_id: updated.participant.user_id.clone(),
                    is_video_off,
                })
            }
        };
        let members = self.members(meeting_id).await?;
        self.sink.deliver(&members, &event);
        Ok(())
    }

    /// Broadcast a chat message from `connection_id` to every member of its
    /// meeting, sender included. Sender identity comes from presence, so a
    /// connection that was superseded or has left cannot speak. Timestamps
    /// never decrease across calls.
    ///
    /// # Errors
    ///
    /// `BadRequest` for empty or oversized content, `NotJoined` if the
    /// connection is not a participant.
    #[instrument(skip_all, name = "cs.room.chat", fields(connection_id = %connection_id))]
    pub async fn relay_chat(
        &self,
        connection_id: ConnectionId,
        content: &str,
    ) -> Result<ChatMessage, SessionError> {
        if content.trim().is_empty() {
            return Err(SessionError::BadRequest(
                "chat content must not be empty".to_string(),
            ));
        }
        if content.len() > self.max_chat_length {
            return Err(SessionError::BadRequest(format!(
                "chat content exceeds {} bytes",
                self.max_chat_length
            )));
        }

        let meeting_id = self
            .presence
            .lookup(connection_id)
            .await?
            .ok_or(SessionError::NotJoined)?
            .meeting_id;

        let relayed = {
            let lock = self.meeting_lock(&meeting_id);
            let _guard = lock.lock().await;
            self.relay_chat_locked(connection_id, content).await
        };
        self.prune_meeting_lock(&meeting_id);
        relayed
    }

    /// Caller holds the meeting lock. Membership is re-read under the lock
    /// because a superseding join may have removed the sender meanwhile.
    async fn relay_chat_locked(
        &self,
        connection_id: ConnectionId,
        content: &str,
    ) -> Result<ChatMessage, SessionError> {
        let sender = self
            .presence
            .lookup(connection_id)
            .await?
            .ok_or(SessionError::NotJoined)?;

        let message = ChatMessage {
            meeting_id: sender.meeting_id.clone(),
            sender_id: sender.participant.user_id,
            sender_name: sender.participant.display_name,
            content: content.to_string(),
            timestamp: self.next_chat_timestamp(),
        };
        let members = self.members(&sender.meeting_id).await?;
        self.sink
            .deliver(&members, &SessionEvent::ChatMessage(message.clone()));
        Ok(message)
    }

    fn next_chat_timestamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let previous = self.chat_clock.fetch_max(now, Ordering::SeqCst);
        previous.max(now)
    }

    /// Number of participants currently in a meeting.
    ///
    /// # Errors
    ///
    /// Presence backend failures.
    pub async fn participant_count(&self, meeting_id: &str) -> Result<usize, SessionError> {
        Ok(self.presence.participants(meeting_id).await?.len())
    }
}
