//! Join authorization and participant mutation policy.

use crate::errors::SessionError;
use crate::presence::PresenceRecord;
use async_trait::async_trait;

/// Decides whether a user may join a meeting.
#[async_trait]
pub trait MeetingAuthorizer: Send + Sync {
    /// # Errors
    ///
    /// `Unauthorized` when the join must be refused.
    async fn authorize(&self, meeting_id: &str, user_id: &str) -> Result<(), SessionError>;
}

/// Accepts every join. Meeting admission is enforced upstream.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllAuthorizer;

#[async_trait]
impl MeetingAuthorizer for AllowAllAuthorizer {
    async fn authorize(&self, _meeting_id: &str, _user_id: &str) -> Result<(), SessionError> {
        Ok(())
    }
}

/// Decides whether `actor` may toggle mute or video state of `target`.
pub trait MutationPolicy: Send + Sync {
    fn may_mutate(&self, actor: &PresenceRecord, target: &PresenceRecord) -> bool;
}

/// Participants may only change their own state.
#[derive(Debug, Default, Clone, Copy)]
pub struct SelfOnlyPolicy;

impl MutationPolicy for SelfOnlyPolicy {
    fn may_mutate(&self, actor: &PresenceRecord, target: &PresenceRecord) -> bool {
        actor.participant.connection_id == target.participant.connection_id
    }
}
