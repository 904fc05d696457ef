//! Conference service error types.
//!
//! Every request failure maps to a stable wire code sent back in the rejected
//! response. Internal details are logged server-side but not exposed to clients.

use thiserror::Error;

/// Request-level error type.
///
/// Maps to wire error codes:
/// - `NotJoined`: `NOT_JOINED`
/// - `AlreadyJoined`: `ALREADY_JOINED`
/// - `Unauthorized`: `UNAUTHORIZED`
/// - `NotFound`: `NOT_FOUND`
/// - `CannotConsume`: `CANNOT_CONSUME`
/// - `RouterCreationFailed`: `ROUTER_CREATION_FAILED`
/// - `MediaUnavailable`: `MEDIA_UNAVAILABLE`
/// - `BadRequest`: `BAD_REQUEST`
/// - Presence, Engine, Internal: `INTERNAL_ERROR`
#[derive(Debug, Error)]
pub enum SessionError {
    /// Request requires a joined room.
    #[error("Connection has not joined a room")]
    NotJoined,

    /// Connection already belongs to a room.
    #[error("Connection already joined meeting {0}")]
    AlreadyJoined(String),

    /// Meeting authorizer refused the join, or the mutation policy refused a
    /// participant change.
    #[error("Not authorized: {0}")]
    Unauthorized(String),

    /// Stale or foreign resource id.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Receiver capabilities cannot decode the producer's codecs.
    #[error("Cannot consume producer {producer_id}")]
    CannotConsume { producer_id: String },

    /// The engine could not create the meeting's router.
    #[error("Router creation failed for meeting {meeting_id}: {reason}")]
    RouterCreationFailed { meeting_id: String, reason: String },

    /// The meeting's router died with its engine worker.
    #[error("Media unavailable for meeting {0}")]
    MediaUnavailable(String),

    /// Malformed or invalid request payload.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Presence backend failure.
    #[error("Presence error: {0}")]
    Presence(String),

    /// Media engine failure not covered by a more specific variant.
    #[error("Media engine error: {0}")]
    Engine(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl SessionError {
    /// Shorthand for a stale transport id.
    #[must_use]
    pub fn transport_not_found(id: &str) -> Self {
        SessionError::NotFound {
            kind: "transport",
            id: id.to_string(),
        }
    }

    /// Shorthand for a stale producer id.
    #[must_use]
    pub fn producer_not_found(id: &str) -> Self {
        SessionError::NotFound {
            kind: "producer",
            id: id.to_string(),
        }
    }

    /// Shorthand for a stale consumer id.
    #[must_use]
    pub fn consumer_not_found(id: &str) -> Self {
        SessionError::NotFound {
            kind: "consumer",
            id: id.to_string(),
        }
    }

    /// Returns the wire error code for this error.
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            SessionError::NotJoined => "NOT_JOINED",
            SessionError::AlreadyJoined(_) => "ALREADY_JOINED",
            SessionError::Unauthorized(_) => "UNAUTHORIZED",
            SessionError::NotFound { .. } => "NOT_FOUND",
            SessionError::CannotConsume { .. } => "CANNOT_CONSUME",
            SessionError::RouterCreationFailed { .. } => "ROUTER_CREATION_FAILED",
            SessionError::MediaUnavailable(_) => "MEDIA_UNAVAILABLE",
            SessionError::BadRequest(_) => "BAD_REQUEST",
            SessionError::Presence(_) | SessionError::Engine(_) | SessionError::Internal(_) => {
                "INTERNAL_ERROR"
            }
        }
    }

    /// Returns a client-safe error message (no internal details).
    #[must_use]
    pub fn client_message(&self) -> String {
        match self {
            SessionError::Presence(_) | SessionError::Engine(_) | SessionError::Internal(_) => {
                "An internal error occurred".to_string()
            }
            SessionError::NotJoined => "Join a room first".to_string(),
            SessionError::AlreadyJoined(_) => "Connection already joined a room".to_string(),
            SessionError::Unauthorized(_) => "Not authorized".to_string(),
            SessionError::NotFound { kind, .. } => format!("{kind} not found"),
            SessionError::CannotConsume { .. } => {
                "Receiver capabilities cannot consume this producer".to_string()
            }
            SessionError::RouterCreationFailed { .. } => {
                "Media routing is unavailable for this meeting".to_string()
            }
            SessionError::MediaUnavailable(_) => {
                "Media is no longer available in this meeting".to_string()
            }
            SessionError::BadRequest(msg) => msg.clone(),
        }
    }
}
