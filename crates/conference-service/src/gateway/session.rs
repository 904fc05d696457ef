//! Per-connection signaling state machine.
//!
//! ```text
//! Connected --join-room--> Joined --leave-room--> Connected
//!     |                      |
//!     +--------disconnect----+--> Disconnected | Superseded
//! ```
//!
//! Requests other than `join-room` are rejected with `NOT_JOINED` until the
//! connection has joined a room.

use super::protocol::{parse_request, ClientRequest, ServerMessage};
use crate::errors::SessionError;
use crate::observability::metrics;
use crate::room::RoomService;
use common::types::ConnectionId;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Connected,
    Joined {
        meeting_id: String,
        user_id: String,
        display_name: String,
    },
    Disconnected,
    /// Replaced by a newer connection of the same user.
    Superseded,
}

fn to_data<T: Serialize>(value: &T) -> Result<Value, SessionError> {
    serde_json::to_value(value)
        .map_err(|e| SessionError::Internal(format!("Failed to encode response: {e}")))
}

/// A toggle the mutation policy refused is reported, not acknowledged.
fn refused_unless(applied: bool) -> Result<(), SessionError> {
    if applied {
        Ok(())
    } else {
        Err(SessionError::Unauthorized(
            "participant change refused".to_string(),
        ))
    }
}

/// Signaling session of one connection.
pub struct SignalingSession {
    connection_id: ConnectionId,
    state: SessionState,
    room: Arc<RoomService>,
}

impl SignalingSession {
    #[must_use]
    pub fn new(connection_id: ConnectionId, room: Arc<RoomService>) -> Self {
        Self {
            connection_id,
            state: SessionState::Connected,
            room,
        }
    }

    #[must_use]
    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    #[must_use]
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Handle one text frame. Returns the response to send, if any.
    pub async fn handle_frame(&mut self, text: &str) -> Option<ServerMessage> {
        let frame = match parse_request(text) {
            Ok(frame) => frame,
            Err(e) => {
                metrics::record_request_error("malformed", "BAD_REQUEST");
                debug!(
                    target: "cs.gateway",
                    connection_id = %self.connection_id,
                    error = %e.message,
                    "Malformed signaling frame"
                );
                return Some(ServerMessage::failure(
                    e.id,
                    &SessionError::BadRequest(e.message),
                ));
            }
        };

        let request_type = frame.request.request_type();
        let start = Instant::now();
        let result = self.handle_request(frame.request).await;
        metrics::record_request(request_type, start.elapsed());

        let response = match result {
            Ok(data) => ServerMessage::success(frame.id, data),
            Err(e) => {
                metrics::record_request_error(request_type, e.error_code());
                debug!(
                    target: "cs.gateway",
                    connection_id = %self.connection_id,
                    request_type = request_type,
                    code = e.error_code(),
                    error = %e,
                    "Request rejected"
                );
                ServerMessage::failure(frame.id, &e)
            }
        };
        frame.id.map(|_| response)
    }

    /// Dispatch a decoded request and produce its response data.
    ///
    /// # Errors
    ///
    /// `NotJoined` for room and media requests before `join-room`, otherwise
    /// whatever the room or media layer reports.
    pub async fn handle_request(&mut self, request: ClientRequest) -> Result<Value, SessionError> {
        if let ClientRequest::JoinRoom(join) = request {
            return self.join(&join.meeting_id, &join.user_id, &join.name).await;
        }

        let SessionState::Joined { meeting_id, .. } = self.state.clone() else {
            return Err(SessionError::NotJoined);
        };
        let connection_id = self.connection_id;
        let media = Arc::clone(self.room.media());

        match request {
            ClientRequest::JoinRoom(_) => Err(SessionError::AlreadyJoined(meeting_id)),
            ClientRequest::GetRouterCapabilities(_) => {
                let capabilities = media.router_capabilities(connection_id).await?;
                Ok(json!({ "rtpCapabilities": to_data(&capabilities)? }))
            }
            ClientRequest::CreateTransport(create) => {
                let target = create.meeting_id.unwrap_or(meeting_id);
                let params = media
                    .create_transport(connection_id, &target, create.direction)
                    .await?;
                to_data(&params)
            }
            ClientRequest::ConnectTransport(connect) => {
                media
                    .connect_transport(connection_id, &connect.transport_id, &connect.dtls_parameters)
                    .await?;
                Ok(json!({ "connected": true }))
            }
            ClientRequest::Produce(produce) => {
                let producer_id = media
                    .produce(
                        connection_id,
                        &produce.transport_id,
                        produce.kind,
                        &produce.rtp_parameters,
                        produce.app_data,
                    )
                    .await?;
                Ok(json!({ "id": producer_id }))
            }
            ClientRequest::Consume(consume) => {
                let descriptor = media
                    .consume(
                        connection_id,
                        &consume.transport_id,
                        &consume.producer_id,
                        &consume.rtp_capabilities,
                    )
                    .await?;
                to_data(&descriptor)
            }
            ClientRequest::ResumeConsumer(resume) => {
                media
                    .resume_consumer(connection_id, &resume.consumer_id)
                    .await;
                Ok(json!({}))
            }
            ClientRequest::CloseProducer(close) => {
                media
                    .close_producer(connection_id, &close.producer_id)
                    .await?;
                Ok(json!({}))
            }
            ClientRequest::CloseConsumer(close) => {
                media
                    .close_consumer(connection_id, &close.consumer_id)
                    .await?;
                Ok(json!({}))
            }
            ClientRequest::CloseTransport(close) => {
                media
                    .close_transport(connection_id, &close.transport_id)
                    .await?;
                Ok(json!({}))
            }
            ClientRequest::ChatMessage(chat) => {
                let message = self.room.relay_chat(connection_id, &chat.content).await?;
                Ok(json!({ "timestamp": message.timestamp }))
            }
            ClientRequest::ToggleMute(toggle) => {
                let applied = self
                    .room
                    .set_muted(connection_id, connection_id, toggle.muted)
                    .await?;
                refused_unless(applied)?;
                Ok(json!({ "isMuted": toggle.muted }))
            }
            ClientRequest::ToggleVideo(toggle) => {
                let applied = self
                    .room
                    .set_video_off(connection_id, connection_id, toggle.off)
                    .await?;
                refused_unless(applied)?;
                Ok(json!({ "isVideoOff": toggle.off }))
            }
            ClientRequest::LeaveRoom(_) => {
                let departure = self.room.leave(connection_id).await?;
                self.state = SessionState::Connected;
                Ok(json!({ "left": departure.is_some() }))
            }
        }
    }

    async fn join(
        &mut self,
        meeting_id: &str,
        user_id: &str,
        name: &str,
    ) -> Result<Value, SessionError> {
        if let SessionState::Joined { meeting_id, .. } = &self.state {
            return Err(SessionError::AlreadyJoined(meeting_id.clone()));
        }
        let display_name = if name.is_empty() { user_id } else { name };
        let snapshot = self
            .room
            .join(self.connection_id, meeting_id, user_id, display_name)
            .await?;
        self.state = SessionState::Joined {
            meeting_id: meeting_id.to_string(),
            user_id: user_id.to_string(),
            display_name: display_name.to_string(),
        };
        to_data(&snapshot)
    }

    /// Run the graceful-disconnect cleanup. A joined connection that finds
    /// itself already removed from its room was superseded.
    pub async fn disconnect(&mut self) {
        let was_joined = matches!(self.state, SessionState::Joined { .. });
        self.state = match self.room.leave(self.connection_id).await {
            Ok(Some(_)) => SessionState::Disconnected,
            Ok(None) if was_joined => SessionState::Superseded,
            Ok(None) => SessionState::Disconnected,
            Err(e) => {
                warn!(
                    target: "cs.gateway",
                    connection_id = %self.connection_id,
                    error = %e,
                    "Disconnect cleanup failed"
                );
                SessionState::Disconnected
            }
        };
    }
}
