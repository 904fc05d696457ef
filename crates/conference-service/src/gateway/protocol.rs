//! Signaling wire format.
//!
//! Client frames are JSON text: `{"id": 7, "type": "produce", "data": {...}}`.
//! `id` is optional; requests without one get no response frame. Server
//! frames are responses, events and the closing notice, all tagged by `type`.

use crate::errors::SessionError;
use crate::events::SessionEvent;
use crate::media::{DtlsParameters, MediaKind, RtpCapabilities, RtpParameters, TransportDirection};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Payload of requests that carry no data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct NoPayload {}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRoom {
    pub meeting_id: String,
    pub user_id: String,
    #[serde(default, alias = "displayName")]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransport {
    /// Defaults to the joined meeting.
    #[serde(default)]
    pub meeting_id: Option<String>,
    pub direction: TransportDirection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransport {
    pub transport_id: String,
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Produce {
    pub transport_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    #[serde(default)]
    pub app_data: Value,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consume {
    pub transport_id: String,
    pub producer_id: String,
    pub rtp_capabilities: RtpCapabilities,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerRef {
    pub consumer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerRef {
    pub producer_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportRef {
    pub transport_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ChatPayload {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToggleMute {
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ToggleVideo {
    #[serde(alias = "videoOff")]
    pub off: bool,
}

/// Every request a client may send.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ClientRequest {
    JoinRoom(JoinRoom),
    GetRouterCapabilities(NoPayload),
    CreateTransport(CreateTransport),
    ConnectTransport(ConnectTransport),
    Produce(Produce),
    Consume(Consume),
    ResumeConsumer(ConsumerRef),
    CloseProducer(ProducerRef),
    CloseConsumer(ConsumerRef),
    CloseTransport(TransportRef),
    ChatMessage(ChatPayload),
    ToggleMute(ToggleMute),
    ToggleVideo(ToggleVideo),
    LeaveRoom(NoPayload),
}

impl ClientRequest {
    /// Wire name, also used as a bounded metric label.
    #[must_use]
    pub fn request_type(&self) -> &'static str {
        match self {
            ClientRequest::JoinRoom(_) => "join-room",
            ClientRequest::GetRouterCapabilities(_) => "get-router-capabilities",
            ClientRequest::CreateTransport(_) => "create-transport",
            ClientRequest::ConnectTransport(_) => "connect-transport",
            ClientRequest::Produce(_) => "produce",
            ClientRequest::Consume(_) => "consume",
            ClientRequest::ResumeConsumer(_) => "resume-consumer",
            ClientRequest::CloseProducer(_) => "close-producer",
            ClientRequest::CloseConsumer(_) => "close-consumer",
            ClientRequest::CloseTransport(_) => "close-transport",
            ClientRequest::ChatMessage(_) => "chat-message",
            ClientRequest::ToggleMute(_) => "toggle-mute",
            ClientRequest::ToggleVideo(_) => "toggle-video",
            ClientRequest::LeaveRoom(_) => "leave-room",
        }
    }
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestFrame {
    pub id: Option<u64>,
    pub request: ClientRequest,
}

/// A frame that could not be decoded. Carries the request id when it was
/// readable so the rejection can still be correlated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameError {
    pub id: Option<u64>,
    pub message: String,
}

/// Decode one client text frame.
///
/// # Errors
///
/// Returns `FrameError` for invalid JSON, a non-object frame, an `id` that
/// is not a non-negative integer, an unknown `type` or a payload that does
/// not match it.
pub fn parse_request(text: &str) -> Result<RequestFrame, FrameError> {
    let mut value: Value = serde_json::from_str(text).map_err(|e| FrameError {
        id: None,
        message: format!("invalid JSON: {e}"),
    })?;
    let Some(object) = value.as_object_mut() else {
        return Err(FrameError {
            id: None,
            message: "frame must be a JSON object".to_string(),
        });
    };

    let id = match object.remove("id") {
        None | Some(Value::Null) => None,
        Some(id) => Some(id.as_u64().ok_or_else(|| FrameError {
            id: None,
            message: format!("id must be a non-negative integer, got {id}"),
        })?),
    };
    if matches!(object.get("data"), None | Some(Value::Null)) {
        object.insert("data".to_string(), Value::Object(Map::new()));
    }

    let request = serde_json::from_value(value).map_err(|e| FrameError {
        id,
        message: format!("invalid request: {e}"),
    })?;
    Ok(RequestFrame { id, request })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

/// Outcome of one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseFrame {
    pub id: Option<u64>,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

/// Every frame the server sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    Response(ResponseFrame),
    Event(SessionEvent),
    Closing { reason: String },
}

impl ServerMessage {
    #[must_use]
    pub fn success(id: Option<u64>, data: Value) -> Self {
        ServerMessage::Response(ResponseFrame {
            id,
            ok: true,
            data: Some(data),
            error: None,
        })
    }

    /// Rejected response carrying the error's wire code and client-safe
    /// message.
    #[must_use]
    pub fn failure(id: Option<u64>, error: &SessionError) -> Self {
        ServerMessage::Response(ResponseFrame {
            id,
            ok: false,
            data: None,
            error: Some(ErrorBody {
                code: error.error_code(),
                message: error.client_message(),
            }),
        })
    }

    #[must_use]
    pub fn superseded() -> Self {
        ServerMessage::Closing {
            reason: "superseded".to_string(),
        }
    }
}
