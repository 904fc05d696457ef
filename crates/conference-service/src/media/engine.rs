//! Media engine boundary.
//!
//! The engine owns routers, transports, producers and consumers on the media
//! plane. The session core only calls these primitives and keeps its own
//! ownership index on top; ICE/DTLS/SRTP and RTP forwarding stay behind this
//! trait.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;
use tokio::sync::broadcast;

/// Track kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a WebRTC transport, seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

/// One codec a router (or a receiving client) supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

impl RtpCodecCapability {
    /// Whether `mime_type` and `clock_rate` (and channel count when both
    /// sides state one) describe the same codec.
    #[must_use]
    pub fn matches(&self, mime_type: &str, clock_rate: u32, channels: Option<u8>) -> bool {
        if !self.mime_type.eq_ignore_ascii_case(mime_type) || self.clock_rate != clock_rate {
            return false;
        }
        match (self.channels, channels) {
            (Some(ours), Some(theirs)) => ours == theirs,
            _ => true,
        }
    }
}

/// Capability set exchanged with clients before negotiating transports.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

/// Codec negotiated on a single RTP stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub parameters: Map<String, Value>,
}

/// RTP parameters of a producer or consumer. Fields the core does not inspect
/// are carried as opaque JSON.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mid: Option<String>,
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
    #[serde(default)]
    pub encodings: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default)]
    pub ice_lite: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    pub ip: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// What a client needs to set up its side of a transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: Vec<IceCandidate>,
    pub dtls_parameters: DtlsParameters,
}

/// Listen/announce settings applied to every WebRTC transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportOptions {
    pub listen_ip: IpAddr,
    pub announced_ip: IpAddr,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub initial_available_outgoing_bitrate: u32,
}

/// A consumer as returned to the receiving client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDescriptor {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub paused: bool,
}

/// A router created by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct RouterInfo {
    pub id: String,
    pub rtp_capabilities: RtpCapabilities,
}

/// Asynchronous notifications from the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A worker process died; every listed router is gone with it.
    WorkerDied { router_ids: Vec<String> },
    /// The engine closed a transport on its own (e.g. DTLS reached `closed`).
    TransportClosed { transport_id: String },
}

/// Media engine error type.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("unknown {kind}: {id}")]
    UnknownResource { kind: &'static str, id: String },

    #[error("router {0} is closed")]
    RouterClosed(String),

    #[error("no worker available: {0}")]
    WorkerUnavailable(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("incompatible capabilities: {0}")]
    Incompatible(String),

    #[error("engine failure: {0}")]
    Failure(String),
}

/// Primitives the session core needs from a media engine.
///
/// Close operations are infallible and idempotent: closing an unknown id is a
/// no-op. Consumers are always created paused.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    async fn create_router(&self, codecs: &[RtpCodecCapability]) -> Result<RouterInfo, EngineError>;

    async fn close_router(&self, router_id: &str);

    async fn create_webrtc_transport(
        &self,
        router_id: &str,
        options: &TransportOptions,
    ) -> Result<TransportParams, EngineError>;

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError>;

    async fn close_transport(&self, transport_id: &str);

    /// Returns the new producer's id.
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String, EngineError>;

    async fn close_producer(&self, producer_id: &str);

    /// Whether a receiver with `rtp_capabilities` can decode the producer.
    async fn can_consume(
        &self,
        router_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError>;

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerDescriptor, EngineError>;

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError>;

    async fn close_consumer(&self, consumer_id: &str);

    /// Subscribe to worker and transport notifications.
    fn subscribe(&self) -> broadcast::Receiver<EngineEvent>;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn opus() -> RtpCodecCapability {
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
        }
    }

    #[test]
    fn test_codec_match_ignores_mime_case() {
        assert!(opus().matches("audio/OPUS", 48000, Some(2)));
        assert!(opus().matches("audio/opus", 48000, None));
    }

    #[test]
    fn test_codec_match_rejects_clock_rate_or_channel_mismatch() {
        assert!(!opus().matches("audio/opus", 16000, Some(2)));
        assert!(!opus().matches("audio/opus", 48000, Some(1)));
        assert!(!opus().matches("video/VP8", 48000, None));
    }

    #[test]
    fn test_capabilities_deserialize_from_client_shape() {
        let caps: RtpCapabilities = serde_json::from_value(json!({
            "codecs": [
                {"kind": "video", "mimeType": "video/VP8", "clockRate": 90000,
                 "parameters": {"x-google-start-bitrate": 1000}, "rtcpFeedback": []}
            ]
        }))
        .unwrap();

        assert_eq!(caps.codecs.len(), 1);
        assert_eq!(caps.codecs.first().unwrap().kind, MediaKind::Video);
        assert!(caps.header_extensions.is_empty());
    }

    #[test]
    fn test_ice_candidate_uses_type_field() {
        let candidate = IceCandidate {
            foundation: "udpcandidate".to_string(),
            priority: 1,
            ip: "127.0.0.1".to_string(),
            protocol: "udp".to_string(),
            port: 10000,
            candidate_type: "host".to_string(),
        };
        let value = serde_json::to_value(&candidate).unwrap();
        assert_eq!(value["type"], "host");
    }

    #[test]
    fn test_consumer_descriptor_is_camel_case() {
        let descriptor = ConsumerDescriptor {
            id: "c-1".to_string(),
            producer_id: "p-1".to_string(),
            kind: MediaKind::Audio,
            rtp_parameters: RtpParameters::default(),
            paused: true,
        };
        let value = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(value["producerId"], "p-1");
        assert_eq!(value["kind"], "audio");
        assert_eq!(value["paused"], true);
        assert!(value.get("rtpParameters").is_some());
    }
}
