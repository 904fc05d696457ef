//! Pre-configured test data: meetings, participants and media parameters.

use conference_service::media::engine::{DtlsFingerprint, RtpCodecParameters};
use conference_service::media::{
    default_media_codecs, DtlsParameters, RtpCapabilities, RtpParameters, TransportOptions,
};
use serde_json::Map;
use std::net::{IpAddr, Ipv4Addr};
use uuid::Uuid;

/// Test meeting fixture.
#[derive(Debug, Clone)]
pub struct TestMeeting {
    pub id: String,
}

impl TestMeeting {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into() }
    }

    /// Meeting with a random id, so parallel tests never share a room.
    #[must_use]
    pub fn random() -> Self {
        Self::new(format!("meeting-{}", Uuid::new_v4()))
    }
}

/// Test participant fixture.
#[derive(Debug, Clone)]
pub struct TestParticipant {
    pub user_id: String,
    pub name: String,
}

impl TestParticipant {
    /// Participant whose display name is the capitalized user id.
    #[must_use]
    pub fn new(user_id: impl Into<String>) -> Self {
        let user_id = user_id.into();
        let mut chars = user_id.chars();
        let name = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect(),
            None => String::new(),
        };
        Self { user_id, name }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn alice() -> Self {
        Self::new("alice")
    }

    #[must_use]
    pub fn bob() -> Self {
        Self::new("bob")
    }

    #[must_use]
    pub fn carol() -> Self {
        Self::new("carol")
    }
}

/// Opus send parameters as a browser would offer them.
#[must_use]
pub fn opus_rtp_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("0".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
        }],
        ..RtpParameters::default()
    }
}

/// VP8 send parameters.
#[must_use]
pub fn vp8_rtp_parameters() -> RtpParameters {
    RtpParameters {
        mid: Some("1".to_string()),
        codecs: vec![RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90000,
            channels: None,
            parameters: Map::new(),
        }],
        ..RtpParameters::default()
    }
}

/// Receiver capabilities that decode everything a router offers.
#[must_use]
pub fn full_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: default_media_codecs(),
        header_extensions: Vec::new(),
    }
}

/// Receiver capabilities without any video codec.
#[must_use]
pub fn audio_only_capabilities() -> RtpCapabilities {
    RtpCapabilities {
        codecs: default_media_codecs()
            .into_iter()
            .filter(|c| c.mime_type.eq_ignore_ascii_case("audio/opus"))
            .collect(),
        header_extensions: Vec::new(),
    }
}

#[must_use]
pub fn client_dtls_parameters() -> DtlsParameters {
    DtlsParameters {
        role: Some("client".to_string()),
        fingerprints: vec![DtlsFingerprint {
            algorithm: "sha-256".to_string(),
            value: "AB:CD:EF:01:23:45:67:89".to_string(),
        }],
    }
}

/// Loopback transport options with a small port range.
#[must_use]
pub fn test_transport_options() -> TransportOptions {
    TransportOptions {
        listen_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        announced_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        rtc_min_port: 40000,
        rtc_max_port: 40099,
        initial_available_outgoing_bitrate: 1_000_000,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_participant_name_is_capitalized_user_id() {
        assert_eq!(TestParticipant::alice().name, "Alice");
        assert_eq!(TestParticipant::new("").name, "");
    }

    #[test]
    fn test_random_meetings_differ() {
        assert_ne!(TestMeeting::random().id, TestMeeting::random().id);
    }

    #[test]
    fn test_audio_only_capabilities_drop_video() {
        let caps = audio_only_capabilities();
        assert_eq!(caps.codecs.len(), 1);
        assert!(caps.codecs.iter().all(|c| c.mime_type == "audio/opus"));
    }
}
