//! Process-wide router codec set.

use super::engine::{MediaKind, RtpCodecCapability};
use serde_json::{Map, Value};

/// Start bitrate hint (kbps) advertised for VP8.
pub const VP8_START_BITRATE_KBPS: u32 = 1000;

/// Codecs every router is created with: Opus 48 kHz stereo and VP8 90 kHz.
#[must_use]
pub fn default_media_codecs() -> Vec<RtpCodecCapability> {
    let mut vp8_parameters = Map::new();
    vp8_parameters.insert(
        "x-google-start-bitrate".to_string(),
        Value::from(VP8_START_BITRATE_KBPS),
    );

    vec![
        RtpCodecCapability {
            kind: MediaKind::Audio,
            mime_type: "audio/opus".to_string(),
            preferred_payload_type: None,
            clock_rate: 48000,
            channels: Some(2),
            parameters: Map::new(),
        },
        RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/VP8".to_string(),
            preferred_payload_type: None,
            clock_rate: 90000,
            channels: None,
            parameters: vp8_parameters,
        },
    ]
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_codecs_are_opus_and_vp8() {
        let codecs = default_media_codecs();
        assert_eq!(codecs.len(), 2);

        let opus = codecs.iter().find(|c| c.kind == MediaKind::Audio).unwrap();
        assert_eq!(opus.mime_type, "audio/opus");
        assert_eq!(opus.clock_rate, 48000);
        assert_eq!(opus.channels, Some(2));

        let vp8 = codecs.iter().find(|c| c.kind == MediaKind::Video).unwrap();
        assert_eq!(vp8.mime_type, "video/VP8");
        assert_eq!(vp8.clock_rate, 90000);
        assert_eq!(
            vp8.parameters.get("x-google-start-bitrate"),
            Some(&Value::from(1000))
        );
    }
}
