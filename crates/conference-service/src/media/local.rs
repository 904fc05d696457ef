//! In-process media engine.
//!
//! `LocalMediaEngine` implements the engine primitives without a media plane:
//! it allocates ids and ports, produces ICE/DTLS descriptors from the transport
//! options, checks codec compatibility and tracks consumer pause state. It also
//! lets callers simulate a worker crash or an engine-side transport close.

use super::engine::{
    ConsumerDescriptor, DtlsFingerprint, DtlsParameters, EngineError, EngineEvent, IceCandidate,
    IceParameters, MediaEngine, MediaKind, RouterInfo, RtpCapabilities, RtpCodecCapability,
    RtpParameters, TransportOptions, TransportParams,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, warn};
use uuid::Uuid;

/// First dynamic RTP payload type handed out to router codecs.
const FIRST_DYNAMIC_PAYLOAD_TYPE: u8 = 100;

/// ICE candidate priority for host UDP candidates.
const HOST_CANDIDATE_PRIORITY: u32 = 1_076_302_079;

const ENGINE_EVENT_CAPACITY: usize = 64;

struct LocalRouter {
    capabilities: RtpCapabilities,
}

struct LocalTransport {
    router_id: String,
    connected: bool,
}

struct LocalProducer {
    router_id: String,
    transport_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

struct LocalConsumer {
    transport_id: String,
    producer_id: String,
    paused: bool,
}

#[derive(Default)]
struct LocalState {
    routers: HashMap<String, LocalRouter>,
    transports: HashMap<String, LocalTransport>,
    producers: HashMap<String, LocalProducer>,
    consumers: HashMap<String, LocalConsumer>,
    port_cursor: u32,
    consumer_mids: u64,
}

impl LocalState {
    fn remove_producer(&mut self, producer_id: &str) {
        if self.producers.remove(producer_id).is_some() {
            self.consumers.retain(|_, c| c.producer_id != producer_id);
        }
    }

    fn remove_transport(&mut self, transport_id: &str) -> bool {
        if self.transports.remove(transport_id).is_none() {
            return false;
        }
        let producer_ids: Vec<String> = self
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in producer_ids {
            self.remove_producer(&producer_id);
        }
        self.consumers.retain(|_, c| c.transport_id != transport_id);
        true
    }

    fn remove_router(&mut self, router_id: &str) -> bool {
        if self.routers.remove(router_id).is_none() {
            return false;
        }
        let transport_ids: Vec<String> = self
            .transports
            .iter()
            .filter(|(_, t)| t.router_id == router_id)
            .map(|(id, _)| id.clone())
            .collect();
        for transport_id in transport_ids {
            self.remove_transport(&transport_id);
        }
        true
    }

    fn next_port(&mut self, options: &TransportOptions) -> u16 {
        let span = u32::from(options.rtc_max_port.saturating_sub(options.rtc_min_port)) + 1;
        let offset = self.port_cursor % span;
        self.port_cursor = self.port_cursor.wrapping_add(1);
        // offset < span <= u16::MAX + 1, and min + offset <= max
        u16::try_from(u32::from(options.rtc_min_port) + offset).unwrap_or(options.rtc_max_port)
    }
}

/// Engine that runs entirely in the current process.
pub struct LocalMediaEngine {
    state: Mutex<LocalState>,
    events: broadcast::Sender<EngineEvent>,
}

impl Default for LocalMediaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalMediaEngine {
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(ENGINE_EVENT_CAPACITY);
        Self {
            state: Mutex::new(LocalState::default()),
            events,
        }
    }

    fn state(&self) -> MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop every router (with its transports, producers and consumers) as if
    /// the worker hosting them crashed, and report `WorkerDied`.
    ///
    /// Returns the ids of the routers that were lost. New routers can be
    /// created afterwards.
    pub fn simulate_worker_death(&self) -> Vec<String> {
        let router_ids: Vec<String> = {
            let mut state = self.state();
            let ids: Vec<String> = state.routers.keys().cloned().collect();
            for id in &ids {
                state.remove_router(id);
            }
            ids
        };

        warn!(
            target: "cs.engine",
            routers = router_ids.len(),
            "Local media worker died"
        );
        let _ = self.events.send(EngineEvent::WorkerDied {
            router_ids: router_ids.clone(),
        });
        router_ids
    }

    /// Close a transport from the engine side (as on DTLS `closed`) and report
    /// `TransportClosed`. Returns false for unknown ids.
    pub fn close_transport_remotely(&self, transport_id: &str) -> bool {
        let removed = self.state().remove_transport(transport_id);
        if removed {
            let _ = self.events.send(EngineEvent::TransportClosed {
                transport_id: transport_id.to_string(),
            });
        }
        removed
    }

    #[must_use]
    pub fn router_count(&self) -> usize {
        self.state().routers.len()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.state().transports.len()
    }

    #[must_use]
    pub fn has_transport(&self, transport_id: &str) -> bool {
        self.state().transports.contains_key(transport_id)
    }

    #[must_use]
    pub fn is_transport_connected(&self, transport_id: &str) -> bool {
        self.state()
            .transports
            .get(transport_id)
            .is_some_and(|t| t.connected)
    }

    #[must_use]
    pub fn has_producer(&self, producer_id: &str) -> bool {
        self.state().producers.contains_key(producer_id)
    }

    /// Pause state of a live consumer; `None` once it is closed.
    #[must_use]
    pub fn consumer_paused(&self, consumer_id: &str) -> Option<bool> {
        self.state().consumers.get(consumer_id).map(|c| c.paused)
    }
}

fn unknown(kind: &'static str, id: &str) -> EngineError {
    EngineError::UnknownResource {
        kind,
        id: id.to_string(),
    }
}

fn random_token(len: usize) -> String {
    let mut token = Uuid::new_v4().simple().to_string();
    token.push_str(&Uuid::new_v4().simple().to_string());
    token.truncate(len);
    token
}

fn random_fingerprint() -> String {
    let mut bytes = Vec::with_capacity(32);
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes.extend_from_slice(Uuid::new_v4().as_bytes());
    bytes
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

fn mime_kind(mime_type: &str) -> Option<MediaKind> {
    let (prefix, _) = mime_type.split_once('/')?;
    if prefix.eq_ignore_ascii_case("audio") {
        Some(MediaKind::Audio)
    } else if prefix.eq_ignore_ascii_case("video") {
        Some(MediaKind::Video)
    } else {
        None
    }
}

/// Producer codecs the receiver can decode.
fn negotiated_parameters(
    producer: &RtpParameters,
    receiver: &RtpCapabilities,
) -> Vec<super::engine::RtpCodecParameters> {
    producer
        .codecs
        .iter()
        .filter(|codec| {
            receiver
                .codecs
                .iter()
                .any(|cap| cap.matches(&codec.mime_type, codec.clock_rate, codec.channels))
        })
        .cloned()
        .collect()
}

#[async_trait]
impl MediaEngine for LocalMediaEngine {
    async fn create_router(&self, codecs: &[RtpCodecCapability]) -> Result<RouterInfo, EngineError> {
        if codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "router needs at least one codec".to_string(),
            ));
        }

        let mut next_payload_type = FIRST_DYNAMIC_PAYLOAD_TYPE;
        let codecs = codecs
            .iter()
            .map(|codec| {
                let mut codec = codec.clone();
                if codec.preferred_payload_type.is_none() {
                    codec.preferred_payload_type = Some(next_payload_type);
                    next_payload_type = next_payload_type.saturating_add(1);
                }
                codec
            })
            .collect();

        let capabilities = RtpCapabilities {
            codecs,
            header_extensions: Vec::new(),
        };
        let id = Uuid::new_v4().to_string();
        self.state().routers.insert(
            id.clone(),
            LocalRouter {
                capabilities: capabilities.clone(),
            },
        );

        debug!(target: "cs.engine", router_id = %id, "Router created");
        Ok(RouterInfo {
            id,
            rtp_capabilities: capabilities,
        })
    }

    async fn close_router(&self, router_id: &str) {
        if self.state().remove_router(router_id) {
            debug!(target: "cs.engine", router_id = %router_id, "Router closed");
        }
    }

    async fn create_webrtc_transport(
        &self,
        router_id: &str,
        options: &TransportOptions,
    ) -> Result<TransportParams, EngineError> {
        let mut state = self.state();
        if !state.routers.contains_key(router_id) {
            return Err(unknown("router", router_id));
        }

        let id = Uuid::new_v4().to_string();
        let port = state.next_port(options);
        state.transports.insert(
            id.clone(),
            LocalTransport {
                router_id: router_id.to_string(),
                connected: false,
            },
        );

        Ok(TransportParams {
            id,
            ice_parameters: IceParameters {
                username_fragment: random_token(16),
                password: random_token(32),
                ice_lite: true,
            },
            ice_candidates: vec![IceCandidate {
                foundation: "udpcandidate".to_string(),
                priority: HOST_CANDIDATE_PRIORITY,
                ip: options.announced_ip.to_string(),
                protocol: "udp".to_string(),
                port,
                candidate_type: "host".to_string(),
            }],
            dtls_parameters: DtlsParameters {
                role: Some("auto".to_string()),
                fingerprints: vec![DtlsFingerprint {
                    algorithm: "sha-256".to_string(),
                    value: random_fingerprint(),
                }],
            },
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        if dtls_parameters.fingerprints.is_empty() {
            return Err(EngineError::InvalidParameters(
                "dtlsParameters.fingerprints is empty".to_string(),
            ));
        }

        let mut state = self.state();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| unknown("transport", transport_id))?;
        if transport.connected {
            return Err(EngineError::InvalidParameters(
                "transport already connected".to_string(),
            ));
        }
        transport.connected = true;
        Ok(())
    }

    async fn close_transport(&self, transport_id: &str) {
        self.state().remove_transport(transport_id);
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String, EngineError> {
        let mut state = self.state();
        let router_id = state
            .transports
            .get(transport_id)
            .map(|t| t.router_id.clone())
            .ok_or_else(|| unknown("transport", transport_id))?;
        let router = state
            .routers
            .get(&router_id)
            .ok_or_else(|| EngineError::RouterClosed(router_id.clone()))?;

        if rtp_parameters.codecs.is_empty() {
            return Err(EngineError::InvalidParameters(
                "rtpParameters.codecs is empty".to_string(),
            ));
        }
        for codec in &rtp_parameters.codecs {
            if mime_kind(&codec.mime_type) != Some(kind) {
                return Err(EngineError::InvalidParameters(format!(
                    "codec {} does not carry {kind}",
                    codec.mime_type
                )));
            }
            let supported = router
                .capabilities
                .codecs
                .iter()
                .any(|cap| cap.matches(&codec.mime_type, codec.clock_rate, codec.channels));
            if !supported {
                return Err(EngineError::InvalidParameters(format!(
                    "codec {}/{} is not supported by the router",
                    codec.mime_type, codec.clock_rate
                )));
            }
        }

        let id = Uuid::new_v4().to_string();
        state.producers.insert(
            id.clone(),
            LocalProducer {
                router_id,
                transport_id: transport_id.to_string(),
                kind,
                rtp_parameters: rtp_parameters.clone(),
            },
        );
        Ok(id)
    }

    async fn close_producer(&self, producer_id: &str) {
        self.state().remove_producer(producer_id);
    }

    async fn can_consume(
        &self,
        router_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError> {
        let state = self.state();
        if !state.routers.contains_key(router_id) {
            return Err(EngineError::RouterClosed(router_id.to_string()));
        }
        let producer = state
            .producers
            .get(producer_id)
            .filter(|p| p.router_id == router_id)
            .ok_or_else(|| unknown("producer", producer_id))?;

        Ok(!negotiated_parameters(&producer.rtp_parameters, rtp_capabilities).is_empty())
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerDescriptor, EngineError> {
        let mut state = self.state();
        let router_id = state
            .transports
            .get(transport_id)
            .map(|t| t.router_id.clone())
            .ok_or_else(|| unknown("transport", transport_id))?;
        let producer = state
            .producers
            .get(producer_id)
            .filter(|p| p.router_id == router_id)
            .ok_or_else(|| unknown("producer", producer_id))?;

        let codecs = negotiated_parameters(&producer.rtp_parameters, rtp_capabilities);
        if codecs.is_empty() {
            return Err(EngineError::Incompatible(format!(
                "no common codec for producer {producer_id}"
            )));
        }
        let kind = producer.kind;
        let rtp_parameters = RtpParameters {
            mid: Some(state.consumer_mids.to_string()),
            codecs,
            header_extensions: producer.rtp_parameters.header_extensions.clone(),
            encodings: producer.rtp_parameters.encodings.clone(),
            rtcp: producer.rtp_parameters.rtcp.clone(),
        };
        state.consumer_mids += 1;

        let id = Uuid::new_v4().to_string();
        state.consumers.insert(
            id.clone(),
            LocalConsumer {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
                paused: true,
            },
        );

        Ok(ConsumerDescriptor {
            id,
            producer_id: producer_id.to_string(),
            kind,
            rtp_parameters,
            paused: true,
        })
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        let mut state = self.state();
        let consumer = state
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| unknown("consumer", consumer_id))?;
        consumer.paused = false;
        Ok(())
    }

    async fn close_consumer(&self, consumer_id: &str) {
        self.state().consumers.remove(consumer_id);
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::codecs::default_media_codecs;
    use crate::media::engine::RtpCodecParameters;
    use serde_json::Map;
    use std::net::{IpAddr, Ipv4Addr};

    fn options() -> TransportOptions {
        TransportOptions {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_ip: IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9)),
            rtc_min_port: 10000,
            rtc_max_port: 10001,
            initial_available_outgoing_bitrate: 1_000_000,
        }
    }

    fn opus_parameters() -> RtpParameters {
        RtpParameters {
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

    fn dtls() -> DtlsParameters {
        DtlsParameters {
            role: Some("client".to_string()),
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".to_string(),
                value: "AA:BB".to_string(),
            }],
        }
    }

    async fn router(engine: &LocalMediaEngine) -> RouterInfo {
        engine.create_router(&default_media_codecs()).await.unwrap()
    }

    #[tokio::test]
    async fn test_router_assigns_payload_types() {
        let engine = LocalMediaEngine::new();
        let router = router(&engine).await;

        let payload_types: Vec<_> = router
            .rtp_capabilities
            .codecs
            .iter()
            .map(|c| c.preferred_payload_type)
            .collect();
        assert_eq!(payload_types, vec![Some(100), Some(101)]);
    }

    #[tokio::test]
    async fn test_transport_uses_announced_ip_and_port_range() {
        let engine = LocalMediaEngine::new();
        let router = router(&engine).await;

        let mut ports = Vec::new();
        for _ in 0..3 {
            let params = engine
                .create_webrtc_transport(&router.id, &options())
                .await
                .unwrap();
            let candidate = params.ice_candidates.first().unwrap();
            assert_eq!(candidate.ip, "203.0.113.9");
            ports.push(candidate.port);
        }
        assert_eq!(ports, vec![10000, 10001, 10000]);
    }

    #[tokio::test]
    async fn test_connect_twice_is_rejected() {
        let engine = LocalMediaEngine::new();
        let router = router(&engine).await;
        let transport = engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();

        engine.connect_transport(&transport.id, &dtls()).await.unwrap();
        assert!(engine.is_transport_connected(&transport.id));
        let second = engine.connect_transport(&transport.id, &dtls()).await;
        assert!(matches!(second, Err(EngineError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_produce_rejects_unsupported_codec() {
        let engine = LocalMediaEngine::new();
        let router = router(&engine).await;
        let transport = engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();

        let mut params = opus_parameters();
        params.codecs.first_mut().unwrap().mime_type = "audio/G722".to_string();
        let result = engine.produce(&transport.id, MediaKind::Audio, &params).await;
        assert!(matches!(result, Err(EngineError::InvalidParameters(_))));

        let wrong_kind = engine
            .produce(&transport.id, MediaKind::Video, &opus_parameters())
            .await;
        assert!(matches!(wrong_kind, Err(EngineError::InvalidParameters(_))));
    }

    #[tokio::test]
    async fn test_consume_starts_paused_and_resumes() {
        let engine = LocalMediaEngine::new();
        let router = router(&engine).await;
        let send = engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();
        let recv = engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();
        let producer_id = engine
            .produce(&send.id, MediaKind::Audio, &opus_parameters())
            .await
            .unwrap();

        assert!(engine
            .can_consume(&router.id, &producer_id, &router.rtp_capabilities)
            .await
            .unwrap());
        let consumer = engine
            .consume(&recv.id, &producer_id, &router.rtp_capabilities)
            .await
            .unwrap();
        assert!(consumer.paused);
        assert_eq!(consumer.kind, MediaKind::Audio);
        assert_eq!(engine.consumer_paused(&consumer.id), Some(true));

        engine.resume_consumer(&consumer.id).await.unwrap();
        assert_eq!(engine.consumer_paused(&consumer.id), Some(false));
    }

    #[tokio::test]
    async fn test_can_consume_false_without_common_codec() {
        let engine = LocalMediaEngine::new();
        let router = router(&engine).await;
        let send = engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();
        let producer_id = engine
            .produce(&send.id, MediaKind::Audio, &opus_parameters())
            .await
            .unwrap();

        let video_only = RtpCapabilities {
            codecs: router
                .rtp_capabilities
                .codecs
                .iter()
                .filter(|c| c.kind == MediaKind::Video)
                .cloned()
                .collect(),
            header_extensions: Vec::new(),
        };
        assert!(!engine
            .can_consume(&router.id, &producer_id, &video_only)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_closing_transport_cascades() {
        let engine = LocalMediaEngine::new();
        let router = router(&engine).await;
        let send = engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();
        let recv = engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();
        let producer_id = engine
            .produce(&send.id, MediaKind::Audio, &opus_parameters())
            .await
            .unwrap();
        let consumer = engine
            .consume(&recv.id, &producer_id, &router.rtp_capabilities)
            .await
            .unwrap();

        engine.close_transport(&send.id).await;

        assert!(!engine.has_producer(&producer_id));
        assert_eq!(engine.consumer_paused(&consumer.id), None);
        assert!(engine.has_transport(&recv.id));
    }

    #[tokio::test]
    async fn test_worker_death_drops_routers_and_notifies() {
        let engine = LocalMediaEngine::new();
        let mut events = engine.subscribe();
        let router = router(&engine).await;
        engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();

        let lost = engine.simulate_worker_death();

        assert_eq!(lost, vec![router.id.clone()]);
        assert_eq!(engine.router_count(), 0);
        assert_eq!(engine.transport_count(), 0);
        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::WorkerDied {
                router_ids: vec![router.id]
            }
        );
    }

    #[tokio::test]
    async fn test_remote_transport_close_notifies_once() {
        let engine = LocalMediaEngine::new();
        let mut events = engine.subscribe();
        let router = router(&engine).await;
        let transport = engine
            .create_webrtc_transport(&router.id, &options())
            .await
            .unwrap();

        assert!(engine.close_transport_remotely(&transport.id));
        assert!(!engine.close_transport_remotely(&transport.id));

        assert_eq!(
            events.recv().await.unwrap(),
            EngineEvent::TransportClosed {
                transport_id: transport.id
            }
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unknown_ids_report_unknown_resource() {
        let engine = LocalMediaEngine::new();
        assert!(matches!(
            engine.connect_transport("nope", &dtls()).await,
            Err(EngineError::UnknownResource { kind: "transport", .. })
        ));
        assert!(matches!(
            engine.resume_consumer("nope").await,
            Err(EngineError::UnknownResource { kind: "consumer", .. })
        ));
        // Closing unknown ids is a no-op
        engine.close_consumer("nope").await;
        engine.close_producer("nope").await;
        engine.close_transport("nope").await;
        engine.close_router("nope").await;
    }
}
