//! Media session manager: transports, producers and consumers per connection.
//!
//! The manager keeps an ownership index over engine resources so that every
//! id a client sends is checked against the connection that created it. All
//! media operations of one connection run under that connection's async lock,
//! and [`MediaSessionManager::close_for_connection`] takes the same lock: an
//! engine call in flight when the connection drops completes first, and the
//! resource it created is torn down by the cleanup that follows.
//!
//! Effects that cross connections (closing a producer that others consume)
//! touch only the shared index, never another connection's lock.

use super::engine::{
    ConsumerDescriptor, DtlsParameters, EngineError, EngineEvent, MediaEngine, MediaKind,
    RtpCapabilities, RtpParameters, TransportDirection, TransportOptions, TransportParams,
};
use super::router::{RouterContext, RouterRegistry};
use crate::errors::SessionError;
use crate::events::{ConsumerClosed, EventSink, MediaUnavailable, NewProducer, SessionEvent};
use crate::observability::metrics;
use crate::presence::PresenceStore;
use common::types::ConnectionId;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Media state of one joined connection.
struct ConnectionMedia {
    meeting_id: String,
    user_id: String,
    /// Router lease, taken on the first capability or transport request.
    router: Option<Arc<RouterContext>>,
    transports: HashMap<TransportDirection, String>,
    closed: bool,
}

impl ConnectionMedia {
    fn ensure_open(&self) -> Result<(), SessionError> {
        if self.closed {
            return Err(SessionError::NotJoined);
        }
        if self.router.as_ref().is_some_and(|r| r.is_closed()) {
            return Err(SessionError::MediaUnavailable(self.meeting_id.clone()));
        }
        Ok(())
    }
}

struct TransportRecord {
    owner: ConnectionId,
    meeting_id: String,
    direction: TransportDirection,
    producers: HashSet<String>,
    consumers: HashSet<String>,
}

struct ProducerRecord {
    owner: ConnectionId,
    transport_id: String,
    meeting_id: String,
    consumers: HashSet<String>,
}

struct ConsumerRecord {
    owner: ConnectionId,
    transport_id: String,
    producer_id: String,
}

#[derive(Default)]
struct ResourceIndex {
    transports: HashMap<String, TransportRecord>,
    producers: HashMap<String, ProducerRecord>,
    consumers: HashMap<String, ConsumerRecord>,
}

/// Resources removed from the index whose engine objects still need closing.
#[derive(Default)]
struct Detached {
    consumers: Vec<(String, ConsumerRecord)>,
    producers: Vec<String>,
    transports: Vec<String>,
}

impl ResourceIndex {
    fn owned_transport(&self, transport_id: &str, owner: ConnectionId) -> Option<&TransportRecord> {
        self.transports
            .get(transport_id)
            .filter(|record| record.owner == owner)
    }

    fn detach_consumer(&mut self, consumer_id: &str) -> Option<ConsumerRecord> {
        let record = self.consumers.remove(consumer_id)?;
        if let Some(transport) = self.transports.get_mut(&record.transport_id) {
            transport.consumers.remove(consumer_id);
        }
        if let Some(producer) = self.producers.get_mut(&record.producer_id) {
            producer.consumers.remove(consumer_id);
        }
        Some(record)
    }

    fn detach_producer(&mut self, producer_id: &str, detached: &mut Detached) {
        let Some(record) = self.producers.remove(producer_id) else {
            return;
        };
        if let Some(transport) = self.transports.get_mut(&record.transport_id) {
            transport.producers.remove(producer_id);
        }
        for consumer_id in record.consumers {
            if let Some(consumer) = self.detach_consumer(&consumer_id) {
                detached.consumers.push((consumer_id, consumer));
            }
        }
        detached.producers.push(producer_id.to_string());
    }

    fn detach_transport(&mut self, transport_id: &str, detached: &mut Detached) {
        let Some(record) = self.transports.remove(transport_id) else {
            return;
        };
        for producer_id in &record.producers {
            self.detach_producer(producer_id, detached);
        }
        for consumer_id in record.consumers {
            if let Some(consumer) = self.detach_consumer(&consumer_id) {
                detached.consumers.push((consumer_id, consumer));
            }
        }
        detached.transports.push(transport_id.to_string());
    }

    /// Link a new consumer to its producer and transport. Fails if either was
    /// closed while the engine call was running.
    fn register_consumer(&mut self, consumer_id: &str, record: ConsumerRecord) -> bool {
        let Some(producer) = self.producers.get_mut(&record.producer_id) else {
            return false;
        };
        let Some(transport) = self.transports.get_mut(&record.transport_id) else {
            return false;
        };
        producer.consumers.insert(consumer_id.to_string());
        transport.consumers.insert(consumer_id.to_string());
        self.consumers.insert(consumer_id.to_string(), record);
        true
    }
}

fn engine_failure(operation: &'static str, meeting_id: &str, error: EngineError) -> SessionError {
    metrics::record_engine_operation(operation, "error");
    warn!(
        target: "cs.media.session",
        operation = operation,
        meeting_id = %meeting_id,
        error = %error,
        "Engine operation failed"
    );
    match error {
        EngineError::UnknownResource { kind, id } => SessionError::NotFound { kind, id },
        EngineError::RouterClosed(_) | EngineError::WorkerUnavailable(_) => {
            SessionError::MediaUnavailable(meeting_id.to_string())
        }
        EngineError::InvalidParameters(msg) => SessionError::BadRequest(msg),
        EngineError::Incompatible(msg) | EngineError::Failure(msg) => SessionError::Engine(msg),
    }
}

/// Owns the media lifecycle of every joined connection.
pub struct MediaSessionManager {
    engine: Arc<dyn MediaEngine>,
    routers: Arc<RouterRegistry>,
    presence: Arc<dyn PresenceStore>,
    sink: Arc<dyn EventSink>,
    transport_options: TransportOptions,
    connections: Mutex<HashMap<ConnectionId, Arc<AsyncMutex<ConnectionMedia>>>>,
    index: Mutex<ResourceIndex>,
}

impl MediaSessionManager {
    pub fn new(
        engine: Arc<dyn MediaEngine>,
        routers: Arc<RouterRegistry>,
        presence: Arc<dyn PresenceStore>,
        sink: Arc<dyn EventSink>,
        transport_options: TransportOptions,
    ) -> Self {
        Self {
            engine,
            routers,
            presence,
            sink,
            transport_options,
            connections: Mutex::new(HashMap::new()),
            index: Mutex::new(ResourceIndex::default()),
        }
    }

    #[must_use]
    pub fn routers(&self) -> &Arc<RouterRegistry> {
        &self.routers
    }

    fn connections(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<AsyncMutex<ConnectionMedia>>>> {
        self.connections.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn index(&self) -> MutexGuard<'_, ResourceIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn connection(
        &self,
        connection_id: ConnectionId,
    ) -> Result<Arc<AsyncMutex<ConnectionMedia>>, SessionError> {
        self.connections()
            .get(&connection_id)
            .cloned()
            .ok_or(SessionError::NotJoined)
    }

    /// Start tracking media for a connection that just joined `meeting_id`.
    ///
    /// No engine resources are allocated until the connection asks for the
    /// router's capabilities or a transport.
    pub async fn open(&self, connection_id: ConnectionId, meeting_id: &str, user_id: &str) {
        if self.is_open(connection_id) {
            self.close_for_connection(connection_id).await;
        }
        let media = ConnectionMedia {
            meeting_id: meeting_id.to_string(),
            user_id: user_id.to_string(),
            router: None,
            transports: HashMap::new(),
            closed: false,
        };
        self.connections()
            .insert(connection_id, Arc::new(AsyncMutex::new(media)));
        debug!(
            target: "cs.media.session",
            connection_id = %connection_id,
            meeting_id = %meeting_id,
            "Media session opened"
        );
    }

    async fn acquire_router(
        &self,
        media: &mut ConnectionMedia,
    ) -> Result<Arc<RouterContext>, SessionError> {
        if let Some(router) = &media.router {
            if router.is_closed() {
                return Err(SessionError::MediaUnavailable(media.meeting_id.clone()));
            }
            return Ok(Arc::clone(router));
        }
        let router = self.routers.get_or_create(&media.meeting_id).await?;
        media.router = Some(Arc::clone(&router));
        Ok(router)
    }

    /// RTP capabilities of the meeting's router, creating it if needed.
    ///
    /// A connection whose router was lost with its worker gives up that
    /// lease here and tries to acquire a fresh router; this succeeds once
    /// every holder of the lost router has let go.
    ///
    /// # Errors
    ///
    /// `NotJoined` for unknown connections, `RouterCreationFailed` when no
    /// router can be obtained.
    #[instrument(skip_all, name = "cs.media.capabilities", fields(connection_id = %connection_id))]
    pub async fn router_capabilities(
        &self,
        connection_id: ConnectionId,
    ) -> Result<RtpCapabilities, SessionError> {
        let handle = self.connection(connection_id)?;
        let mut media = handle.lock().await;
        if media.closed {
            return Err(SessionError::NotJoined);
        }

        if media.router.as_ref().is_some_and(|r| r.is_closed()) {
            if let Some(lost) = media.router.take() {
                self.routers.release(lost.meeting_id()).await;
            }
            media.transports.clear();
        }

        let router = self.acquire_router(&mut media).await?;
        Ok(router.rtp_capabilities().clone())
    }

    /// Create a WebRTC transport for the connection. A second transport in the
    /// same direction replaces the first, which is closed with everything on it.
    ///
    /// # Errors
    ///
    /// `BadRequest` if `meeting_id` is not the connection's meeting,
    /// `RouterCreationFailed`/`MediaUnavailable` when routing is unavailable.
    #[instrument(
        skip_all,
        name = "cs.media.create_transport",
        fields(connection_id = %connection_id, direction = direction.as_str())
    )]
    pub async fn create_transport(
        &self,
        connection_id: ConnectionId,
        meeting_id: &str,
        direction: TransportDirection,
    ) -> Result<TransportParams, SessionError> {
        let handle = self.connection(connection_id)?;
        let mut media = handle.lock().await;
        media.ensure_open()?;
        if media.meeting_id != meeting_id {
            return Err(SessionError::BadRequest(
                "meetingId does not match the joined meeting".to_string(),
            ));
        }

        let router = self.acquire_router(&mut media).await?;
        let params = self
            .engine
            .create_webrtc_transport(router.router_id(), &self.transport_options)
            .await
            .map_err(|e| engine_failure("create_transport", &media.meeting_id, e))?;
        metrics::record_engine_operation("create_transport", "success");

        if let Some(previous) = media.transports.insert(direction, params.id.clone()) {
            let mut detached = Detached::default();
            self.index().detach_transport(&previous, &mut detached);
            self.close_detached(detached, Some(connection_id)).await;
            debug!(
                target: "cs.media.session",
                connection_id = %connection_id,
                transport_id = %previous,
                "Replaced transport closed"
            );
        }

        self.index().transports.insert(
            params.id.clone(),
            TransportRecord {
                owner: connection_id,
                meeting_id: media.meeting_id.clone(),
                direction,
                producers: HashSet::new(),
                consumers: HashSet::new(),
            },
        );

        debug!(
            target: "cs.media.session",
            connection_id = %connection_id,
            transport_id = %params.id,
            "Transport created"
        );
        Ok(params)
    }

    /// Complete the DTLS handshake parameters of an owned transport.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or foreign transports.
    #[instrument(skip_all, name = "cs.media.connect_transport", fields(connection_id = %connection_id))]
    pub async fn connect_transport(
        &self,
        connection_id: ConnectionId,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), SessionError> {
        let handle = self.connection(connection_id)?;
        let media = handle.lock().await;
        media.ensure_open()?;
        if self.index().owned_transport(transport_id, connection_id).is_none() {
            return Err(SessionError::transport_not_found(transport_id));
        }

        self.engine
            .connect_transport(transport_id, dtls_parameters)
            .await
            .map_err(|e| engine_failure("connect_transport", &media.meeting_id, e))?;
        metrics::record_engine_operation("connect_transport", "success");
        Ok(())
    }

    /// Start an outbound track on an owned send transport and announce it to
    /// the other members of the meeting.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or foreign transports, `BadRequest` for a
    /// receive transport or parameters the router rejects.
    #[instrument(skip_all, name = "cs.media.produce", fields(connection_id = %connection_id, kind = %kind))]
    pub async fn produce(
        &self,
        connection_id: ConnectionId,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
        app_data: Value,
    ) -> Result<String, SessionError> {
        let handle = self.connection(connection_id)?;
        let media = handle.lock().await;
        media.ensure_open()?;
        let direction = self
            .index()
            .owned_transport(transport_id, connection_id)
            .map(|t| t.direction);
        match direction {
            None => return Err(SessionError::transport_not_found(transport_id)),
            Some(TransportDirection::Recv) => {
                return Err(SessionError::BadRequest(
                    "produce requires a send transport".to_string(),
                ))
            }
            Some(TransportDirection::Send) => {}
        }

        let producer_id = self
            .engine
            .produce(transport_id, kind, rtp_parameters)
            .await
            .map_err(|e| engine_failure("produce", &media.meeting_id, e))?;
        metrics::record_engine_operation("produce", "success");

        {
            let mut index = self.index();
            if let Some(transport) = index.transports.get_mut(transport_id) {
                transport.producers.insert(producer_id.clone());
            }
            index.producers.insert(
                producer_id.clone(),
                ProducerRecord {
                    owner: connection_id,
                    transport_id: transport_id.to_string(),
                    meeting_id: media.meeting_id.clone(),
                    consumers: HashSet::new(),
                },
            );
        }

        let event = SessionEvent::NewProducer(NewProducer {
            producer_id: producer_id.clone(),
            meeting_id: media.meeting_id.clone(),
            user_id: media.user_id.clone(),
            kind,
            app_data,
        });
        let meeting_id = media.meeting_id.clone();
        drop(media);

        self.broadcast_except(&meeting_id, Some(connection_id), &event)
            .await;

        info!(
            target: "cs.media.session",
            connection_id = %connection_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        Ok(producer_id)
    }

    /// Create a paused consumer of a producer in the same meeting on an owned
    /// receive transport.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or foreign transports and for producers outside
    /// the meeting (or closed while this call ran), `CannotConsume` when the
    /// receiver capabilities cannot decode the producer.
    #[instrument(skip_all, name = "cs.media.consume", fields(connection_id = %connection_id, producer_id = %producer_id))]
    pub async fn consume(
        &self,
        connection_id: ConnectionId,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerDescriptor, SessionError> {
        let handle = self.connection(connection_id)?;
        let media = handle.lock().await;
        media.ensure_open()?;
        {
            let index = self.index();
            match index.owned_transport(transport_id, connection_id) {
                None => return Err(SessionError::transport_not_found(transport_id)),
                Some(t) if t.direction != TransportDirection::Recv => {
                    return Err(SessionError::BadRequest(
                        "consume requires a recv transport".to_string(),
                    ))
                }
                Some(_) => {}
            }
            let in_meeting = index
                .producers
                .get(producer_id)
                .is_some_and(|p| p.meeting_id == media.meeting_id);
            if !in_meeting {
                return Err(SessionError::producer_not_found(producer_id));
            }
        }
        let router = media
            .router
            .clone()
            .ok_or_else(|| SessionError::transport_not_found(transport_id))?;

        let compatible = self
            .engine
            .can_consume(router.router_id(), producer_id, rtp_capabilities)
            .await
            .map_err(|e| engine_failure("can_consume", &media.meeting_id, e))?;
        if !compatible {
            return Err(SessionError::CannotConsume {
                producer_id: producer_id.to_string(),
            });
        }

        let descriptor = self
            .engine
            .consume(transport_id, producer_id, rtp_capabilities)
            .await
            .map_err(|e| match e {
                EngineError::Incompatible(_) => {
                    metrics::record_engine_operation("consume", "error");
                    SessionError::CannotConsume {
                        producer_id: producer_id.to_string(),
                    }
                }
                other => engine_failure("consume", &media.meeting_id, other),
            })?;
        metrics::record_engine_operation("consume", "success");

        let registered = self.index().register_consumer(
            &descriptor.id,
            ConsumerRecord {
                owner: connection_id,
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
            },
        );
        if !registered {
            self.engine.close_consumer(&descriptor.id).await;
            debug!(
                target: "cs.media.session",
                connection_id = %connection_id,
                consumer_id = %descriptor.id,
                "Producer closed during consume, consumer discarded"
            );
            return Err(SessionError::producer_not_found(producer_id));
        }

        debug!(
            target: "cs.media.session",
            connection_id = %connection_id,
            consumer_id = %descriptor.id,
            "Consumer created paused"
        );
        Ok(descriptor)
    }

    /// Resume an owned consumer. Unknown, foreign, closed and already-active
    /// consumers are ignored.
    #[instrument(skip_all, name = "cs.media.resume_consumer", fields(connection_id = %connection_id))]
    pub async fn resume_consumer(&self, connection_id: ConnectionId, consumer_id: &str) {
        let Ok(handle) = self.connection(connection_id) else {
            return;
        };
        let media = handle.lock().await;
        if media.closed {
            return;
        }
        let owned = self
            .index()
            .consumers
            .get(consumer_id)
            .is_some_and(|c| c.owner == connection_id);
        if !owned {
            debug!(
                target: "cs.media.session",
                consumer_id = %consumer_id,
                "Resume for unknown consumer ignored"
            );
            return;
        }

        match self.engine.resume_consumer(consumer_id).await {
            Ok(()) => metrics::record_engine_operation("resume_consumer", "success"),
            Err(e) => {
                metrics::record_engine_operation("resume_consumer", "error");
                debug!(
                    target: "cs.media.session",
                    consumer_id = %consumer_id,
                    error = %e,
                    "Resume failed, ignored"
                );
            }
        }
    }

    /// Close an owned producer and every consumer of it.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or foreign producers.
    pub async fn close_producer(
        &self,
        connection_id: ConnectionId,
        producer_id: &str,
    ) -> Result<(), SessionError> {
        let handle = self.connection(connection_id)?;
        let media = handle.lock().await;
        if media.closed {
            return Err(SessionError::NotJoined);
        }
        let mut detached = Detached::default();
        {
            let mut index = self.index();
            if !index
                .producers
                .get(producer_id)
                .is_some_and(|p| p.owner == connection_id)
            {
                return Err(SessionError::producer_not_found(producer_id));
            }
            index.detach_producer(producer_id, &mut detached);
        }
        self.close_detached(detached, Some(connection_id)).await;
        Ok(())
    }

    /// Close an owned consumer.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or foreign consumers.
    pub async fn close_consumer(
        &self,
        connection_id: ConnectionId,
        consumer_id: &str,
    ) -> Result<(), SessionError> {
        let handle = self.connection(connection_id)?;
        let media = handle.lock().await;
        if media.closed {
            return Err(SessionError::NotJoined);
        }
        let detached = {
            let mut index = self.index();
            if !index
                .consumers
                .get(consumer_id)
                .is_some_and(|c| c.owner == connection_id)
            {
                return Err(SessionError::consumer_not_found(consumer_id));
            }
            index.detach_consumer(consumer_id)
        };
        if detached.is_some() {
            self.engine.close_consumer(consumer_id).await;
        }
        Ok(())
    }

    /// Close an owned transport with its producers and consumers.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown or foreign transports.
    pub async fn close_transport(
        &self,
        connection_id: ConnectionId,
        transport_id: &str,
    ) -> Result<(), SessionError> {
        let handle = self.connection(connection_id)?;
        let mut media = handle.lock().await;
        if media.closed {
            return Err(SessionError::NotJoined);
        }
        let mut detached = Detached::default();
        {
            let mut index = self.index();
            if index.owned_transport(transport_id, connection_id).is_none() {
                return Err(SessionError::transport_not_found(transport_id));
            }
            index.detach_transport(transport_id, &mut detached);
        }
        media.transports.retain(|_, id| id != transport_id);
        self.close_detached(detached, Some(connection_id)).await;
        Ok(())
    }

    /// Close every transport of the connection (and with them its producers
    /// and consumers) and release its router lease. Idempotent.
    #[instrument(skip_all, name = "cs.media.close_connection", fields(connection_id = %connection_id))]
    pub async fn close_for_connection(&self, connection_id: ConnectionId) {
        let Some(handle) = self.connections().remove(&connection_id) else {
            return;
        };
        let mut media = handle.lock().await;
        if media.closed {
            return;
        }
        media.closed = true;

        let mut detached = Detached::default();
        {
            let mut index = self.index();
            for (_, transport_id) in media.transports.drain() {
                index.detach_transport(&transport_id, &mut detached);
            }
        }
        let transports = detached.transports.len();
        self.close_detached(detached, Some(connection_id)).await;

        if let Some(router) = media.router.take() {
            self.routers.release(router.meeting_id()).await;
        }

        info!(
            target: "cs.media.session",
            connection_id = %connection_id,
            meeting_id = %media.meeting_id,
            transports = transports,
            "Media session closed"
        );
    }

    /// Apply an asynchronous engine notification.
    pub async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::TransportClosed { transport_id } => {
                self.drop_engine_closed_transport(&transport_id).await;
            }
            EngineEvent::WorkerDied { router_ids } => {
                for meeting_id in self.routers.fail_routers(&router_ids) {
                    self.fail_meeting(&meeting_id).await;
                }
            }
        }
    }

    async fn drop_engine_closed_transport(&self, transport_id: &str) {
        let owner = self.index().transports.get(transport_id).map(|t| t.owner);
        let Some(owner) = owner else {
            debug!(
                target: "cs.media.session",
                transport_id = %transport_id,
                "Engine closed an untracked transport"
            );
            return;
        };
        let Ok(handle) = self.connection(owner) else {
            return;
        };

        let mut media = handle.lock().await;
        media.transports.retain(|_, id| id != transport_id);
        let mut detached = Detached::default();
        self.index().detach_transport(transport_id, &mut detached);
        self.close_detached(detached, Some(owner)).await;
        info!(
            target: "cs.media.session",
            connection_id = %owner,
            transport_id = %transport_id,
            "Transport closed by engine"
        );
    }

    /// Drop every resource of a meeting whose router died and tell its members.
    async fn fail_meeting(&self, meeting_id: &str) {
        let mut detached = Detached::default();
        {
            let mut index = self.index();
            let lost: Vec<String> = index
                .transports
                .iter()
                .filter(|(_, t)| t.meeting_id == meeting_id)
                .map(|(id, _)| id.clone())
                .collect();
            for transport_id in lost {
                index.detach_transport(&transport_id, &mut detached);
            }
        }
        self.close_detached(detached, None).await;

        self.broadcast_except(
            meeting_id,
            None,
            &SessionEvent::MediaUnavailable(MediaUnavailable {
                meeting_id: meeting_id.to_string(),
            }),
        )
        .await;
        warn!(
            target: "cs.media.session",
            meeting_id = %meeting_id,
            "Meeting media failed closed"
        );
    }

    /// Close detached engine objects, children first. Owners of closed
    /// consumers other than `initiator` get `consumer-closed`; with no
    /// initiator nobody is notified.
    async fn close_detached(&self, detached: Detached, initiator: Option<ConnectionId>) {
        for (consumer_id, consumer) in detached.consumers {
            self.engine.close_consumer(&consumer_id).await;
            if initiator.is_some_and(|id| id != consumer.owner) {
                self.sink.deliver(
                    &[consumer.owner],
                    &SessionEvent::ConsumerClosed(ConsumerClosed {
                        consumer_id,
                        producer_id: consumer.producer_id,
                    }),
                );
            }
        }
        for producer_id in detached.producers {
            self.engine.close_producer(&producer_id).await;
        }
        for transport_id in detached.transports {
            self.engine.close_transport(&transport_id).await;
        }
    }

    /// Deliver `event` to every member of the meeting except `excluded`.
    /// A presence failure drops the broadcast and counts it as dropped.
    async fn broadcast_except(
        &self,
        meeting_id: &str,
        excluded: Option<ConnectionId>,
        event: &SessionEvent,
    ) {
        match self.presence.participants(meeting_id).await {
            Ok(participants) => {
                let recipients: Vec<ConnectionId> = participants
                    .into_iter()
                    .map(|p| p.connection_id)
                    .filter(|id| Some(*id) != excluded)
                    .collect();
                self.sink.deliver(&recipients, event);
            }
            Err(e) => {
                metrics::record_event_dropped(event.name());
                warn!(
                    target: "cs.media.session",
                    meeting_id = %meeting_id,
                    event = event.name(),
                    error = %e,
                    "Presence lookup failed, broadcast dropped"
                );
            }
        }
    }

    /// Whether a connection has an open media session.
    #[must_use]
    pub fn is_open(&self, connection_id: ConnectionId) -> bool {
        self.connections().contains_key(&connection_id)
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.index().transports.len()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.index().producers.len()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.index().consumers.len()
    }
}

/// Feed engine notifications into the manager until cancelled or the engine
/// drops its event channel.
pub fn spawn_engine_event_loop(
    media: Arc<MediaSessionManager>,
    mut events: broadcast::Receiver<EngineEvent>,
    cancel_token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    debug!(target: "cs.engine", "Engine event loop cancelled");
                    break;
                }
                event = events.recv() => match event {
                    Ok(event) => media.handle_engine_event(event).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(
                            target: "cs.engine",
                            skipped = skipped,
                            "Engine event loop lagged, events skipped"
                        );
                    }
                    Err(RecvError::Closed) => {
                        info!(target: "cs.engine", "Engine event channel closed");
                        break;
                    }
                }
            }
        }
    })
}
