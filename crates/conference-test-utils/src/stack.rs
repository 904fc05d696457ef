//! Fully wired session core, in-memory presence unless told otherwise.

use crate::capturing_sink::CapturingSink;
use crate::fixtures::{test_transport_options, TestParticipant};
use crate::scripted_engine::ScriptedEngine;
use common::types::ConnectionId;
use conference_service::events::EventSink;
use conference_service::media::{
    default_media_codecs, spawn_engine_event_loop, MediaEngine, MediaSessionManager,
    RouterRegistry,
};
use conference_service::presence::{InMemoryPresenceStore, PresenceStore};
use conference_service::room::{RoomService, RoomSnapshot};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Room service, media manager and their backends, sharing one engine.
pub struct TestStack {
    pub engine: Arc<ScriptedEngine>,
    pub presence: Arc<dyn PresenceStore>,
    pub sink: Arc<CapturingSink>,
    pub routers: Arc<RouterRegistry>,
    pub media: Arc<MediaSessionManager>,
    pub room: Arc<RoomService>,
}

impl Default for TestStack {
    fn default() -> Self {
        Self::new()
    }
}

impl TestStack {
    #[must_use]
    pub fn new() -> Self {
        Self::with_engine(ScriptedEngine::new())
    }

    #[must_use]
    pub fn with_engine(engine: ScriptedEngine) -> Self {
        Self::with_backends(engine, Arc::new(InMemoryPresenceStore::new()))
    }

    /// Stack over a caller-supplied presence backend, such as Redis.
    #[must_use]
    pub fn with_presence(presence: Arc<dyn PresenceStore>) -> Self {
        Self::with_backends(ScriptedEngine::new(), presence)
    }

    #[must_use]
    pub fn with_backends(engine: ScriptedEngine, presence: Arc<dyn PresenceStore>) -> Self {
        let engine = Arc::new(engine);
        let sink = Arc::new(CapturingSink::new());
        let routers = Arc::new(RouterRegistry::new(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            default_media_codecs(),
        ));
        let media = Arc::new(MediaSessionManager::new(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            Arc::clone(&routers),
            Arc::clone(&presence),
            Arc::clone(&sink) as Arc<dyn EventSink>,
            test_transport_options(),
        ));
        let room = Arc::new(RoomService::new(
            Arc::clone(&presence),
            Arc::clone(&media),
            Arc::clone(&sink) as Arc<dyn EventSink>,
        ));
        Self {
            engine,
            presence,
            sink,
            routers,
            media,
            room,
        }
    }

    /// Forward engine notifications into the media manager until `cancel_token` fires.
    pub fn spawn_engine_events(&self, cancel_token: CancellationToken) -> JoinHandle<()> {
        spawn_engine_event_loop(
            Arc::clone(&self.media),
            self.engine.subscribe(),
            cancel_token,
        )
    }

    /// Join `participant` to `meeting_id` on a fresh connection.
    pub async fn join(
        &self,
        meeting_id: &str,
        participant: &TestParticipant,
    ) -> (ConnectionId, RoomSnapshot) {
        let connection_id = ConnectionId::new();
        let snapshot = self
            .room
            .join(
                connection_id,
                meeting_id,
                &participant.user_id,
                &participant.name,
            )
            .await
            .unwrap();
        (connection_id, snapshot)
    }
}
