//! Media engine with scriptable timing and failures.
//!
//! Wraps [`LocalMediaEngine`] so resources behave like the real thing, and
//! lets a test slow down or fail router creation and count engine calls.
//!
//! # Example
//!
//! ```rust,ignore
//! use conference_test_utils::ScriptedEngine;
//! use std::time::Duration;
//!
//! let engine = ScriptedEngine::new().with_router_delay(Duration::from_millis(50));
//! engine.fail_next_router("worker pool exhausted");
//! ```

use async_trait::async_trait;
use conference_service::media::engine::{
    ConsumerDescriptor, DtlsParameters, EngineError, EngineEvent, MediaEngine, MediaKind,
    RouterInfo, RtpCapabilities, RtpCodecCapability, RtpParameters, TransportOptions,
    TransportParams,
};
use conference_service::media::LocalMediaEngine;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

/// Scriptable wrapper around the in-process engine.
#[derive(Default)]
pub struct ScriptedEngine {
    inner: LocalMediaEngine,
    router_delay: Mutex<Duration>,
    transport_delay: Mutex<Duration>,
    next_router_failure: Mutex<Option<String>>,
    create_router_calls: AtomicUsize,
    close_router_calls: AtomicUsize,
    close_transport_calls: AtomicUsize,
}

impl ScriptedEngine {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every `create_router` call.
    #[must_use]
    pub fn with_router_delay(self, delay: Duration) -> Self {
        *self.router_delay.lock().unwrap() = delay;
        self
    }

    /// Delay every `create_webrtc_transport` call.
    #[must_use]
    pub fn with_transport_delay(self, delay: Duration) -> Self {
        *self.transport_delay.lock().unwrap() = delay;
        self
    }

    /// Make the next `create_router` call fail with `WorkerUnavailable`.
    pub fn fail_next_router(&self, reason: impl Into<String>) {
        *self.next_router_failure.lock().unwrap() = Some(reason.into());
    }

    /// The wrapped engine, for inspection and fault injection.
    #[must_use]
    pub fn local(&self) -> &LocalMediaEngine {
        &self.inner
    }

    #[must_use]
    pub fn create_router_calls(&self) -> usize {
        self.create_router_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn close_router_calls(&self) -> usize {
        self.close_router_calls.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn close_transport_calls(&self) -> usize {
        self.close_transport_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaEngine for ScriptedEngine {
    async fn create_router(&self, codecs: &[RtpCodecCapability]) -> Result<RouterInfo, EngineError> {
        self.create_router_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.router_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failure = self.next_router_failure.lock().unwrap().take();
        if let Some(reason) = failure {
            return Err(EngineError::WorkerUnavailable(reason));
        }
        self.inner.create_router(codecs).await
    }

    async fn close_router(&self, router_id: &str) {
        self.close_router_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.close_router(router_id).await;
    }

    async fn create_webrtc_transport(
        &self,
        router_id: &str,
        options: &TransportOptions,
    ) -> Result<TransportParams, EngineError> {
        let delay = *self.transport_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.inner.create_webrtc_transport(router_id, options).await
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: &DtlsParameters,
    ) -> Result<(), EngineError> {
        self.inner
            .connect_transport(transport_id, dtls_parameters)
            .await
    }

    async fn close_transport(&self, transport_id: &str) {
        self.close_transport_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.close_transport(transport_id).await;
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> Result<String, EngineError> {
        self.inner.produce(transport_id, kind, rtp_parameters).await
    }

    async fn close_producer(&self, producer_id: &str) {
        self.inner.close_producer(producer_id).await;
    }

    async fn can_consume(
        &self,
        router_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<bool, EngineError> {
        self.inner
            .can_consume(router_id, producer_id, rtp_capabilities)
            .await
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> Result<ConsumerDescriptor, EngineError> {
        self.inner
            .consume(transport_id, producer_id, rtp_capabilities)
            .await
    }

    async fn resume_consumer(&self, consumer_id: &str) -> Result<(), EngineError> {
        self.inner.resume_consumer(consumer_id).await
    }

    async fn close_consumer(&self, consumer_id: &str) {
        self.inner.close_consumer(consumer_id).await;
    }

    fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.inner.subscribe()
    }
}
