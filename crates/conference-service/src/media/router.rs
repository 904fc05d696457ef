//! Router registry: one routing context per active meeting.
//!
//! Routers are created lazily on the first capability or transport request of
//! a meeting and reference-counted by the connections holding them. Creation
//! is single-flight per meeting: concurrent callers share one engine call. The
//! last release closes the router exactly once.
//!
//! When an engine worker dies, the registry marks the affected meetings
//! failed. Their contexts stay registered (holders still reference them) but
//! report closed, and new acquisitions fail with `RouterCreationFailed` until
//! every holder has released.

use super::engine::{MediaEngine, RtpCapabilities, RtpCodecCapability};
use crate::errors::SessionError;
use crate::observability::metrics;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

/// Routing context of one meeting.
#[derive(Debug)]
pub struct RouterContext {
    meeting_id: String,
    router_id: String,
    rtp_capabilities: RtpCapabilities,
    closed: AtomicBool,
}

impl RouterContext {
    #[must_use]
    pub fn meeting_id(&self) -> &str {
        &self.meeting_id
    }

    #[must_use]
    pub fn router_id(&self) -> &str {
        &self.router_id
    }

    #[must_use]
    pub fn rtp_capabilities(&self) -> &RtpCapabilities {
        &self.rtp_capabilities
    }

    /// True once the router was closed or lost with its worker.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Marks the context closed; returns true only for the first caller.
    fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::SeqCst)
    }
}

struct RouterSlot {
    cell: Arc<OnceCell<Arc<RouterContext>>>,
    holders: usize,
    failed: bool,
}

/// Per-process registry of meeting routers.
pub struct RouterRegistry {
    engine: Arc<dyn MediaEngine>,
    codecs: Vec<RtpCodecCapability>,
    slots: Mutex<HashMap<String, RouterSlot>>,
}

impl RouterRegistry {
    pub fn new(engine: Arc<dyn MediaEngine>, codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            engine,
            codecs,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, RouterSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire a reference to the meeting's router, creating it if needed.
    ///
    /// Every successful call must be paired with one [`release`](Self::release).
    ///
    /// # Errors
    ///
    /// `RouterCreationFailed` if the engine cannot create the router or the
    /// meeting's previous router was lost with its worker and is still held.
    #[instrument(skip_all, name = "cs.media.router.acquire", fields(meeting_id = %meeting_id))]
    pub async fn get_or_create(&self, meeting_id: &str) -> Result<Arc<RouterContext>, SessionError> {
        let cell = {
            let mut slots = self.slots();
            let slot = slots
                .entry(meeting_id.to_string())
                .or_insert_with(|| RouterSlot {
                    cell: Arc::new(OnceCell::new()),
                    holders: 0,
                    failed: false,
                });
            if slot.failed {
                metrics::record_router_creation("rejected");
                return Err(SessionError::RouterCreationFailed {
                    meeting_id: meeting_id.to_string(),
                    reason: "previous router lost with its worker".to_string(),
                });
            }
            slot.holders += 1;
            Arc::clone(&slot.cell)
        };

        let result = cell
            .get_or_try_init(|| async {
                let info = self.engine.create_router(&self.codecs).await?;
                metrics::record_router_creation("success");
                info!(
                    target: "cs.media.router",
                    meeting_id = %meeting_id,
                    router_id = %info.id,
                    "Router created"
                );
                Ok::<_, super::engine::EngineError>(Arc::new(RouterContext {
                    meeting_id: meeting_id.to_string(),
                    router_id: info.id,
                    rtp_capabilities: info.rtp_capabilities,
                    closed: AtomicBool::new(false),
                }))
            })
            .await;

        match result {
            Ok(context) => {
                self.publish_active_count();
                Ok(Arc::clone(context))
            }
            Err(e) => {
                metrics::record_router_creation("error");
                warn!(
                    target: "cs.media.router",
                    meeting_id = %meeting_id,
                    error = %e,
                    "Router creation failed"
                );
                self.release(meeting_id).await;
                Err(SessionError::RouterCreationFailed {
                    meeting_id: meeting_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Drop one reference to the meeting's router. At zero the router is
    /// closed. Releasing a meeting with no holders is a no-op.
    #[instrument(skip_all, name = "cs.media.router.release", fields(meeting_id = %meeting_id))]
    pub async fn release(&self, meeting_id: &str) {
        let released = {
            let mut slots = self.slots();
            let Some(slot) = slots.get_mut(meeting_id) else {
                debug!(
                    target: "cs.media.router",
                    meeting_id = %meeting_id,
                    "Release for meeting without router ignored"
                );
                return;
            };
            slot.holders = slot.holders.saturating_sub(1);
            if slot.holders > 0 {
                return;
            }
            slots.remove(meeting_id)
        };

        let Some(context) = released.and_then(|slot| slot.cell.get().cloned()) else {
            return;
        };

        if context.mark_closed() {
            self.engine.close_router(&context.router_id).await;
            info!(
                target: "cs.media.router",
                meeting_id = %meeting_id,
                router_id = %context.router_id,
                "Router closed after last release"
            );
        }
        self.publish_active_count();
    }

    /// Mark the meetings hosted on `router_ids` as failed after a worker
    /// death. Returns the affected meeting ids.
    pub fn fail_routers(&self, router_ids: &[String]) -> Vec<String> {
        let mut failed = Vec::new();
        {
            let mut slots = self.slots();
            for (meeting_id, slot) in slots.iter_mut() {
                let Some(context) = slot.cell.get() else {
                    continue;
                };
                if router_ids.iter().any(|id| id == &context.router_id) {
                    slot.failed = true;
                    context.mark_closed();
                    failed.push(meeting_id.clone());
                }
            }
        }

        if !failed.is_empty() {
            warn!(
                target: "cs.media.router",
                meetings = failed.len(),
                "Routers lost with engine worker, meetings fail closed"
            );
        }
        self.publish_active_count();
        failed
    }

    /// Current holder count for a meeting (0 when no router is registered).
    #[must_use]
    pub fn holders(&self, meeting_id: &str) -> usize {
        self.slots().get(meeting_id).map_or(0, |slot| slot.holders)
    }

    /// Registered router for a meeting, if one has been created.
    #[must_use]
    pub fn router_for(&self, meeting_id: &str) -> Option<Arc<RouterContext>> {
        self.slots()
            .get(meeting_id)
            .and_then(|slot| slot.cell.get().cloned())
    }

    /// Number of meetings with a live (created and not closed) router.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.slots()
            .values()
            .filter(|slot| slot.cell.get().is_some_and(|ctx| !ctx.is_closed()))
            .count()
    }

    fn publish_active_count(&self) {
        metrics::set_meetings_active(self.active_count() as u64);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::codecs::default_media_codecs;
    use crate::media::local::LocalMediaEngine;

    fn registry() -> (Arc<LocalMediaEngine>, Arc<RouterRegistry>) {
        let engine = Arc::new(LocalMediaEngine::new());
        let registry = Arc::new(RouterRegistry::new(
            Arc::clone(&engine) as Arc<dyn MediaEngine>,
            default_media_codecs(),
        ));
        (engine, registry)
    }

    #[tokio::test]
    async fn test_same_meeting_shares_one_router() {
        let (engine, registry) = registry();

        let first = registry.get_or_create("m-1").await.unwrap();
        let second = registry.get_or_create("m-1").await.unwrap();

        assert_eq!(first.router_id(), second.router_id());
        assert_eq!(registry.holders("m-1"), 2);
        assert_eq!(engine.router_count(), 1);
    }

    #[tokio::test]
    async fn test_meetings_get_distinct_routers() {
        let (engine, registry) = registry();

        let a = registry.get_or_create("m-a").await.unwrap();
        let b = registry.get_or_create("m-b").await.unwrap();

        assert_ne!(a.router_id(), b.router_id());
        assert_eq!(engine.router_count(), 2);
        assert_eq!(registry.active_count(), 2);
    }

    #[tokio::test]
    async fn test_last_release_closes_router() {
        let (engine, registry) = registry();
        let context = registry.get_or_create("m-1").await.unwrap();
        registry.get_or_create("m-1").await.unwrap();

        registry.release("m-1").await;
        assert!(!context.is_closed());
        assert_eq!(engine.router_count(), 1);

        registry.release("m-1").await;
        assert!(context.is_closed());
        assert_eq!(engine.router_count(), 0);
        assert_eq!(registry.holders("m-1"), 0);
        assert!(registry.router_for("m-1").is_none());
    }

    #[tokio::test]
    async fn test_extra_release_is_noop() {
        let (_engine, registry) = registry();
        registry.get_or_create("m-1").await.unwrap();

        registry.release("m-1").await;
        registry.release("m-1").await;
        registry.release("never-created").await;

        assert_eq!(registry.holders("m-1"), 0);
    }

    #[tokio::test]
    async fn test_router_recreated_after_full_release() {
        let (_engine, registry) = registry();
        let first = registry.get_or_create("m-1").await.unwrap();
        registry.release("m-1").await;

        let second = registry.get_or_create("m-1").await.unwrap();
        assert_ne!(first.router_id(), second.router_id());
        assert!(!second.is_closed());
    }

    #[tokio::test]
    async fn test_concurrent_acquire_creates_once() {
        let (engine, registry) = registry();

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get_or_create("m-1").await.unwrap() })
            })
            .collect();

        let mut router_ids = Vec::new();
        for task in tasks {
            router_ids.push(task.await.unwrap().router_id().to_string());
        }
        router_ids.dedup();

        assert_eq!(router_ids.len(), 1);
        assert_eq!(engine.router_count(), 1);
        assert_eq!(registry.holders("m-1"), 16);
    }

    #[tokio::test]
    async fn test_concurrent_release_closes_exactly_once() {
        let (engine, registry) = registry();
        for _ in 0..8 {
            registry.get_or_create("m-1").await.unwrap();
        }

        let tasks: Vec<_> = (0..12)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.release("m-1").await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.holders("m-1"), 0);
        assert_eq!(engine.router_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_death_fails_meeting_until_released() {
        let (engine, registry) = registry();
        let context = registry.get_or_create("m-1").await.unwrap();
        registry.get_or_create("m-other").await.unwrap();

        let lost = engine.simulate_worker_death();
        let mut failed = registry.fail_routers(&lost);
        failed.sort();

        assert_eq!(failed, vec!["m-1".to_string(), "m-other".to_string()]);
        assert!(context.is_closed());
        assert!(matches!(
            registry.get_or_create("m-1").await,
            Err(SessionError::RouterCreationFailed { .. })
        ));

        registry.release("m-1").await;
        let fresh = registry.get_or_create("m-1").await.unwrap();
        assert!(!fresh.is_closed());
        assert_ne!(fresh.router_id(), context.router_id());
    }

    #[tokio::test]
    async fn test_fail_routers_ignores_unrelated_ids() {
        let (_engine, registry) = registry();
        let context = registry.get_or_create("m-1").await.unwrap();

        let failed = registry.fail_routers(&["some-other-router".to_string()]);

        assert!(failed.is_empty());
        assert!(!context.is_closed());
    }
}
