//! Liveness and readiness probes.
//!
//! - `GET /health` - the process is running
//! - `GET /ready` - the signaling listener is bound and not draining
//!
//! `/metrics` is merged onto the same router by the binary.

use axum::{extract::State, http::StatusCode, routing::get, Router};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Probe state shared between the binary and the health router.
#[derive(Debug)]
pub struct HealthState {
    live: AtomicBool,
    /// Set once signaling accepts connections, cleared when shutdown begins.
    ready: AtomicBool,
}

impl Default for HealthState {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthState {
    /// Live but not yet ready.
    #[must_use]
    pub fn new() -> Self {
        Self {
            live: AtomicBool::new(true),
            ready: AtomicBool::new(false),
        }
    }

    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Stop advertising readiness so load balancers drain the instance.
    pub fn set_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}

/// Router serving `/health` and `/ready`.
pub fn health_router(health_state: Arc<HealthState>) -> Router {
    Router::new()
        .route("/health", get(liveness))
        .route("/ready", get(readiness))
        .with_state(health_state)
}

fn probe_status(ok: bool) -> StatusCode {
    if ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn liveness(State(state): State<Arc<HealthState>>) -> StatusCode {
    probe_status(state.is_live())
}

async fn readiness(State(state): State<Arc<HealthState>>) -> StatusCode {
    probe_status(state.is_ready())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::util::ServiceExt;

    async fn status_of(state: Arc<HealthState>, uri: &str) -> StatusCode {
        let request = Request::builder()
            .uri(uri)
            .body(Body::empty())
            .expect("Failed to build request");
        health_router(state)
            .oneshot(request)
            .await
            .expect("Failed to execute request")
            .status()
    }

    #[test]
    fn test_new_state_is_live_not_ready() {
        let state = HealthState::new();
        assert!(state.is_live());
        assert!(!state.is_ready());
    }

    #[tokio::test]
    async fn test_liveness_is_ok_from_start() {
        let state = Arc::new(HealthState::new());
        assert_eq!(status_of(state, "/health").await, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_readiness_follows_listener_lifecycle() {
        let state = Arc::new(HealthState::new());
        assert_eq!(
            status_of(Arc::clone(&state), "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE
        );

        state.set_ready();
        assert_eq!(status_of(Arc::clone(&state), "/ready").await, StatusCode::OK);

        state.set_not_ready();
        assert_eq!(
            status_of(state, "/ready").await,
            StatusCode::SERVICE_UNAVAILABLE,
            "draining instance must fail readiness"
        );
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found() {
        let state = Arc::new(HealthState::new());
        assert_eq!(status_of(state, "/nope").await, StatusCode::NOT_FOUND);
    }
}
