//! Conference Service
//!
//! Live session core: room presence, media routing and WebSocket signaling.
//!
//! # Servers
//!
//! - WebSocket signaling at `/ws` (default: 0.0.0.0:3004)
//! - HTTP server for health endpoints and `/metrics` (default: 0.0.0.0:8081)
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment
//! 2. Initialize Prometheus metrics recorder
//! 3. Choose the presence backend (Redis when `REDIS_URL` is set)
//! 4. Build the media engine, router registry and session services
//! 5. Start the engine event loop and the audit logger
//! 6. Start health HTTP server (liveness, readiness, metrics)
//! 7. Start the signaling server and mark the service ready
//! 8. Wait for shutdown signal

#![warn(clippy::pedantic)]
#![allow(clippy::too_many_lines)] // main.rs orchestrates startup, naturally longer

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use common::secret::ExposeSecret;
use conference_service::config::Config;
use conference_service::events::EventSink;
use conference_service::gateway::{signaling_router, ConnectionHub, GatewayState};
use conference_service::media::{
    default_media_codecs, spawn_engine_event_loop, LocalMediaEngine, MediaEngine,
    MediaSessionManager, RouterRegistry,
};
use conference_service::observability::{health_router, init_metrics_recorder, HealthState};
use conference_service::presence::{InMemoryPresenceStore, PresenceStore, RedisPresenceStore};
use conference_service::room::{spawn_audit_logger, RoomService};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for in-flight cleanup after the servers stop accepting.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "conference_service=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Conference Service");

    let config = Config::from_env().map_err(|e| {
        error!(error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        signaling_bind_address = %config.signaling_bind_address,
        health_bind_address = %config.health_bind_address,
        rtc_min_port = config.rtc_min_port,
        rtc_max_port = config.rtc_max_port,
        announced_ip = %config.announced_ip,
        "Configuration loaded"
    );

    // Must happen before any metrics are recorded
    info!("Initializing Prometheus metrics recorder...");
    let prometheus_handle = init_metrics_recorder().map_err(|e| {
        error!(error = %e, "Failed to install Prometheus metrics recorder");
        e
    })?;
    info!("Prometheus metrics recorder initialized");

    let health_state = Arc::new(HealthState::new());
    let shutdown_token = CancellationToken::new();

    let presence: Arc<dyn PresenceStore> = if let Some(redis_url) = &config.redis_url {
        info!("Connecting to Redis presence backend...");
        let store = RedisPresenceStore::connect(redis_url.expose_secret())
            .await
            .map_err(|e| {
                error!(error = %e, "Failed to connect to Redis");
                e
            })?;
        info!("Redis presence backend connected");
        Arc::new(store)
    } else {
        warn!("REDIS_URL not set, presence is kept in process memory");
        Arc::new(InMemoryPresenceStore::new())
    };

    let engine = Arc::new(LocalMediaEngine::new());
    let engine_events = engine.subscribe();
    let engine: Arc<dyn MediaEngine> = engine;
    let routers = Arc::new(RouterRegistry::new(
        Arc::clone(&engine),
        default_media_codecs(),
    ));

    let hub = Arc::new(ConnectionHub::new());
    let sink: Arc<dyn EventSink> = Arc::clone(&hub) as Arc<dyn EventSink>;

    let media = Arc::new(MediaSessionManager::new(
        engine,
        Arc::clone(&routers),
        Arc::clone(&presence),
        Arc::clone(&sink),
        config.transport_options(),
    ));
    let room = Arc::new(
        RoomService::new(presence, Arc::clone(&media), sink)
            .with_max_chat_length(config.max_chat_length),
    );

    let engine_task = spawn_engine_event_loop(
        Arc::clone(&media),
        engine_events,
        shutdown_token.child_token(),
    );
    let audit_task = spawn_audit_logger(room.subscribe_audit(), shutdown_token.child_token());

    // Health HTTP server must start, or startup fails
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.health_bind_address, "Invalid health bind address");
        format!("Invalid health bind address: {e}")
    })?;

    let metrics_router = Router::new().route(
        "/metrics",
        axum::routing::get(move || {
            let handle = prometheus_handle.clone();
            async move { handle.render() }
        }),
    );
    let health_app = health_router(Arc::clone(&health_state))
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http());

    // Bind BEFORE spawning to fail fast on bind errors
    let health_listener = tokio::net::TcpListener::bind(health_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %health_addr, "Failed to bind health server");
            format!("Failed to bind health server to {health_addr}: {e}")
        })?;
    info!(addr = %health_addr, "Health server bound successfully");

    let health_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        let server = axum::serve(health_listener, health_app).with_graceful_shutdown(async move {
            health_shutdown_token.cancelled().await;
            info!("Health server shutting down");
        });
        if let Err(e) = server.await {
            error!(error = %e, "Health server failed");
        }
    });
    info!(addr = %health_addr, "Health server started");

    let signaling_addr: SocketAddr = config.signaling_bind_address.parse().map_err(|e| {
        error!(error = %e, addr = %config.signaling_bind_address, "Invalid signaling bind address");
        format!("Invalid signaling bind address: {e}")
    })?;
    let signaling_app = signaling_router(GatewayState {
        room: Arc::clone(&room),
        hub: Arc::clone(&hub),
        outbound_queue_size: config.outbound_queue_size,
    })
    .layer(TraceLayer::new_for_http());

    let signaling_listener = tokio::net::TcpListener::bind(signaling_addr)
        .await
        .map_err(|e| {
            error!(error = %e, addr = %signaling_addr, "Failed to bind signaling server");
            format!("Failed to bind signaling server to {signaling_addr}: {e}")
        })?;
    info!(addr = %signaling_addr, "Signaling server bound successfully");

    let signaling_shutdown_token = shutdown_token.child_token();
    tokio::spawn(async move {
        let server = axum::serve(signaling_listener, signaling_app).with_graceful_shutdown(
            async move {
                signaling_shutdown_token.cancelled().await;
                info!("Signaling server shutting down");
            },
        );
        if let Err(e) = server.await {
            error!(error = %e, "Signaling server failed");
        }
    });

    health_state.set_ready();
    info!(addr = %signaling_addr, "Conference Service ready");

    shutdown_signal().await;
    info!("Shutdown signal received, beginning graceful shutdown...");

    health_state.set_not_ready();
    shutdown_token.cancel();

    tokio::time::sleep(SHUTDOWN_GRACE).await;

    if let Err(e) = engine_task.await {
        warn!(error = %e, "Engine event loop ended abnormally");
    }
    match audit_task.await {
        Ok(logged) => info!(entries = logged, "Audit logger stopped"),
        Err(e) => warn!(error = %e, "Audit logger ended abnormally"),
    }

    info!(
        open_connections = hub.connection_count(),
        active_routers = routers.active_count(),
        "Conference Service shutdown complete"
    );

    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        #[expect(
            clippy::expect_used,
            reason = "Without a signal handler the process cannot shut down cleanly"
        )]
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        #[expect(
            clippy::expect_used,
            reason = "Without a signal handler the process cannot shut down cleanly"
        )]
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
