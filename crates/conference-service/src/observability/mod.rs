//! Observability for the conference service.
//!
//! # Privacy by Default
//!
//! Instrumentation uses `#[instrument(skip_all)]` with allow-listed fields
//! (meeting, user, connection and resource ids). Chat content and secrets are
//! never logged or used as metric labels.
//!
//! # Metrics
//!
//! | Metric | Type | Labels | Purpose |
//! |--------|------|--------|---------|
//! | `cs_connections_active` | Gauge | none | Attached signaling connections |
//! | `cs_meetings_active` | Gauge | none | Meetings with a live router |
//! | `cs_request_latency_seconds` | Histogram | `request_type` | Request handling latency |
//! | `cs_request_errors_total` | Counter | `request_type`, `code` | Rejected requests |
//! | `cs_router_creations_total` | Counter | `status` | Router acquisition outcomes |
//! | `cs_events_dropped_total` | Counter | `event` | Events lost to full outbound queues |
//! | `cs_engine_operations_total` | Counter | `operation`, `status` | Media engine calls |

pub mod health;
pub mod metrics;

pub use health::{health_router, HealthState};
pub use metrics::init_metrics_recorder;
