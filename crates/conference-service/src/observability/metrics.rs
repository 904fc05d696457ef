//! Metrics for the conference service.
//!
//! All metrics follow Prometheus naming conventions:
//! - `cs_` prefix for the conference service
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Cardinality
//!
//! Labels are bounded:
//! - `request_type`: signaling request types (~15 values)
//! - `code`: wire error codes (9 values)
//! - `event`: server event names (8 values)
//! - `operation`: engine primitives (~8 values)
//! - `status`: success, error, rejected
//!
//! Meeting, user and connection ids are never used as labels.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::time::Duration;

/// Install the Prometheus recorder and return the handle that renders
/// `/metrics`.
///
/// Must be called before any metric is recorded. Request latency buckets
/// target a p99 under 100ms for signaling requests.
///
/// # Errors
///
/// Returns an error if a recorder is already installed.
pub fn init_metrics_recorder() -> Result<PrometheusHandle, String> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Prefix("cs_request".to_string()),
            &[
                0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.000, 2.500,
            ],
        )
        .map_err(|e| format!("Failed to set request latency buckets: {e}"))?
        .install_recorder()
        .map_err(|e| format!("Failed to install Prometheus metrics recorder: {e}"))
}

// ============================================================================
// Gauges
// ============================================================================

/// Set the number of attached signaling connections.
///
/// Metric: `cs_connections_active`
pub fn set_connections_active(count: u64) {
    // u64 to f64 conversion is exact below 2^53
    #[allow(clippy::cast_precision_loss)]
    gauge!("cs_connections_active").set(count as f64);
}

/// Set the number of meetings with a live router.
///
/// Metric: `cs_meetings_active`
pub fn set_meetings_active(count: u64) {
    #[allow(clippy::cast_precision_loss)]
    gauge!("cs_meetings_active").set(count as f64);
}

// ============================================================================
// Signaling
// ============================================================================

/// Record how long one signaling request took to handle.
///
/// Metric: `cs_request_latency_seconds`
/// Labels: `request_type`
pub fn record_request(request_type: &'static str, duration: Duration) {
    histogram!("cs_request_latency_seconds", "request_type" => request_type)
        .record(duration.as_secs_f64());
}

/// Record a rejected signaling request.
///
/// Metric: `cs_request_errors_total`
/// Labels: `request_type`, `code`
pub fn record_request_error(request_type: &'static str, code: &'static str) {
    counter!(
        "cs_request_errors_total",
        "request_type" => request_type,
        "code" => code
    )
    .increment(1);
}

/// Record an event dropped because a recipient's outbound queue was full or
/// closed.
///
/// Metric: `cs_events_dropped_total`
/// Labels: `event`
///
/// A steady non-zero rate means clients are not draining their sockets.
pub fn record_event_dropped(event: &'static str) {
    counter!("cs_events_dropped_total", "event" => event).increment(1);
}

// ============================================================================
// Media
// ============================================================================

/// Record a router acquisition outcome.
///
/// Metric: `cs_router_creations_total`
/// Labels: `status` (success, error, rejected)
pub fn record_router_creation(status: &'static str) {
    counter!("cs_router_creations_total", "status" => status).increment(1);
}

/// Record the outcome of one media engine call.
///
/// Metric: `cs_engine_operations_total`
/// Labels: `operation`, `status`
pub fn record_engine_operation(operation: &'static str, status: &'static str) {
    counter!(
        "cs_engine_operations_total",
        "operation" => operation,
        "status" => status
    )
    .increment(1);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    #[test]
    fn test_recording_without_recorder_is_noop() {
        set_connections_active(3);
        set_meetings_active(1);
        record_request("join-room", Duration::from_millis(4));
        record_request_error("consume", "NOT_FOUND");
        record_event_dropped("chat-message");
        record_router_creation("success");
        record_engine_operation("produce", "error");
    }

    #[test]
    fn test_all_metrics_are_emitted_with_expected_names() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            set_connections_active(2);
            set_meetings_active(1);
            record_request("join-room", Duration::from_millis(12));
            record_request_error("consume", "CANNOT_CONSUME");
            record_event_dropped("new-producer");
            record_router_creation("success");
            record_engine_operation("create_transport", "success");
        });

        let mut names: Vec<String> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, _)| key.key().name().to_string())
            .collect();
        names.sort();

        assert_eq!(
            names,
            vec![
                "cs_connections_active",
                "cs_engine_operations_total",
                "cs_events_dropped_total",
                "cs_meetings_active",
                "cs_request_errors_total",
                "cs_request_latency_seconds",
                "cs_router_creations_total",
            ]
        );
    }

    #[test]
    fn test_counters_accumulate_per_label_set() {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();

        metrics::with_local_recorder(&recorder, || {
            record_request_error("produce", "NOT_FOUND");
            record_request_error("produce", "NOT_FOUND");
            record_request_error("produce", "BAD_REQUEST");
        });

        let counts: Vec<(String, u64)> = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter_map(|(key, _, _, value)| match value {
                DebugValue::Counter(count) => {
                    let code = key
                        .key()
                        .labels()
                        .find(|label| label.key() == "code")
                        .map(|label| label.value().to_string())?;
                    Some((code, count))
                }
                _ => None,
            })
            .collect();

        assert!(counts.contains(&("NOT_FOUND".to_string(), 2)));
        assert!(counts.contains(&("BAD_REQUEST".to_string(), 1)));
    }
}
