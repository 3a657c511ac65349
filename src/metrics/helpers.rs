//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use crate::connection_manager::ConnectionStats;

use super::{
    ADMISSIONS_REJECTED_TOTAL, BOARDS_ACTIVE, BROADCAST_LATENCY, CONNECTIONS_ACTIVE,
    DELIVERIES_TOTAL, DELIVERY_FAILURES_TOTAL, EVENTS_BROADCAST_TOTAL, EVICTIONS_TOTAL,
    HEARTBEAT_DURATION_MS, SESSIONS_CLOSED_TOTAL, SESSIONS_OPENED_TOTAL, SESSION_DURATION,
    USERS_CONNECTED, WS_INVALID_MESSAGES, WS_MESSAGES_RECEIVED,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording connection lifecycle metrics
pub struct ConnectionMetrics;

impl ConnectionMetrics {
    pub fn record_opened() {
        SESSIONS_OPENED_TOTAL.inc();
    }

    pub fn record_closed(cause: &str, duration_secs: f64) {
        SESSIONS_CLOSED_TOTAL.with_label_values(&[cause]).inc();
        SESSION_DURATION.observe(duration_secs);
    }

    pub fn record_rejected(reason: &str) {
        ADMISSIONS_REJECTED_TOTAL.with_label_values(&[reason]).inc();
    }

    /// Refresh gauges from a registry snapshot
    pub fn update_from_stats(stats: &ConnectionStats) {
        CONNECTIONS_ACTIVE.set(stats.total_connections as i64);
        BOARDS_ACTIVE.set(stats.active_boards as i64);
        USERS_CONNECTED.set(stats.unique_users as i64);
    }
}

/// Helper struct for recording fan-out metrics
pub struct BroadcastMetrics;

impl BroadcastMetrics {
    pub fn record_event(event_type: &str) {
        EVENTS_BROADCAST_TOTAL.with_label_values(&[event_type]).inc();
    }

    pub fn record_delivered(count: u64) {
        DELIVERIES_TOTAL.inc_by(count);
    }

    pub fn record_failed(count: u64) {
        DELIVERY_FAILURES_TOTAL.inc_by(count);
    }

    pub fn record_eviction(cause: &str) {
        EVICTIONS_TOTAL.with_label_values(&[cause]).inc();
    }

    pub fn record_latency(seconds: f64) {
        BROADCAST_LATENCY.observe(seconds);
    }
}

/// Helper struct for recording inbound frame metrics
pub struct WsMessageMetrics;

impl WsMessageMetrics {
    pub fn record_received(message_type: &str) {
        WS_MESSAGES_RECEIVED.with_label_values(&[message_type]).inc();
    }

    pub fn record_invalid(code: &str) {
        WS_INVALID_MESSAGES.with_label_values(&[code]).inc();
    }
}

/// Helper struct for heartbeat metrics
pub struct HeartbeatMetrics;

impl HeartbeatMetrics {
    pub fn record_duration_ms(ms: u64) {
        HEARTBEAT_DURATION_MS.observe(ms as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_metrics() {
        BroadcastMetrics::record_event("task_created");
        WsMessageMetrics::record_invalid("INVALID_MESSAGE");

        let output = encode_metrics().unwrap();
        assert!(output.contains("taskboard_events_broadcast_total"));
        assert!(output.contains("taskboard_ws_invalid_messages_total"));
    }
}
