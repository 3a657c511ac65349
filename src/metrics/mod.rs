//! Prometheus metrics for the real-time board service.
//!
//! - Connection metrics (active connections, boards, admissions, session lifetime)
//! - Fan-out metrics (events by type, deliveries, failures, evictions)
//! - Inbound frame metrics
//! - Heartbeat metrics

mod helpers;

pub use helpers::{encode_metrics, BroadcastMetrics, ConnectionMetrics, HeartbeatMetrics, WsMessageMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "taskboard";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Live board connections
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Number of live board connections"
    ).unwrap();

    /// Boards with at least one live connection
    pub static ref BOARDS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_boards_active", METRIC_PREFIX),
        "Number of boards with at least one live connection"
    ).unwrap();

    /// Users with at least one live connection
    pub static ref USERS_CONNECTED: IntGauge = register_int_gauge!(
        format!("{}_users_connected", METRIC_PREFIX),
        "Number of unique connected users"
    ).unwrap();

    /// Admission rejections by reason
    pub static ref ADMISSIONS_REJECTED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_admissions_rejected_total", METRIC_PREFIX),
        "Connections rejected by admission control",
        &["reason"]
    ).unwrap();

    /// Sessions opened
    pub static ref SESSIONS_OPENED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_sessions_opened_total", METRIC_PREFIX),
        "Total board sessions admitted"
    ).unwrap();

    /// Sessions closed by cause
    pub static ref SESSIONS_CLOSED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_sessions_closed_total", METRIC_PREFIX),
        "Total board sessions closed",
        &["cause"]
    ).unwrap();

    /// Session lifetime
    pub static ref SESSION_DURATION: Histogram = register_histogram!(
        format!("{}_session_duration_seconds", METRIC_PREFIX),
        "Board session duration in seconds",
        vec![1.0, 10.0, 60.0, 300.0, 900.0, 3600.0, 14400.0]
    ).unwrap();

    // ============================================================================
    // Fan-out Metrics
    // ============================================================================

    /// Events broadcast by type
    pub static ref EVENTS_BROADCAST_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_broadcast_total", METRIC_PREFIX),
        "Total events broadcast to boards",
        &["type"]
    ).unwrap();

    /// Successful per-connection deliveries
    pub static ref DELIVERIES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_deliveries_total", METRIC_PREFIX),
        "Total events queued to connections"
    ).unwrap();

    /// Failed per-connection deliveries
    pub static ref DELIVERY_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_delivery_failures_total", METRIC_PREFIX),
        "Total failed or timed-out sends"
    ).unwrap();

    /// Evictions by cause
    pub static ref EVICTIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_evictions_total", METRIC_PREFIX),
        "Connections evicted by the server",
        &["cause"]
    ).unwrap();

    /// Fan-out latency for a whole broadcast
    pub static ref BROADCAST_LATENCY: Histogram = register_histogram!(
        format!("{}_broadcast_latency_seconds", METRIC_PREFIX),
        "Time to queue one event on every target connection",
        vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    // ============================================================================
    // Inbound Frame Metrics
    // ============================================================================

    /// Inbound frames by type
    pub static ref WS_MESSAGES_RECEIVED: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_messages_received_total", METRIC_PREFIX),
        "Inbound frames by type",
        &["type"]
    ).unwrap();

    /// Rejected inbound frames by error code
    pub static ref WS_INVALID_MESSAGES: IntCounterVec = register_int_counter_vec!(
        format!("{}_ws_invalid_messages_total", METRIC_PREFIX),
        "Inbound frames rejected by validation",
        &["code"]
    ).unwrap();

    // ============================================================================
    // Heartbeat Metrics
    // ============================================================================

    /// Heartbeat round duration
    pub static ref HEARTBEAT_DURATION_MS: Histogram = register_histogram!(
        format!("{}_heartbeat_duration_ms", METRIC_PREFIX),
        "Heartbeat round duration in milliseconds",
        vec![1.0, 5.0, 10.0, 50.0, 100.0, 500.0, 1000.0, 5000.0]
    ).unwrap();
}
