use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::Utf8Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::time::timeout;
use uuid::Uuid;

use crate::config::WebSocketConfig;
use crate::connection_manager::{
    AdmissionError, BoardId, BoardSnapshot, ConnectionHandle, ConnectionRegistry,
};
use crate::metrics::{BroadcastMetrics, ConnectionMetrics};
use crate::websocket::{OutboundMessage, ServerEvent};

use super::DomainEvent;

/// Maximum number of concurrent sends within one fan-out
const MAX_CONCURRENT_SENDS: usize = 100;

/// Why a send to one connection failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SendFailure {
    #[error("connection closed")]
    Closed,
    #[error("send timed out after {0:?}")]
    TimedOut(Duration),
}

/// Why the server dropped a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCause {
    SendFailed,
    SendTimedOut,
    Stale,
    Shutdown,
}

impl EvictionCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SendFailed => "send_failed",
            Self::SendTimedOut => "send_timed_out",
            Self::Stale => "stale",
            Self::Shutdown => "shutdown",
        }
    }
}

impl From<SendFailure> for EvictionCause {
    fn from(failure: SendFailure) -> Self {
        match failure {
            SendFailure::Closed => Self::SendFailed,
            SendFailure::TimedOut(_) => Self::SendTimedOut,
        }
    }
}

/// Outcome of one fan-out. Informational only: failures are handled inside the hub.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeliveryResult {
    /// Connections the event was queued on
    pub delivered: usize,
    /// Connections that failed and were evicted
    pub failed: usize,
}

#[derive(Debug, Default)]
struct HubStats {
    events_broadcast: AtomicU64,
    total_delivered: AtomicU64,
    total_failed: AtomicU64,
    total_evicted: AtomicU64,
}

/// Snapshot of hub statistics
#[derive(Debug, Clone, Serialize)]
pub struct HubStatsSnapshot {
    pub events_broadcast: u64,
    pub total_delivered: u64,
    pub total_failed: u64,
    pub total_evicted: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct HubConfig {
    /// A send that takes longer than this evicts the connection
    pub send_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&WebSocketConfig> for HubConfig {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            send_timeout: config.send_timeout(),
        }
    }
}

/// Fans events out to every connection watching a board.
///
/// One hub is owned by the application state and shared with every session.
/// A send failure only ever affects the failing connection: it is evicted
/// and delivery carries on for the rest.
pub struct BroadcastHub {
    registry: Arc<ConnectionRegistry>,
    config: HubConfig,
    stats: HubStats,
    running: AtomicBool,
}

impl BroadcastHub {
    pub fn new(registry: Arc<ConnectionRegistry>, config: HubConfig) -> Self {
        Self {
            registry,
            config,
            stats: HubStats::default(),
            running: AtomicBool::new(false),
        }
    }

    /// Begin accepting sessions
    pub fn start(&self) {
        if !self.running.swap(true, Ordering::AcqRel) {
            tracing::info!(
                send_timeout_ms = self.config.send_timeout.as_millis() as u64,
                "Broadcast hub started"
            );
        }
    }

    /// Stop accepting sessions. Live connections are left to the shutdown sequence.
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!("Broadcast hub stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> HubConfig {
        self.config
    }

    pub fn stats(&self) -> HubStatsSnapshot {
        HubStatsSnapshot {
            events_broadcast: self.stats.events_broadcast.load(Ordering::Relaxed),
            total_delivered: self.stats.total_delivered.load(Ordering::Relaxed),
            total_failed: self.stats.total_failed.load(Ordering::Relaxed),
            total_evicted: self.stats.total_evicted.load(Ordering::Relaxed),
        }
    }

    /// Deliver an event to every connection on the board except `exclude`
    #[tracing::instrument(
        name = "hub.broadcast",
        skip(self, event),
        fields(event_type = event.event_type.as_str())
    )]
    pub async fn broadcast(
        &self,
        board_id: BoardId,
        event: ServerEvent,
        exclude: Option<Uuid>,
    ) -> DeliveryResult {
        self.stats.events_broadcast.fetch_add(1, Ordering::Relaxed);
        BroadcastMetrics::record_event(event.event_type.as_str());

        let targets: Vec<Arc<ConnectionHandle>> = self
            .registry
            .board_connections(board_id)
            .into_iter()
            .filter(|conn| Some(conn.id) != exclude)
            .collect();

        if targets.is_empty() {
            return DeliveryResult::default();
        }

        // Serialize once for every target
        let text: Utf8Bytes = match serde_json::to_string(&event) {
            Ok(text) => text.into(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize board event");
                return DeliveryResult::default();
            }
        };

        let start = Instant::now();
        let mut result = DeliveryResult::default();

        for batch in targets.chunks(MAX_CONCURRENT_SENDS) {
            let mut sends: FuturesUnordered<_> = batch
                .iter()
                .map(|conn| {
                    let message = OutboundMessage::Preserialized(text.clone());
                    async move { (conn, self.try_deliver(conn, message).await) }
                })
                .collect();

            while let Some((conn, outcome)) = sends.next().await {
                match outcome {
                    Ok(()) => result.delivered += 1,
                    Err(failure) => {
                        result.failed += 1;
                        tracing::debug!(
                            connection_id = %conn.id,
                            error = %failure,
                            "Broadcast send failed"
                        );
                        self.evict(conn, failure.into());
                    }
                }
            }
        }

        self.stats
            .total_delivered
            .fetch_add(result.delivered as u64, Ordering::Relaxed);
        self.stats
            .total_failed
            .fetch_add(result.failed as u64, Ordering::Relaxed);
        BroadcastMetrics::record_delivered(result.delivered as u64);
        BroadcastMetrics::record_failed(result.failed as u64);
        BroadcastMetrics::record_latency(start.elapsed().as_secs_f64());

        tracing::debug!(
            board_id = board_id,
            delivered = result.delivered,
            failed = result.failed,
            "Broadcast completed"
        );

        result
    }

    /// Queue a message on one connection, evicting it if the send fails
    pub async fn send_to(
        &self,
        conn: &ConnectionHandle,
        message: OutboundMessage,
    ) -> Result<(), SendFailure> {
        let outcome = self.try_deliver(conn, message).await;
        if let Err(failure) = outcome {
            self.evict(conn, failure.into());
        }
        outcome
    }

    async fn try_deliver(
        &self,
        conn: &ConnectionHandle,
        message: OutboundMessage,
    ) -> Result<(), SendFailure> {
        match timeout(self.config.send_timeout, conn.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SendFailure::Closed),
            Err(_) => Err(SendFailure::TimedOut(self.config.send_timeout)),
        }
    }

    /// Drop a connection from the registry and wake its session.
    ///
    /// Presence is announced by the session's own close path, never here,
    /// so a connection produces exactly one `user_left`.
    pub fn evict(&self, conn: &ConnectionHandle, cause: EvictionCause) -> bool {
        let removed = self.registry.remove(conn);
        let signalled = conn.evict();

        if removed || signalled {
            self.stats.total_evicted.fetch_add(1, Ordering::Relaxed);
            BroadcastMetrics::record_eviction(cause.as_str());
            tracing::warn!(
                connection_id = %conn.id,
                board_id = conn.board_id,
                user_id = %conn.user_id,
                cause = cause.as_str(),
                "Connection evicted"
            );
        }

        removed
    }

    /// Admit a connection and announce it to the rest of the board
    pub async fn notify_join(
        &self,
        handle: Arc<ConnectionHandle>,
    ) -> Result<BoardSnapshot, AdmissionError> {
        let snapshot = match self.registry.admit(handle.clone()) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                ConnectionMetrics::record_rejected(e.reason());
                tracing::warn!(
                    board_id = handle.board_id,
                    user_id = %handle.user_id,
                    reason = e.reason(),
                    "Connection rejected"
                );
                return Err(e);
            }
        };

        let event = ServerEvent::user_joined(&handle.user_id, &snapshot.active_users);
        self.broadcast(handle.board_id, event, Some(handle.id)).await;

        Ok(snapshot)
    }

    /// Remove a connection and announce the departure.
    ///
    /// Returns whether this call performed the removal (false if an eviction
    /// got there first).
    pub async fn notify_leave(&self, handle: &ConnectionHandle) -> bool {
        let removed = self.registry.remove(handle);
        let active_users = self.registry.active_users(handle.board_id);

        let event = ServerEvent::user_left(&handle.user_id, &active_users);
        self.broadcast(handle.board_id, event, Some(handle.id)).await;

        removed
    }

    /// Record a cursor and share it with the rest of the board
    pub async fn publish_cursor(&self, handle: &ConnectionHandle, cursor: Value) -> DeliveryResult {
        if !self.registry.update_cursor(handle, cursor.clone()) {
            tracing::debug!(
                connection_id = %handle.id,
                "Ignoring cursor from a connection that is no longer registered"
            );
            return DeliveryResult::default();
        }

        let event = ServerEvent::cursor_move(&handle.user_id, cursor);
        self.broadcast(handle.board_id, event, Some(handle.id)).await
    }

    /// Entry point for task CRUD handlers after a successful commit
    pub async fn publish(&self, board_id: BoardId, event: DomainEvent) -> DeliveryResult {
        self.broadcast(board_id, event.into_server_event(), None).await
    }
}
