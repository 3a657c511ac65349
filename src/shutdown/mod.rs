//! Graceful shutdown of the board service.
//!
//! 1. Stop the hub so new sockets are turned away
//! 2. Ask every connected client to go away (close code 1001)
//! 3. Signal background tasks to stop
//! 4. Wait for sessions to run their own cleanup, then evict stragglers

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{FuturesUnordered, StreamExt};
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::broadcast::{BroadcastHub, EvictionCause};
use crate::websocket::{OutboundMessage, CLOSE_GOING_AWAY};

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for clients to be notified (default: 5 seconds)
    pub client_notification_timeout: Duration,
    /// Per-client send timeout for the close frame (default: 2 seconds)
    pub per_client_timeout: Duration,
    /// Time to wait for sessions to close on their own (default: 10 seconds)
    pub drain_timeout: Duration,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            client_notification_timeout: Duration::from_secs(5),
            per_client_timeout: Duration::from_secs(2),
            drain_timeout: Duration::from_secs(10),
        }
    }
}

/// Handles graceful shutdown of the board service
pub struct GracefulShutdown {
    hub: Arc<BroadcastHub>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(hub: Arc<BroadcastHub>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self::with_config(hub, shutdown_tx, ShutdownConfig::default())
    }

    pub fn with_config(
        hub: Arc<BroadcastHub>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            hub,
            shutdown_tx,
            config,
        }
    }

    /// Execute graceful shutdown sequence
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.hub.registry().connection_count())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Stopping hub");
        self.hub.stop();

        tracing::info!("Phase 2: Notifying clients");
        result.clients_notified = self.notify_clients(reason).await;

        tracing::info!("Phase 3: Signaling background tasks to stop");
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 4: Waiting for connections to close");
        result.connections_closed = self.wait_for_connections_to_close().await;
        result.connections_evicted = self.evict_remaining();

        result.duration = start.elapsed();
        result.success = self.hub.registry().connection_count() == 0;

        tracing::info!(
            clients_notified = result.clients_notified,
            connections_closed = result.connections_closed,
            connections_evicted = result.connections_evicted,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    /// Queue a going-away close frame on every connection
    async fn notify_clients(&self, reason: &str) -> usize {
        let connections = self.hub.registry().all_connections();
        let total = connections.len();

        if total == 0 {
            return 0;
        }

        tracing::info!(
            total_connections = total,
            "Sending close frames to clients"
        );

        let per_client = self.config.per_client_timeout;
        let mut futures: FuturesUnordered<_> = connections
            .into_iter()
            .map(|conn| {
                let message = OutboundMessage::close(CLOSE_GOING_AWAY, reason);
                async move {
                    match timeout(per_client, conn.send(message)).await {
                        Ok(Ok(())) => true,
                        Ok(Err(_)) | Err(_) => {
                            tracing::debug!(
                                connection_id = %conn.id,
                                "Failed to send close frame"
                            );
                            false
                        }
                    }
                }
            })
            .collect();

        let mut notified = 0;
        let notify_future = async {
            while let Some(success) = futures.next().await {
                if success {
                    notified += 1;
                }
            }
        };

        let _ = timeout(self.config.client_notification_timeout, notify_future).await;

        tracing::info!(notified = notified, total = total, "Close frames sent");

        notified
    }

    /// Wait for sessions to finish their own cleanup
    async fn wait_for_connections_to_close(&self) -> usize {
        let registry = self.hub.registry();
        let initial = registry.connection_count();
        if initial == 0 {
            return 0;
        }

        let wait_future = async {
            while registry.connection_count() > 0 {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        };

        let _ = timeout(self.config.drain_timeout, wait_future).await;

        initial.saturating_sub(registry.connection_count())
    }

    /// Force out any connection whose session did not close in time
    fn evict_remaining(&self) -> usize {
        let remaining = self.hub.registry().all_connections();
        if remaining.is_empty() {
            return 0;
        }

        tracing::warn!(
            remaining_connections = remaining.len(),
            "Some connections did not close gracefully, evicting"
        );

        remaining
            .iter()
            .filter(|conn| self.hub.evict(conn, EvictionCause::Shutdown))
            .count()
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether every connection was released
    pub success: bool,
    /// Number of clients that were sent a close frame
    pub clients_notified: usize,
    /// Number of connections whose sessions closed on their own
    pub connections_closed: usize,
    /// Number of connections evicted after the drain timeout
    pub connections_evicted: usize,
    /// Total time taken for shutdown
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::HubConfig;
    use crate::connection_manager::{ConnectionHandle, ConnectionRegistry};
    use tokio::sync::mpsc;

    fn hub() -> Arc<BroadcastHub> {
        let hub = Arc::new(BroadcastHub::new(
            Arc::new(ConnectionRegistry::new()),
            HubConfig::default(),
        ));
        hub.start();
        hub
    }

    fn fast_config() -> ShutdownConfig {
        ShutdownConfig {
            client_notification_timeout: Duration::from_millis(200),
            per_client_timeout: Duration::from_millis(50),
            drain_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_shutdown_no_connections() {
        let hub = hub();
        let (tx, _) = broadcast::channel(1);
        let shutdown = GracefulShutdown::new(hub.clone(), tx);

        let result = shutdown.execute("test shutdown").await;

        assert!(result.success);
        assert_eq!(result.clients_notified, 0);
        assert_eq!(result.connections_closed, 0);
        assert!(!hub.is_running());
    }

    #[tokio::test]
    async fn test_shutdown_closes_and_evicts() {
        let hub = hub();
        let (tx, mut rx) = mpsc::channel(8);
        let handle = Arc::new(ConnectionHandle::new(1, "user1".to_string(), tx));
        hub.registry().admit(handle.clone()).unwrap();

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let shutdown = GracefulShutdown::with_config(hub.clone(), shutdown_tx, fast_config());
        let result = shutdown.execute("maintenance").await;

        assert_eq!(result.clients_notified, 1);
        assert_eq!(result.connections_evicted, 1);
        assert!(result.success);
        assert!(handle.is_evicted());
        assert!(shutdown_rx.try_recv().is_ok());

        // Snapshot first, then the close frame
        rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            OutboundMessage::Close { code, reason } => {
                assert_eq!(code, CLOSE_GOING_AWAY);
                assert_eq!(reason, "maintenance");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_shutdown_config_defaults() {
        let config = ShutdownConfig::default();
        assert_eq!(config.client_notification_timeout, Duration::from_secs(5));
        assert_eq!(config.drain_timeout, Duration::from_secs(10));
    }
}
