use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::sync::broadcast;

use crate::broadcast::{BroadcastHub, EvictionCause};
use crate::config::WebSocketConfig;
use crate::metrics::{ConnectionMetrics, HeartbeatMetrics};
use crate::websocket::OutboundMessage;

/// Maximum concurrent heartbeat sends to avoid overwhelming the system
const MAX_CONCURRENT_HEARTBEATS: usize = 1000;

/// Background task for heartbeat and stale connection cleanup
pub struct HeartbeatTask {
    config: WebSocketConfig,
    hub: Arc<BroadcastHub>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        config: WebSocketConfig,
        hub: Arc<BroadcastHub>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            hub,
            shutdown,
        }
    }

    /// Run the heartbeat and cleanup loops until shutdown
    pub async fn run(mut self) {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval.max(1));
        let cleanup_interval = Duration::from_secs(self.config.cleanup_interval.max(1));
        let connection_timeout = self.config.connection_timeout;

        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        let mut cleanup_timer = tokio::time::interval(cleanup_interval);

        // Skip immediate first tick
        heartbeat_timer.tick().await;
        cleanup_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval,
            cleanup_interval_secs = self.config.cleanup_interval,
            connection_timeout_secs = connection_timeout,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_heartbeats().await;
                }
                _ = cleanup_timer.tick() => {
                    self.evict_stale_connections(connection_timeout);
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    /// Ping every connection; the hub evicts any whose send fails or times out
    async fn send_heartbeats(&self) -> usize {
        let connections = self.hub.registry().all_connections();
        let total = connections.len();

        if total == 0 {
            return 0;
        }

        let start = Instant::now();
        let mut failed = 0;

        for batch in connections.chunks(MAX_CONCURRENT_HEARTBEATS) {
            let sends = batch
                .iter()
                .map(|conn| self.hub.send_to(conn, OutboundMessage::Ping));
            failed += join_all(sends)
                .await
                .into_iter()
                .filter(Result::is_err)
                .count();
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        HeartbeatMetrics::record_duration_ms(elapsed_ms);
        ConnectionMetrics::update_from_stats(&self.hub.registry().stats());

        tracing::debug!(
            total = total,
            failed = failed,
            elapsed_ms = elapsed_ms,
            "Heartbeat round completed"
        );

        // Warn if heartbeat round is taking too long
        if elapsed_ms > (self.config.heartbeat_interval * 1000 / 2) {
            tracing::warn!(
                elapsed_ms = elapsed_ms,
                heartbeat_interval_ms = self.config.heartbeat_interval * 1000,
                connections = total,
                "Heartbeat round took more than 50% of interval"
            );
        }

        failed
    }

    /// Evict connections with no inbound activity within `timeout_secs`
    fn evict_stale_connections(&self, timeout_secs: u64) -> usize {
        let stale = self.hub.registry().find_stale_connections(timeout_secs);
        let evicted = stale
            .iter()
            .filter(|conn| self.hub.evict(conn, EvictionCause::Stale))
            .count();

        if evicted > 0 {
            tracing::info!(
                evicted = evicted,
                timeout_secs = timeout_secs,
                "Evicted stale connections"
            );
        }

        evicted
    }
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
            HubConfig {
                send_timeout: Duration::from_millis(100),
            },
        ));
        hub.start();
        hub
    }

    fn connect(
        hub: &BroadcastHub,
        user_id: &str,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(10);
        let handle = Arc::new(ConnectionHandle::new(1, user_id.to_string(), tx));
        hub.registry().admit(handle.clone()).unwrap();
        (handle, rx)
    }

    #[tokio::test]
    async fn test_heartbeat_task_shutdown() {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = HeartbeatTask::new(WebSocketConfig::default(), hub(), shutdown_rx);

        let handle = tokio::spawn(async move {
            task.run().await;
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("Task should complete")
            .expect("Task should not panic");
    }

    #[tokio::test]
    async fn test_heartbeat_sends_ping_to_connections() {
        let config = WebSocketConfig {
            heartbeat_interval: 1,
            connection_timeout: 60,
            cleanup_interval: 60,
            ..Default::default()
        };
        let hub = hub();
        let (_handle, mut rx) = connect(&hub, "user1");
        // Skip the connection snapshot
        rx.recv().await.unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = HeartbeatTask::new(config, hub, shutdown_rx);
        let task_handle = tokio::spawn(async move {
            task.run().await;
        });

        let msg = tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("Should receive heartbeat")
            .expect("Channel should not be closed");
        assert!(matches!(msg, OutboundMessage::Ping));

        shutdown_tx.send(()).unwrap();
        let _ = task_handle.await;
    }

    #[tokio::test]
    async fn test_heartbeat_evicts_dead_connection() {
        let hub = hub();
        let (alive, _alive_rx) = connect(&hub, "alive");
        let (dead, dead_rx) = connect(&hub, "dead");
        drop(dead_rx);

        let (_tx, shutdown_rx) = broadcast::channel(1);
        let task = HeartbeatTask::new(WebSocketConfig::default(), hub.clone(), shutdown_rx);

        assert_eq!(task.send_heartbeats().await, 1);
        assert!(dead.is_evicted());
        assert!(!alive.is_evicted());
        assert_eq!(hub.registry().active_users(1), vec!["alive".to_string()]);
    }

    #[tokio::test]
    async fn test_stale_connections_are_evicted() {
        let hub = hub();
        let (fresh, _fresh_rx) = connect(&hub, "fresh");
        let (stale, _stale_rx) = connect(&hub, "stale");
        stale.set_last_activity(chrono::Utc::now() - chrono::Duration::seconds(600));

        let (_tx, shutdown_rx) = broadcast::channel(1);
        let task = HeartbeatTask::new(WebSocketConfig::default(), hub.clone(), shutdown_rx);

        assert_eq!(task.evict_stale_connections(120), 1);
        assert!(stale.is_evicted());
        assert!(!fresh.is_evicted());
        assert_eq!(hub.registry().user_connection_count("stale"), 0);
    }
}
