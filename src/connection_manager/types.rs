//! Connection handle and related types

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::config::WebSocketConfig;
use crate::websocket::OutboundMessage;

/// Primary key of a board in the persistence layer
pub type BoardId = i64;

/// Handle for a single board socket
///
/// Bound to exactly one `(board_id, user_id)` pair for its whole life. The
/// session owns it; the registry and hub only hold clones of the `Arc`.
pub struct ConnectionHandle {
    pub id: Uuid,
    pub board_id: BoardId,
    pub user_id: String,
    sender: mpsc::Sender<OutboundMessage>,
    pub connected_at: DateTime<Utc>,
    /// Last inbound activity (Unix seconds)
    last_activity: AtomicI64,
    evicted: AtomicBool,
    eviction: Notify,
}

impl ConnectionHandle {
    pub fn new(board_id: BoardId, user_id: String, sender: mpsc::Sender<OutboundMessage>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            board_id,
            user_id,
            sender,
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp()),
            evicted: AtomicBool::new(false),
            eviction: Notify::new(),
        }
    }

    pub fn update_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    #[cfg(test)]
    pub(crate) fn set_last_activity(&self, at: DateTime<Utc>) {
        self.last_activity.store(at.timestamp(), Ordering::Relaxed);
    }

    /// Queue an event for this connection, waiting for queue space
    pub async fn send(
        &self,
        message: OutboundMessage,
    ) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        self.sender.send(message).await
    }

    /// Queue an event without waiting. Returns false if the queue is full or closed.
    pub fn try_send(&self, message: OutboundMessage) -> bool {
        self.sender.try_send(message).is_ok()
    }

    /// Mark the connection as evicted and wake its session.
    ///
    /// Returns true only for the first call.
    pub fn evict(&self) -> bool {
        let first = !self.evicted.swap(true, Ordering::AcqRel);
        if first {
            // notify_one stores a permit, so a session that starts waiting later still wakes
            self.eviction.notify_one();
        }
        first
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.load(Ordering::Acquire)
    }

    /// Resolves once the connection has been evicted
    pub async fn evicted(&self) {
        if self.is_evicted() {
            return;
        }
        self.eviction.notified().await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("board_id", &self.board_id)
            .field("user_id", &self.user_id)
            .field("connected_at", &self.connected_at)
            .field("evicted", &self.is_evicted())
            .finish()
    }
}

/// Error returned when admission control rejects a connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("Maximum connections per user ({max}) exceeded")]
    UserLimit { user_id: String, max: usize },

    #[error("Maximum connections per board ({max}) exceeded")]
    BoardLimit { board_id: BoardId, max: usize },
}

impl AdmissionError {
    /// Label used for metrics and logs
    pub fn reason(&self) -> &'static str {
        match self {
            Self::UserLimit { .. } => "user_limit",
            Self::BoardLimit { .. } => "board_limit",
        }
    }
}

/// Limits for connection management
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionLimits {
    pub max_connections_per_board: usize,
    pub max_connections_per_user: usize,
}

impl Default for ConnectionLimits {
    fn default() -> Self {
        Self {
            max_connections_per_board: 50,
            max_connections_per_user: 5,
        }
    }
}

impl From<&WebSocketConfig> for ConnectionLimits {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            max_connections_per_board: config.max_connections_per_board,
            max_connections_per_user: config.max_connections_per_user,
        }
    }
}

/// Presence state handed to a freshly admitted connection
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BoardSnapshot {
    pub active_users: Vec<String>,
    pub cursors: HashMap<String, Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_evict_is_reported_once() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(1, "user1".to_string(), tx);

        assert!(!handle.is_evicted());
        assert!(handle.evict());
        assert!(!handle.evict());
        assert!(handle.is_evicted());

        // Already evicted: resolves immediately
        tokio::time::timeout(std::time::Duration::from_millis(100), handle.evicted())
            .await
            .expect("evicted() should resolve");
    }

    #[tokio::test]
    async fn test_eviction_wakes_waiter() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = std::sync::Arc::new(ConnectionHandle::new(1, "user1".to_string(), tx));

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.evicted().await })
        };

        tokio::task::yield_now().await;
        handle.evict();

        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .expect("waiter should not panic");
    }

    #[test]
    fn test_admission_error_messages() {
        let user = AdmissionError::UserLimit {
            user_id: "u".to_string(),
            max: 5,
        };
        let board = AdmissionError::BoardLimit { board_id: 7, max: 50 };

        assert_eq!(user.to_string(), "Maximum connections per user (5) exceeded");
        assert_eq!(board.to_string(), "Maximum connections per board (50) exceeded");
        assert_eq!(user.reason(), "user_limit");
        assert_eq!(board.reason(), "board_limit");
    }

    #[test]
    fn test_try_send_reports_full_queue() {
        let (tx, _rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new(1, "user1".to_string(), tx);

        assert!(handle.try_send(OutboundMessage::Ping));
        assert!(!handle.try_send(OutboundMessage::Ping));
    }
}
