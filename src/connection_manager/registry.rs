//! Per-board connection sets, per-user counters and admission control.
//!
//! Lock order: a `user_counts` shard, then a `boards` shard, then a cursor
//! store shard. Paths that hold more than one guard take them in that order
//! and no guard is held across an `.await`.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use uuid::Uuid;

use crate::websocket::{OutboundMessage, ServerEvent};

use super::{
    AdmissionError, BoardId, BoardSnapshot, ConnectionHandle, ConnectionLimits, ConnectionStats,
    CursorStore,
};

type BoardConnections = HashMap<Uuid, Arc<ConnectionHandle>>;

/// Manages all live board connections
pub struct ConnectionRegistry {
    /// board_id -> connection_id -> ConnectionHandle
    boards: DashMap<BoardId, BoardConnections>,
    /// user_id -> live connections across all boards
    user_counts: DashMap<String, usize>,
    cursors: CursorStore,
    limits: ConnectionLimits,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_limits(ConnectionLimits::default())
    }

    pub fn with_limits(limits: ConnectionLimits) -> Self {
        Self {
            boards: DashMap::new(),
            user_counts: DashMap::new(),
            cursors: CursorStore::new(),
            limits,
        }
    }

    pub fn limits(&self) -> ConnectionLimits {
        self.limits
    }

    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    /// Admit a connection if both the user and the board have room.
    ///
    /// The check and the registration happen under the same guards, so
    /// concurrent admits cannot overshoot either limit. On success the
    /// `connection_established` snapshot is queued on the handle before any
    /// other board traffic can reach it.
    pub fn admit(&self, handle: Arc<ConnectionHandle>) -> Result<BoardSnapshot, AdmissionError> {
        let max_per_user = self.limits.max_connections_per_user;

        let mut user_count = match self.user_counts.entry(handle.user_id.clone()) {
            Entry::Occupied(entry) => {
                if *entry.get() >= max_per_user {
                    return Err(AdmissionError::UserLimit {
                        user_id: handle.user_id.clone(),
                        max: max_per_user,
                    });
                }
                entry.into_ref()
            }
            Entry::Vacant(entry) => {
                if max_per_user == 0 {
                    return Err(AdmissionError::UserLimit {
                        user_id: handle.user_id.clone(),
                        max: max_per_user,
                    });
                }
                entry.insert(0)
            }
        };

        match self.insert_on_board(&handle) {
            Ok(snapshot) => {
                *user_count += 1;
                let user_connections = *user_count;
                drop(user_count);

                tracing::info!(
                    connection_id = %handle.id,
                    board_id = handle.board_id,
                    user_id = %handle.user_id,
                    user_connections = user_connections,
                    board_users = snapshot.active_users.len(),
                    "Connection admitted"
                );
                Ok(snapshot)
            }
            Err(e) => {
                let unused = *user_count == 0;
                drop(user_count);
                if unused {
                    self.user_counts
                        .remove_if(&handle.user_id, |_, count| *count == 0);
                }
                Err(e)
            }
        }
    }

    fn insert_on_board(
        &self,
        handle: &Arc<ConnectionHandle>,
    ) -> Result<BoardSnapshot, AdmissionError> {
        let max_per_board = self.limits.max_connections_per_board;
        let board_full = || AdmissionError::BoardLimit {
            board_id: handle.board_id,
            max: max_per_board,
        };

        let mut connections = match self.boards.entry(handle.board_id) {
            Entry::Occupied(entry) => {
                if entry.get().len() >= max_per_board {
                    return Err(board_full());
                }
                entry.into_ref()
            }
            Entry::Vacant(entry) => {
                if max_per_board == 0 {
                    return Err(board_full());
                }
                entry.insert(HashMap::new())
            }
        };

        connections.insert(handle.id, handle.clone());

        let snapshot = BoardSnapshot {
            active_users: distinct_users(connections.values()),
            cursors: self.cursors.get(handle.board_id),
        };

        // Broadcasts collect targets under this guard, so nothing can be
        // queued on the new connection ahead of its snapshot.
        if !handle.try_send(OutboundMessage::Event(ServerEvent::connection_established(
            &snapshot,
        ))) {
            tracing::warn!(
                connection_id = %handle.id,
                board_id = handle.board_id,
                "Failed to queue connection snapshot"
            );
        }

        Ok(snapshot)
    }

    /// Remove a connection. Idempotent: returns true only for the call that removed it.
    pub fn remove(&self, handle: &ConnectionHandle) -> bool {
        let user_count = self.user_counts.get_mut(&handle.user_id);

        let removed = match self.boards.entry(handle.board_id) {
            Entry::Occupied(mut entry) => {
                let removed = entry.get_mut().remove(&handle.id).is_some();

                if removed && !entry.get().values().any(|c| c.user_id == handle.user_id) {
                    self.cursors.clear(handle.board_id, &handle.user_id);
                }

                if entry.get().is_empty() {
                    entry.remove();
                    self.cursors.clear_board(handle.board_id);
                    tracing::debug!(board_id = handle.board_id, "Board has no connections, purged");
                }

                removed
            }
            Entry::Vacant(_) => false,
        };

        if removed {
            if let Some(mut count) = user_count {
                *count = count.saturating_sub(1);
                let drained = *count == 0;
                drop(count);
                if drained {
                    self.user_counts
                        .remove_if(&handle.user_id, |_, count| *count == 0);
                }
            }

            tracing::info!(
                connection_id = %handle.id,
                board_id = handle.board_id,
                user_id = %handle.user_id,
                "Connection removed"
            );
        }

        removed
    }

    /// Record a cursor for a connection that is still registered.
    ///
    /// Returns false if the connection is gone, so a racing eviction cannot
    /// leave a stale cursor behind.
    pub fn update_cursor(&self, handle: &ConnectionHandle, payload: Value) -> bool {
        let Some(connections) = self.boards.get(&handle.board_id) else {
            return false;
        };
        if !connections.contains_key(&handle.id) {
            return false;
        }
        self.cursors
            .update(handle.board_id, &handle.user_id, payload);
        true
    }

    /// Distinct users watching a board, sorted
    pub fn active_users(&self, board_id: BoardId) -> Vec<String> {
        self.boards
            .get(&board_id)
            .map(|connections| distinct_users(connections.values()))
            .unwrap_or_default()
    }

    /// Consistent view of a board's presence
    pub fn snapshot(&self, board_id: BoardId) -> BoardSnapshot {
        match self.boards.get(&board_id) {
            Some(connections) => BoardSnapshot {
                active_users: distinct_users(connections.values()),
                cursors: self.cursors.get(board_id),
            },
            None => BoardSnapshot::default(),
        }
    }

    /// Get all connections watching a board
    pub fn board_connections(&self, board_id: BoardId) -> Vec<Arc<ConnectionHandle>> {
        self.boards
            .get(&board_id)
            .map(|connections| connections.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Get all connections
    pub fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.boards
            .iter()
            .flat_map(|entry| entry.value().values().cloned().collect::<Vec<_>>())
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        self.boards.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn board_connection_count(&self, board_id: BoardId) -> usize {
        self.boards
            .get(&board_id)
            .map(|connections| connections.len())
            .unwrap_or(0)
    }

    pub fn user_connection_count(&self, user_id: &str) -> usize {
        self.user_counts
            .get(user_id)
            .map(|count| *count)
            .unwrap_or(0)
    }

    pub fn board_count(&self) -> usize {
        self.boards.len()
    }

    pub fn has_board(&self, board_id: BoardId) -> bool {
        self.boards.contains_key(&board_id)
    }

    /// Find connections that have been inactive for longer than the timeout
    pub fn find_stale_connections(&self, timeout_secs: u64) -> Vec<Arc<ConnectionHandle>> {
        let now = Utc::now();
        let timeout = chrono::Duration::seconds(timeout_secs as i64);

        self.all_connections()
            .into_iter()
            .filter(|handle| now.signed_duration_since(handle.last_activity()) > timeout)
            .collect()
    }

    /// Get statistics
    pub fn stats(&self) -> ConnectionStats {
        let boards: HashMap<BoardId, usize> = self
            .boards
            .iter()
            .map(|entry| (*entry.key(), entry.value().len()))
            .collect();

        ConnectionStats {
            total_connections: boards.values().sum(),
            unique_users: self.user_counts.len(),
            active_boards: boards.len(),
            boards,
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn distinct_users<'a>(connections: impl Iterator<Item = &'a Arc<ConnectionHandle>>) -> Vec<String> {
    connections
        .map(|c| c.user_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::EventType;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn limits(per_board: usize, per_user: usize) -> ConnectionLimits {
        ConnectionLimits {
            max_connections_per_board: per_board,
            max_connections_per_user: per_user,
        }
    }

    fn connect(
        board_id: BoardId,
        user_id: &str,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(16);
        (
            Arc::new(ConnectionHandle::new(board_id, user_id.to_string(), tx)),
            rx,
        )
    }

    #[test]
    fn test_board_limit_rejects_third_user() {
        let registry = ConnectionRegistry::with_limits(limits(2, 5));
        let (u1, _r1) = connect(1, "U1");
        let (u2, _r2) = connect(1, "U2");
        let (u3, _r3) = connect(1, "U3");

        assert!(registry.admit(u1).is_ok());
        assert!(registry.admit(u2).is_ok());
        let err = registry.admit(u3).unwrap_err();

        assert_eq!(err, AdmissionError::BoardLimit { board_id: 1, max: 2 });
        assert_eq!(registry.board_connection_count(1), 2);
        // The rejected user must not keep a phantom counter entry
        assert_eq!(registry.user_connection_count("U3"), 0);
        assert_eq!(registry.stats().unique_users, 2);
    }

    #[test]
    fn test_user_limit_applies_across_boards() {
        let registry = ConnectionRegistry::with_limits(limits(50, 1));
        let (first, _r1) = connect(1, "U");
        let (second, _r2) = connect(2, "U");

        assert!(registry.admit(first).is_ok());
        let err = registry.admit(second).unwrap_err();

        assert!(matches!(err, AdmissionError::UserLimit { max: 1, .. }));
        assert!(!registry.has_board(2));
        assert_eq!(registry.user_connection_count("U"), 1);
    }

    #[test]
    fn test_zero_limits_reject_everything() {
        let registry = ConnectionRegistry::with_limits(limits(0, 5));
        let (handle, _rx) = connect(1, "U1");
        assert!(matches!(
            registry.admit(handle),
            Err(AdmissionError::BoardLimit { .. })
        ));
        assert_eq!(registry.board_count(), 0);
        assert_eq!(registry.stats().unique_users, 0);

        let registry = ConnectionRegistry::with_limits(limits(5, 0));
        let (handle, _rx) = connect(1, "U1");
        assert!(matches!(
            registry.admit(handle),
            Err(AdmissionError::UserLimit { .. })
        ));
        assert_eq!(registry.board_count(), 0);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = connect(1, "U1");
        let (b, _rb) = connect(1, "U1");
        registry.admit(a.clone()).unwrap();
        registry.admit(b.clone()).unwrap();

        assert!(registry.remove(&a));
        assert!(!registry.remove(&a));
        assert_eq!(registry.user_connection_count("U1"), 1);
        assert_eq!(registry.board_connection_count(1), 1);

        assert!(registry.remove(&b));
        assert!(!registry.remove(&b));
        assert_eq!(registry.user_connection_count("U1"), 0);
        assert_eq!(registry.stats().unique_users, 0);
    }

    #[test]
    fn test_remove_unknown_connection_is_noop() {
        let registry = ConnectionRegistry::new();
        let (admitted, _r1) = connect(1, "U1");
        let (stranger, _r2) = connect(1, "U1");
        registry.admit(admitted).unwrap();

        assert!(!registry.remove(&stranger));
        assert_eq!(registry.user_connection_count("U1"), 1);
    }

    #[test]
    fn test_last_removal_purges_board_and_cursors() {
        let registry = ConnectionRegistry::new();
        let (u1, _r1) = connect(1, "U1");
        let (u2, _r2) = connect(1, "U2");
        registry.admit(u1.clone()).unwrap();
        registry.admit(u2.clone()).unwrap();

        assert!(registry.update_cursor(&u1, json!({"x": 1})));
        assert!(registry.update_cursor(&u2, json!({"x": 2})));

        registry.remove(&u1);
        assert!(registry.has_board(1));
        assert_eq!(registry.cursors().get(1).len(), 1);
        assert!(!registry.cursors().get(1).contains_key("U1"));

        registry.remove(&u2);
        assert!(!registry.has_board(1));
        assert!(!registry.cursors().contains_board(1));
        assert_eq!(registry.board_count(), 0);
    }

    #[test]
    fn test_cursor_kept_while_user_has_another_connection() {
        let registry = ConnectionRegistry::new();
        let (tab1, _r1) = connect(1, "U1");
        let (tab2, _r2) = connect(1, "U1");
        let (other, _r3) = connect(1, "U2");
        registry.admit(tab1.clone()).unwrap();
        registry.admit(tab2.clone()).unwrap();
        registry.admit(other).unwrap();

        registry.update_cursor(&tab1, json!({"x": 3}));
        registry.remove(&tab1);

        assert_eq!(registry.cursors().get(1)["U1"], json!({"x": 3}));
        registry.remove(&tab2);
        assert!(!registry.cursors().get(1).contains_key("U1"));
    }

    #[test]
    fn test_update_cursor_after_removal_is_ignored() {
        let registry = ConnectionRegistry::new();
        let (u1, _r1) = connect(1, "U1");
        let (u2, _r2) = connect(1, "U2");
        registry.admit(u1.clone()).unwrap();
        registry.admit(u2).unwrap();

        registry.remove(&u1);
        assert!(!registry.update_cursor(&u1, json!({"x": 9})));
        assert!(!registry.cursors().get(1).contains_key("U1"));
    }

    #[test]
    fn test_active_users_deduplicated() {
        let registry = ConnectionRegistry::new();
        let (a, _ra) = connect(1, "U2");
        let (b, _rb) = connect(1, "U1");
        let (c, _rc) = connect(1, "U1");
        registry.admit(a).unwrap();
        registry.admit(b).unwrap();
        registry.admit(c).unwrap();

        assert_eq!(registry.active_users(1), vec!["U1".to_string(), "U2".to_string()]);
        assert_eq!(registry.board_connection_count(1), 3);
        assert!(registry.active_users(99).is_empty());
    }

    #[test]
    fn test_admit_queues_snapshot_first() {
        let registry = ConnectionRegistry::new();
        let (u1, _r1) = connect(1, "U1");
        registry.admit(u1.clone()).unwrap();
        registry.update_cursor(&u1, json!({"x": 10, "y": 20}));

        let (u2, mut r2) = connect(1, "U2");
        let snapshot = registry.admit(u2).unwrap();
        assert_eq!(snapshot.active_users, vec!["U1".to_string(), "U2".to_string()]);

        match r2.try_recv().unwrap() {
            OutboundMessage::Event(event) => {
                assert_eq!(event.event_type, EventType::ConnectionEstablished);
                assert_eq!(event.payload["active_users"], json!(["U1", "U2"]));
                assert_eq!(event.payload["cursors"], json!({"U1": {"x": 10, "y": 20}}));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_stats_and_stale_detection() {
        let registry = ConnectionRegistry::new();
        let (fresh, _r1) = connect(1, "U1");
        let (stale, _r2) = connect(2, "U2");
        registry.admit(fresh).unwrap();
        registry.admit(stale.clone()).unwrap();

        stale.set_last_activity(Utc::now() - chrono::Duration::seconds(600));

        let found = registry.find_stale_connections(120);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stale.id);

        let stats = registry.stats();
        assert_eq!(stats.total_connections, 2);
        assert_eq!(stats.unique_users, 2);
        assert_eq!(stats.active_boards, 2);
        assert_eq!(stats.boards[&1], 1);
        assert_eq!(registry.connection_count(), 2);
        assert_eq!(registry.all_connections().len(), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_admit_remove_respects_limits() {
        let registry = Arc::new(ConnectionRegistry::with_limits(limits(3, 2)));
        let mut tasks = Vec::new();

        for worker in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                let user_id = format!("user-{}", worker % 4);
                let mut receivers = Vec::new();
                for round in 0..200 {
                    let board_id = (round % 2) as BoardId;
                    let (tx, rx) = mpsc::channel(4);
                    receivers.push(rx);
                    let handle = Arc::new(ConnectionHandle::new(board_id, user_id.clone(), tx));

                    if registry.admit(handle.clone()).is_ok() {
                        assert!(registry.board_connection_count(board_id) <= 3);
                        assert!(registry.user_connection_count(&user_id) <= 2);
                        tokio::task::yield_now().await;
                        assert!(registry.remove(&handle));
                        assert!(!registry.remove(&handle));
                    }
                    assert!(registry.board_connection_count(board_id) <= 3);
                    assert!(registry.user_connection_count(&user_id) <= 2);
                    receivers.clear();
                }
            }));
        }

        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(registry.connection_count(), 0);
        assert_eq!(registry.board_count(), 0);
        assert_eq!(registry.stats().unique_users, 0);
        assert_eq!(registry.cursors().board_count(), 0);
    }
}
