//! Ephemeral last-known cursor per (board, user)

use std::collections::HashMap;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;

use super::BoardId;

/// Last cursor payload per user, grouped by board.
///
/// Writes are last-write-wins per user. The registry is responsible for only
/// writing cursors of users that are connected to the board and for clearing
/// them on disconnect.
#[derive(Debug, Default)]
pub struct CursorStore {
    boards: DashMap<BoardId, HashMap<String, Value>>,
}

impl CursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert the user's cursor on a board
    pub fn update(&self, board_id: BoardId, user_id: &str, payload: Value) {
        self.boards
            .entry(board_id)
            .or_default()
            .insert(user_id.to_string(), payload);
    }

    /// All known cursors on a board
    pub fn get(&self, board_id: BoardId) -> HashMap<String, Value> {
        self.boards
            .get(&board_id)
            .map(|cursors| cursors.clone())
            .unwrap_or_default()
    }

    /// Forget one user's cursor on a board
    pub fn clear(&self, board_id: BoardId, user_id: &str) {
        if let Entry::Occupied(mut entry) = self.boards.entry(board_id) {
            entry.get_mut().remove(user_id);
            if entry.get().is_empty() {
                entry.remove();
            }
        }
    }

    /// Forget every cursor on a board
    pub fn clear_board(&self, board_id: BoardId) {
        self.boards.remove(&board_id);
    }

    pub fn contains_board(&self, board_id: BoardId) -> bool {
        self.boards.contains_key(&board_id)
    }

    /// Number of boards with at least one cursor
    pub fn board_count(&self) -> usize {
        self.boards.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_returns_latest_per_user() {
        let store = CursorStore::new();
        store.update(1, "U1", json!({"x": 1, "y": 1}));
        store.update(1, "U2", json!({"x": 5, "y": 5}));
        store.update(1, "U1", json!({"x": 10, "y": 20}));

        let cursors = store.get(1);
        assert_eq!(cursors.len(), 2);
        assert_eq!(cursors["U1"], json!({"x": 10, "y": 20}));
        assert_eq!(cursors["U2"], json!({"x": 5, "y": 5}));
    }

    #[test]
    fn test_boards_are_independent() {
        let store = CursorStore::new();
        store.update(1, "U1", json!({"x": 1}));
        store.update(2, "U1", json!({"x": 2}));

        assert_eq!(store.get(1)["U1"], json!({"x": 1}));
        assert_eq!(store.get(2)["U1"], json!({"x": 2}));
        assert!(store.get(3).is_empty());
    }

    #[test]
    fn test_clear_drops_empty_board() {
        let store = CursorStore::new();
        store.update(1, "U1", json!({"x": 1}));
        store.update(1, "U2", json!({"x": 2}));

        store.clear(1, "U1");
        assert!(store.contains_board(1));
        assert!(!store.get(1).contains_key("U1"));

        store.clear(1, "U2");
        assert!(!store.contains_board(1));

        // Clearing unknown entries is a no-op
        store.clear(1, "U2");
        store.clear(42, "nobody");
        assert_eq!(store.board_count(), 0);
    }

    #[test]
    fn test_clear_board() {
        let store = CursorStore::new();
        store.update(1, "U1", json!({}));
        store.update(1, "U2", json!({}));
        store.clear_board(1);
        assert!(store.get(1).is_empty());
        assert_eq!(store.board_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_updates_from_distinct_users() {
        let store = std::sync::Arc::new(CursorStore::new());
        let mut tasks = Vec::new();

        for user in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let user_id = format!("user-{}", user);
                for step in 0..100 {
                    store.update(1, &user_id, json!({"x": step}));
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let cursors = store.get(1);
        assert_eq!(cursors.len(), 8);
        for (_, cursor) in cursors {
            assert_eq!(cursor, json!({"x": 99}));
        }
    }
}
