//! Connection statistics structures

use serde::Serialize;
use std::collections::HashMap;

use super::BoardId;

/// Connection statistics
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub unique_users: usize,
    pub active_boards: usize,
    /// board_id -> live connections
    pub boards: HashMap<BoardId, usize>,
}
