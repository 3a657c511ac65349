//! Board presence lookup.

use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::connection_manager::{BoardId, BoardSnapshot};
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct PresenceResponse {
    pub board_id: BoardId,
    pub connections: usize,
    #[serde(flatten)]
    pub snapshot: BoardSnapshot,
}

/// GET /api/v1/boards/{board_id}/presence
///
/// Boards nobody is watching return an empty snapshot rather than 404.
pub async fn board_presence(
    State(state): State<AppState>,
    Path(board_id): Path<BoardId>,
) -> Json<PresenceResponse> {
    Json(PresenceResponse {
        board_id,
        connections: state.registry.board_connection_count(board_id),
        snapshot: state.registry.snapshot(board_id),
    })
}
