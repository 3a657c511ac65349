//! Health check and statistics endpoints.

use std::collections::HashMap;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::broadcast::HubStatsSnapshot;
use crate::connection_manager::BoardId;
use crate::server::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub accepting_connections: bool,
    pub connections: ConnectionHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
    pub unique_users: usize,
    pub active_boards: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: ConnectionStatsResponse,
    pub broadcast: HubStatsSnapshot,
}

#[derive(Debug, Serialize)]
pub struct ConnectionStatsResponse {
    pub total_connections: usize,
    pub unique_users: usize,
    pub active_boards: usize,
    pub boards: HashMap<BoardId, usize>,
    pub max_connections_per_board: usize,
    pub max_connections_per_user: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.registry.stats();
    let running = state.hub.is_running();

    Json(HealthResponse {
        status: if running { "healthy" } else { "shutting_down" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        accepting_connections: running,
        connections: ConnectionHealthResponse {
            total: stats.total_connections,
            unique_users: stats.unique_users,
            active_boards: stats.active_boards,
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let stats = state.registry.stats();
    let limits = state.registry.limits();

    Json(StatsResponse {
        connections: ConnectionStatsResponse {
            total_connections: stats.total_connections,
            unique_users: stats.unique_users,
            active_boards: stats.active_boards,
            boards: stats.boards,
            max_connections_per_board: limits.max_connections_per_board,
            max_connections_per_user: limits.max_connections_per_user,
        },
        broadcast: state.hub.stats(),
    })
}
