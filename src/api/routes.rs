use axum::{
    middleware,
    routing::{get, post},
    Router,
};

use crate::server::{api_key_auth, AppState};
use crate::triggers::publish_event;

use super::health::{health, stats};
use super::metrics::prometheus_metrics;
use super::presence::board_presence;

pub fn api_routes(state: AppState) -> Router<AppState> {
    // Event publishing is for trusted backends only
    let protected = Router::new()
        .route("/boards/{board_id}/events", post(publish_event))
        .route_layer(middleware::from_fn_with_state(state, api_key_auth));

    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        .nest(
            "/api/v1",
            Router::new()
                .route("/boards/{board_id}/presence", get(board_presence))
                .merge(protected),
        )
}
