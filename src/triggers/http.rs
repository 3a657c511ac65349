use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broadcast::DomainEvent;
use crate::connection_manager::BoardId;
use crate::error::{AppError, Result};
use crate::server::AppState;

/// Response for a published board event
#[derive(Debug, Serialize)]
pub struct PublishEventResponse {
    /// Board the event was published to
    pub board_id: BoardId,
    /// Number of connections the event was queued on
    pub delivered_to: usize,
    /// Number of connections that failed and were evicted
    pub failed: usize,
    /// Timestamp of the operation
    pub timestamp: DateTime<Utc>,
}

/// Publish a committed task change to everyone watching the board
#[tracing::instrument(
    name = "trigger.publish_event",
    skip(state, event),
    fields(event_type = ?event.kind)
)]
pub async fn publish_event(
    State(state): State<AppState>,
    Path(board_id): Path<BoardId>,
    Json(event): Json<DomainEvent>,
) -> Result<Json<PublishEventResponse>> {
    if !event.payload.is_object() {
        return Err(AppError::Validation(
            "payload must be a JSON object".to_string(),
        ));
    }

    let result = state.hub.publish(board_id, event).await;

    Ok(Json(PublishEventResponse {
        board_id,
        delivered_to: result.delivered,
        failed: result.failed,
        timestamp: Utc::now(),
    }))
}
