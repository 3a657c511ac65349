use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::connection_manager::{AdmissionError, BoardId, ConnectionHandle};
use crate::server::AppState;

use super::message::{
    OutboundMessage, CLOSE_AUTH_FAILED, CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION,
};
use super::session::{CloseReason, Session, SessionError};

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler for `/ws/{board_id}`
///
/// Authentication failures still upgrade so the client receives a 4001 close
/// frame it can act on, rather than an opaque HTTP error.
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_token = query.token.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(board_id): Path<BoardId>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let authenticated = match extract_token(&query, &headers) {
        Some(token) => state
            .jwt_validator
            .validate(&token)
            .map(|claims| claims.user_id().to_string())
            .map_err(|e| {
                tracing::warn!(error = %e, "JWT validation failed");
                "Invalid token"
            }),
        None => Err("Missing authentication token"),
    };

    ws.on_upgrade(move |socket| async move {
        match authenticated {
            Ok(user_id) => handle_socket(socket, state, board_id, user_id).await,
            Err(reason) => close_socket(socket, close_frame(CLOSE_AUTH_FAILED, reason)).await,
        }
    })
}

/// Extract token from query parameter or Authorization header
fn extract_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(ref token) = query.token {
        return Some(token.clone());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn close_frame(code: u16, reason: impl Into<String>) -> CloseFrame {
    let reason: String = reason.into();
    CloseFrame {
        code,
        reason: reason.into(),
    }
}

/// Close frame for a client that admission control turned away
fn rejection_close(err: &AdmissionError) -> CloseFrame {
    close_frame(CLOSE_POLICY_VIOLATION, err.to_string())
}

async fn close_socket(mut socket: WebSocket, frame: CloseFrame) {
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Handle an authenticated board socket until it closes
#[tracing::instrument(
    name = "ws.connection",
    skip(socket, state),
    fields(user_id = %user_id)
)]
async fn handle_socket(socket: WebSocket, state: AppState, board_id: BoardId, user_id: String) {
    if !state.hub.is_running() {
        close_socket(socket, close_frame(CLOSE_GOING_AWAY, "Server is shutting down")).await;
        return;
    }

    let buffer = state.settings.websocket.channel_buffer_size.max(1);
    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(buffer);
    let handle = Arc::new(ConnectionHandle::new(board_id, user_id, tx));
    let session = Arc::new(Session::new(state.hub.clone(), handle.clone()));

    if let Err(e) = session.admit().await {
        close_socket(socket, rejection_close(&e)).await;
        return;
    }

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Writer: drains the outbound queue into the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let frame = match message {
                OutboundMessage::Close { code, reason } => {
                    let frame = close_frame(code, reason);
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    return Ok(());
                }
                OutboundMessage::Ping => Message::Ping(Bytes::new()),
                other => match other.into_text() {
                    Some(Ok(text)) => Message::Text(text),
                    Some(Err(e)) => {
                        tracing::error!(error = %e, "Failed to serialize message");
                        continue;
                    }
                    None => continue,
                },
            };

            if let Err(e) = ws_sender.send(frame).await {
                return Err(SessionError::Transport(e.to_string()));
            }
        }
        Ok(())
    });

    // Reader: one frame at a time, in arrival order
    let reader_session = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(Message::Text(text)) => {
                    reader_session.handle_text(text.as_str()).await;
                }
                Ok(Message::Binary(_)) => {
                    reader_session.handle_binary().await;
                }
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => reader_session.touch(),
                Ok(Message::Close(_)) => {
                    tracing::debug!(connection_id = %reader_session.handle().id, "Received close frame");
                    break;
                }
                Err(e) => return Err(SessionError::Transport(e.to_string())),
            }
        }
        Ok(())
    });

    let outcome = tokio::select! {
        result = &mut send_task => match result {
            Ok(Ok(())) if !state.hub.is_running() => Ok(CloseReason::ServerShutdown),
            Ok(Ok(())) => Ok(CloseReason::ClientClosed),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(SessionError::TaskFailed(e.to_string())),
        },
        result = &mut recv_task => match result {
            Ok(Ok(())) => Ok(CloseReason::ClientClosed),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(SessionError::TaskFailed(e.to_string())),
        },
        _ = handle.evicted() => Ok(CloseReason::Evicted),
    };

    send_task.abort();
    recv_task.abort();

    let reason = match outcome {
        Ok(reason) => reason,
        Err(e) => {
            tracing::warn!(connection_id = %handle.id, error = %e, "Session ended with error");
            e.close_reason()
        }
    };

    session.close(reason).await;
}
