//! Per-connection session lifecycle.
//!
//! `Connecting -> Admitted -> Active -> Closing -> Closed`, with `Rejected`
//! as the terminal branch when admission fails. Only `Active` sessions
//! process frames, and the cleanup behind `Closing` runs exactly once
//! whichever side ends the connection.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use crate::broadcast::{BroadcastHub, DeliveryResult};
use crate::connection_manager::{AdmissionError, ConnectionHandle};
use crate::metrics::{ConnectionMetrics, WsMessageMetrics};

use super::message::{parse, InboundMessage, InvalidMessage, OutboundMessage, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Connecting = 0,
    Admitted = 1,
    Active = 2,
    Closing = 3,
    Closed = 4,
    Rejected = 5,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Connecting,
            1 => Self::Admitted,
            2 => Self::Active,
            3 => Self::Closing,
            4 => Self::Closed,
            _ => Self::Rejected,
        }
    }
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Client sent a close frame or the stream ended
    ClientClosed,
    /// Socket read or write failed
    TransportError,
    /// Server dropped the connection after a failed send or missed heartbeat
    Evicted,
    /// Server is shutting down
    ServerShutdown,
    /// One of the session's tasks panicked
    TaskFailed,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientClosed => "client_closed",
            Self::TransportError => "transport_error",
            Self::Evicted => "evicted",
            Self::ServerShutdown => "server_shutdown",
            Self::TaskFailed => "task_failed",
        }
    }
}

/// Failure that ends one session without touching any other
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("WebSocket transport error: {0}")]
    Transport(String),

    #[error("Session task failed: {0}")]
    TaskFailed(String),
}

impl SessionError {
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::Transport(_) => CloseReason::TransportError,
            Self::TaskFailed(_) => CloseReason::TaskFailed,
        }
    }
}

/// What happened to one inbound frame
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    /// Cursor recorded and shared with the board
    Cursor(DeliveryResult),
    /// Liveness frame, nothing broadcast
    Ping,
    /// Frame rejected; an `error` event went back to this client only
    Invalid(InvalidMessage),
    /// Session is not active
    Ignored,
}

pub struct Session {
    hub: Arc<BroadcastHub>,
    handle: Arc<ConnectionHandle>,
    state: AtomicU8,
    opened_at: Instant,
}

impl Session {
    pub fn new(hub: Arc<BroadcastHub>, handle: Arc<ConnectionHandle>) -> Self {
        Self {
            hub,
            handle,
            state: AtomicU8::new(SessionState::Connecting as u8),
            opened_at: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn handle(&self) -> &Arc<ConnectionHandle> {
        &self.handle
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Run admission control and announce the new connection.
    ///
    /// On success the `connection_established` snapshot is already first in
    /// the outbound queue and the session is `Active`.
    pub async fn admit(&self) -> Result<(), AdmissionError> {
        if self.state() != SessionState::Connecting {
            return Ok(());
        }

        match self.hub.notify_join(self.handle.clone()).await {
            Ok(snapshot) => {
                self.transition(SessionState::Connecting, SessionState::Admitted);
                self.transition(SessionState::Admitted, SessionState::Active);
                ConnectionMetrics::record_opened();

                tracing::info!(
                    connection_id = %self.handle.id,
                    board_id = self.handle.board_id,
                    user_id = %self.handle.user_id,
                    active_users = snapshot.active_users.len(),
                    "Board session established"
                );
                Ok(())
            }
            Err(e) => {
                self.transition(SessionState::Connecting, SessionState::Rejected);
                Err(e)
            }
        }
    }

    /// Refresh liveness without processing a frame
    pub fn touch(&self) {
        self.handle.update_activity();
    }

    /// Process one text frame
    #[tracing::instrument(
        name = "ws.frame",
        skip(self, raw),
        fields(connection_id = %self.handle.id, board_id = self.handle.board_id)
    )]
    pub async fn handle_text(&self, raw: &str) -> FrameOutcome {
        if self.state() != SessionState::Active {
            return FrameOutcome::Ignored;
        }
        self.handle.update_activity();

        match parse(raw) {
            Ok(message) => {
                WsMessageMetrics::record_received(message.kind());
                match message {
                    InboundMessage::CursorMove(cursor) => {
                        FrameOutcome::Cursor(self.hub.publish_cursor(&self.handle, cursor).await)
                    }
                    InboundMessage::Ping => FrameOutcome::Ping,
                }
            }
            Err(e) => self.reject(e).await,
        }
    }

    /// Binary frames are never accepted
    pub async fn handle_binary(&self) -> FrameOutcome {
        if self.state() != SessionState::Active {
            return FrameOutcome::Ignored;
        }
        self.handle.update_activity();
        self.reject(InvalidMessage::Binary).await
    }

    async fn reject(&self, err: InvalidMessage) -> FrameOutcome {
        tracing::debug!(
            connection_id = %self.handle.id,
            code = err.code(),
            error = %err,
            "Rejected inbound frame"
        );
        WsMessageMetrics::record_invalid(err.code());

        let event = OutboundMessage::Event(ServerEvent::invalid_message(&err));
        // A failed send evicts this connection, which ends the session
        let _ = self.hub.send_to(&self.handle, event).await;

        FrameOutcome::Invalid(err)
    }

    /// Leave the board. Only the first call does anything.
    pub async fn close(&self, reason: CloseReason) -> bool {
        let began = self.transition(SessionState::Active, SessionState::Closing)
            || self.transition(SessionState::Admitted, SessionState::Closing);
        if !began {
            return false;
        }

        self.hub.notify_leave(&self.handle).await;
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);

        let duration = self.opened_at.elapsed().as_secs_f64();
        ConnectionMetrics::record_closed(reason.as_str(), duration);

        tracing::info!(
            connection_id = %self.handle.id,
            board_id = self.handle.board_id,
            user_id = %self.handle.user_id,
            reason = reason.as_str(),
            duration_secs = duration,
            "Board session closed"
        );
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let state = self.state();
        if !matches!(
            state,
            SessionState::Admitted | SessionState::Active | SessionState::Closing
        ) {
            return;
        }

        // Dropped without a close: release the slot now, announce if a runtime is around
        self.hub.registry().remove(&self.handle);
        self.state
            .store(SessionState::Closed as u8, Ordering::Release);
        tracing::warn!(
            connection_id = %self.handle.id,
            state = ?state,
            "Board session dropped without closing"
        );

        if state == SessionState::Closing {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let hub = self.hub.clone();
            let handle = self.handle.clone();
            runtime.spawn(async move {
                hub.notify_leave(&handle).await;
            });
        }
    }
}
