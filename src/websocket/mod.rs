mod handler;
mod message;
mod session;

pub use handler::{ws_handler, WsQuery};
pub use message::{
    parse, EventType, InboundMessage, InvalidMessage, OutboundMessage, ServerEvent,
    CLOSE_AUTH_FAILED, CLOSE_GOING_AWAY, CLOSE_POLICY_VIOLATION,
};
pub use session::{CloseReason, FrameOutcome, Session, SessionError, SessionState};
