//! Live board connections: admission control, presence and cursors.

mod cursor;
mod registry;
mod stats;
mod types;

pub use cursor::CursorStore;
pub use registry::ConnectionRegistry;
pub use stats::ConnectionStats;
pub use types::{AdmissionError, BoardId, BoardSnapshot, ConnectionHandle, ConnectionLimits};
