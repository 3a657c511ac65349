// Shared components
pub mod auth;
pub mod config;
pub mod error;
pub mod metrics;

// Real-time core
pub mod broadcast;
pub mod connection_manager;
pub mod websocket;

// Application layer
pub mod api;
pub mod server;
pub mod triggers;

// Supporting modules
pub mod shutdown;
pub mod tasks;
pub mod telemetry;
