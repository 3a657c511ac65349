use std::sync::Arc;
use std::time::Instant;

use crate::auth::JwtValidator;
use crate::broadcast::{BroadcastHub, HubConfig};
use crate::config::Settings;
use crate::connection_manager::{ConnectionLimits, ConnectionRegistry};
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub jwt_validator: Arc<JwtValidator>,
    pub registry: Arc<ConnectionRegistry>,
    pub hub: Arc<BroadcastHub>,
    pub start_time: Instant,
}

impl AppState {
    /// Build the shared state. The hub starts stopped; call `hub.start()` once serving.
    pub fn new(settings: Settings) -> Result<Self, AppError> {
        let jwt_validator = Arc::new(JwtValidator::new(&settings.jwt)?);
        let registry = Arc::new(ConnectionRegistry::with_limits(ConnectionLimits::from(
            &settings.websocket,
        )));
        let hub = Arc::new(BroadcastHub::new(
            registry.clone(),
            HubConfig::from(&settings.websocket),
        ));

        Ok(Self {
            settings: Arc::new(settings),
            jwt_validator,
            registry,
            hub,
            start_time: Instant::now(),
        })
    }
}
