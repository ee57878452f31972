//! Shared application state.

use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::registry::ServingRegistry;

/// Shared application state passed to all handlers.
pub struct AppState {
    pub config: Config,
    pub registry: Arc<ServingRegistry>,
}

impl AppState {
    pub fn new(config: Config, registry: Arc<ServingRegistry>) -> Self {
        Self { config, registry }
    }

    /// Upper bound on one generation, from submission to the last delta.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.generation.request_timeout_secs)
    }
}
