use std::sync::Arc;
use std::time::Duration;

use crate::config::AppConfig;
use crate::registry::BackendRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: Arc<BackendRegistry>,
}

impl AppState {
    pub fn new(config: AppConfig, registry: BackendRegistry) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
        }
    }

    pub fn default_deadline(&self) -> Duration {
        Duration::from_millis(self.config.request_timeout_ms)
    }
}
