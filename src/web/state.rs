use chrono::{DateTime, Utc};

use crate::assistant::Assistant;
use crate::config::AppConfig;

/// Shared application state for the web server
pub struct AppState {
    pub config: AppConfig,
    pub assistant: Assistant,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    pub fn new(config: AppConfig, assistant: Assistant) -> Self {
        Self {
            config,
            assistant,
            startup_time: Utc::now(),
        }
    }
}
