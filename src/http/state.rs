use std::sync::Arc;

use crate::client::Client;
use crate::config::AppConfig;

/// Shared state handed to every route.
#[derive(Clone)]
pub struct AppState {
    pub client: Client,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(client: Client, config: AppConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
        }
    }

    pub fn base_url(&self) -> String {
        self.config.http.base_url()
    }
}
