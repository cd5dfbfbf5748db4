//! Shared state for API handlers.

use crate::config::ConfigStore;
use crate::lifecycle::ModelLifecycleManager;
use crate::services::Transcriber;
use crate::session::SessionCoordinator;
use std::sync::Arc;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub session: Arc<SessionCoordinator>,
    pub models: ModelLifecycleManager,
    pub transcriber: Arc<dyn Transcriber>,
    /// Persists tier changes made through the API
    pub config_store: Arc<dyn ConfigStore>,
    /// API key hash for authentication (SHA-256 hex)
    pub api_key_hash: Option<String>,
}

impl ApiState {
    pub fn new(
        session: Arc<SessionCoordinator>,
        models: ModelLifecycleManager,
        transcriber: Arc<dyn Transcriber>,
        config_store: Arc<dyn ConfigStore>,
        api_key_hash: Option<String>,
    ) -> Self {
        Self {
            session,
            models,
            transcriber,
            config_store,
            api_key_hash,
        }
    }
}
