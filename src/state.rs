//! Shared state handed to every backend handler.

use crate::{config::BackendConfig, services::storage_service::StorageService};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub storage: StorageService,
    pub config: Arc<BackendConfig>,
}

impl AppState {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            storage: StorageService::new(config.images_root.clone()),
            config: Arc::new(config),
        }
    }
}
