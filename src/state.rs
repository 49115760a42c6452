use std::sync::Arc;

use crate::config::AppConfig;
use crate::store::MemoryStore;

/// Shared application context, built once at startup and injected into every
/// handler. Per-request identity lives in the `AuthUser` extractor, never in
/// process-global state.
#[derive(Clone)]
pub struct AppState {
    pub store: MemoryStore,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(store: MemoryStore, config: AppConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }
}
