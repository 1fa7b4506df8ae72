//! Shared application state for the control server.

use std::sync::Arc;

use orchestrator::app::Orchestrator;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    pub orch: Arc<Orchestrator>,
}

impl AppState {
    pub fn new(orch: Orchestrator) -> Self {
        Self {
            orch: Arc::new(orch),
        }
    }
}
