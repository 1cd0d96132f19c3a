//! Application state.

use std::sync::Arc;
use trainbuilder_scheduler::PipelineService;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<PipelineService>,
}

impl AppState {
    pub fn new(service: Arc<PipelineService>) -> Self {
        Self { service }
    }
}
