use crate::metrics::ApiMetrics;
use flowforge_store::TaskQueue;
use std::sync::Arc;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub queue: TaskQueue,
    pub metrics: Arc<ApiMetrics>,
}

impl AppState {
    pub fn new(queue: TaskQueue, metrics: Arc<ApiMetrics>) -> Self {
        AppState { queue, metrics }
    }
}
