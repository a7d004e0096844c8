//! Application state.

use batchgate_processor::{PrometheusMetrics, SchedulerState};
use tokio::sync::watch;

/// Shared state of the HTTP endpoints.
#[derive(Clone)]
pub struct AppState {
    pub metrics: PrometheusMetrics,
    pub scheduler: watch::Receiver<SchedulerState>,
}

impl AppState {
    pub fn new(metrics: PrometheusMetrics, scheduler: watch::Receiver<SchedulerState>) -> Self {
        Self { metrics, scheduler }
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        *self.scheduler.borrow()
    }
}
