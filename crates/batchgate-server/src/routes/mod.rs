//! HTTP routes.

pub mod health;
pub mod metrics;

use crate::AppState;
use axum::Router;

/// Build the router for the metrics listener.
pub fn router(state: AppState) -> Router {
    Router::new()
        .merge(metrics::router())
        .merge(health::router())
        .with_state(state)
}
