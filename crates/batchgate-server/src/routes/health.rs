//! Health check endpoints.

use crate::AppState;
use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use batchgate_processor::SchedulerState;
use serde_json::{Value, json};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Ready only while the scheduler is taking new jobs.
async fn ready(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let scheduler = state.scheduler_state();
    let code = match scheduler {
        SchedulerState::Running => StatusCode::OK,
        _ => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(json!({ "status": scheduler.to_string() })))
}
