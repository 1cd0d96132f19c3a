//! Health check endpoints.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{Value, json};
use tracing::warn;

use crate::AppState;
use crate::error::ApiError;
use trainbuilder_db::JobStore;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/ready", get(ready))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn ready(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    state.service.store().ping().await.map_err(|e| {
        warn!(error = %e, "Job store not ready");
        ApiError::Unavailable(format!("job store unavailable: {}", e))
    })?;
    Ok(Json(json!({ "status": "ready" })))
}
