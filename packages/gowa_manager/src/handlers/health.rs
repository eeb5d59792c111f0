//! Liveness endpoint (§6).

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde_json::json;

use crate::AppState;

pub async fn health_handler(State(_state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
