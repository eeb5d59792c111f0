//! Instance CRUD and lifecycle endpoints (§6).

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::AppState;
use crate::error::AppError;
use crate::models::{Instance, InstanceRequest, StatusReport};

pub async fn list_instances(State(state): State<Arc<AppState>>) -> Result<Json<Vec<Instance>>, AppError> {
    Ok(Json(state.instance_manager.list().await.map_err(AppError::Internal)?))
}

pub async fn get_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<Instance>, AppError> {
    state
        .instance_manager
        .get(id)
        .await
        .map_err(AppError::Internal)?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("instance {id} not found")))
}

pub async fn create_instance(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InstanceRequest>,
) -> Result<Response, AppError> {
    let instance = state.instance_manager.create(req).await?;
    Ok((StatusCode::CREATED, Json(instance)).into_response())
}

pub async fn update_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(req): Json<InstanceRequest>,
) -> Result<Json<Instance>, AppError> {
    Ok(Json(state.instance_manager.update(id, req).await?))
}

pub async fn delete_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Response, AppError> {
    if state.instance_manager.delete(id).await? {
        Ok(Json(json!({ "success": true, "message": "instance deleted" })).into_response())
    } else {
        Err(AppError::NotFound(format!("instance {id} not found")))
    }
}

pub async fn start_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<StatusReport>, AppError> {
    Ok(Json(state.instance_manager.start(id).await?))
}

pub async fn stop_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<StatusReport>, AppError> {
    Ok(Json(state.instance_manager.stop(id).await?))
}

pub async fn kill_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<StatusReport>, AppError> {
    Ok(Json(state.instance_manager.kill(id).await?))
}

pub async fn restart_instance(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<StatusReport>, AppError> {
    Ok(Json(state.instance_manager.restart(id).await?))
}

/// Status report enriched with a live resource sample when the child is
/// running (§4.1/§4.6).
pub async fn instance_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<Json<StatusReport>, AppError> {
    let mut report = state.instance_manager.status(id).await?;
    if let Some(pid) = report.pid {
        let working_dir = state.instance_manager.instance_dir(id);
        report.resources = state
            .resource_monitor
            .sample(pid, Some(id), Some(&working_dir))
            .await;
    }
    Ok(Json(report))
}
