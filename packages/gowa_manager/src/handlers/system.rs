//! System status/config/ports/versions/auto-update endpoints (§6).

use std::collections::HashSet;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::AppState;
use crate::error::AppError;
use crate::models::{InstanceStatus, UpdaterStatus, VersionInfo};
use crate::port_allocator::PortAllocator;

#[derive(Serialize)]
pub struct InstanceCounts {
    total: usize,
    running: usize,
    stopped: usize,
}

#[derive(Serialize)]
pub struct PortsSummary {
    allocated: Vec<u16>,
    #[serde(rename = "next_available")]
    next_available: u16,
}

#[derive(Serialize)]
pub struct SystemStatus {
    status: &'static str,
    uptime: u64,
    instances: InstanceCounts,
    ports: PortsSummary,
}

pub async fn system_status(State(state): State<Arc<AppState>>) -> Result<Json<SystemStatus>, AppError> {
    let instances = state.instance_manager.list().await.map_err(AppError::Internal)?;
    let running = instances.iter().filter(|i| i.status == InstanceStatus::Running).count();
    let allocated: Vec<u16> = instances.iter().filter_map(|i| i.port).collect();
    let persisted: HashSet<u16> = allocated.iter().copied().collect();
    let next_available = PortAllocator::next_available(&persisted).await;

    Ok(Json(SystemStatus {
        status: "ok",
        uptime: state.started_at.elapsed().as_secs(),
        instances: InstanceCounts {
            total: instances.len(),
            running,
            stopped: instances.len() - running,
        },
        ports: PortsSummary {
            allocated,
            next_available,
        },
    }))
}

#[derive(Serialize)]
pub struct PortRange {
    min: u16,
    max: u16,
}

#[derive(Serialize)]
pub struct SystemConfig {
    #[serde(rename = "port_range")]
    port_range: PortRange,
    #[serde(rename = "data_directory")]
    data_directory: String,
    #[serde(rename = "binaries_directory")]
    binaries_directory: String,
}

pub async fn system_config(State(state): State<Arc<AppState>>) -> Json<SystemConfig> {
    Json(SystemConfig {
        port_range: PortRange { min: 8000, max: 9000 },
        data_directory: state.paths.data_dir.to_string_lossy().to_string(),
        binaries_directory: state.paths.bin_dir.to_string_lossy().to_string(),
    })
}

pub async fn next_port(State(state): State<Arc<AppState>>) -> Result<Json<serde_json::Value>, AppError> {
    let persisted: HashSet<u16> = state
        .db
        .allocated_ports()
        .await
        .map_err(AppError::Internal)?
        .into_iter()
        .collect();
    let port = PortAllocator::next_available(&persisted).await;
    Ok(Json(json!({ "port": port })))
}

pub async fn port_available(Path(port): Path<u16>) -> Json<serde_json::Value> {
    let available = PortAllocator::is_free(port).await;
    Json(json!({ "port": port, "available": available }))
}

pub async fn versions_installed(State(state): State<Arc<AppState>>) -> Result<Json<Vec<VersionInfo>>, AppError> {
    Ok(Json(state.version_manager.installed().map_err(AppError::Internal)?))
}

#[derive(Deserialize)]
pub struct LimitQuery {
    limit: Option<usize>,
}

pub async fn versions_available(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Result<Json<Vec<VersionInfo>>, AppError> {
    let limit = query.limit.unwrap_or(10);
    Ok(Json(state.version_manager.available(limit).await.map_err(AppError::Internal)?))
}

#[derive(Deserialize)]
pub struct InstallRequest {
    version: String,
}

pub async fn install_version(
    State(state): State<Arc<AppState>>,
    Json(req): Json<InstallRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tag = state
        .version_manager
        .install(&req.version)
        .await
        .map_err(|e| AppError::TransientNetwork(e.to_string()))?;
    Ok(Json(json!({ "success": true, "message": format!("installed {tag}") })))
}

pub async fn remove_version(
    State(state): State<Arc<AppState>>,
    Path(version): Path<String>,
) -> Result<Json<serde_json::Value>, AppError> {
    state.version_manager.remove(&version)?;
    Ok(Json(json!({ "success": true, "message": format!("removed {version}") })))
}

pub async fn version_availability(
    State(state): State<Arc<AppState>>,
    Path(version): Path<String>,
) -> Json<serde_json::Value> {
    match state.version_manager.resolve(&version) {
        Ok(path) => Json(json!({ "version": version, "available": true, "path": path.to_string_lossy() })),
        Err(_) => Json(json!({ "version": version, "available": false, "path": serde_json::Value::Null })),
    }
}

pub async fn versions_usage(State(state): State<Arc<AppState>>) -> Result<Json<std::collections::BTreeMap<String, u64>>, AppError> {
    Ok(Json(state.version_manager.usage().map_err(AppError::Internal)?))
}

#[derive(Deserialize)]
pub struct CleanupRequest {
    #[serde(rename = "keepCount")]
    keep_count: Option<usize>,
}

pub async fn versions_cleanup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CleanupRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let keep = req.keep_count.unwrap_or(3);
    let removed = state.version_manager.cleanup(keep).map_err(AppError::Internal)?;
    Ok(Json(json!({
        "success": true,
        "message": format!("removed {} version(s)", removed.len()),
        "removed": removed,
    })))
}

pub async fn auto_update_status(State(state): State<Arc<AppState>>) -> Json<UpdaterStatus> {
    Json(state.auto_updater.status().await)
}

pub async fn auto_update_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let result = state.auto_updater.run_cycle().await;
    Json(result)
}

pub async fn auto_update_instances(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<crate::models::Instance>>, AppError> {
    Ok(Json(
        state.auto_updater.latest_pinned_instances().await.map_err(AppError::Internal)?,
    ))
}
