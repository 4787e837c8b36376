use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;

use spotguard_common::SNAPSHOT_HISTORY_LIMIT;

use crate::snapshot_engine::SnapshotEngine;
use crate::snapshot_scheduler::SnapshotScheduler;
use crate::standby_manager::StandbyManager;
use crate::status_api::create_cors;

pub struct AppState {
    pub standby: Arc<StandbyManager>,
    pub scheduler: Arc<SnapshotScheduler>,
    pub engine: Arc<SnapshotEngine>,
}

/// Orchestrator admin API.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/standby/status", get(standby_status))
        .route("/standby/active", get(standby_active))
        .route("/standby/primary", post(register_primary))
        .route("/standby/associations/:machine_id", get(association))
        .route("/snapshots", get(list_snapshots))
        .route("/snapshots/:snapshot_id", delete(delete_snapshot))
        .route("/snapshots/jobs", get(list_jobs).post(add_job))
        .route(
            "/snapshots/jobs/:instance_id",
            delete(remove_job).patch(update_job),
        )
        .route("/snapshots/jobs/:instance_id/trigger", post(trigger_job))
        .route("/snapshots/history", get(history))
        .layer(create_cors())
        .with_state(state)
}

fn error(status: StatusCode, msg: impl std::fmt::Display) -> Response {
    (status, Json(json!({ "error": msg.to_string() }))).into_response()
}

async fn root() -> &'static str {
    "SpotGuard Orchestrator Online"
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

// --- Standby ---

async fn standby_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.standby.get_status().await)
}

async fn standby_active(State(state): State<Arc<AppState>>) -> Response {
    match state.standby.get_active_endpoint().await {
        Some(ep) => Json(ep).into_response(),
        None => error(StatusCode::NOT_FOUND, "no active endpoint"),
    }
}

#[derive(Deserialize, Debug)]
struct RegisterPrimaryRequest {
    instance_id: String,
    #[serde(default = "default_true")]
    interruptible: bool,
    owner_id: Option<String>,
}

fn default_true() -> bool {
    true
}

async fn register_primary(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterPrimaryRequest>,
) -> Response {
    match state
        .standby
        .register_primary(&req.instance_id, req.interruptible, req.owner_id.as_deref())
        .await
    {
        Ok(true) => Json(json!({ "registered": true, "instance_id": req.instance_id })).into_response(),
        Ok(false) => error(
            StatusCode::NOT_FOUND,
            format!("instance {} unknown to the marketplace", req.instance_id),
        ),
        Err(e) => error(StatusCode::BAD_GATEWAY, format!("{:#}", e)),
    }
}

async fn association(
    State(state): State<Arc<AppState>>,
    Path(machine_id): Path<String>,
) -> Response {
    match state.standby.associations(&machine_id).await {
        Some(a) => Json(a).into_response(),
        None => error(
            StatusCode::NOT_FOUND,
            format!("no standby association for {}", machine_id),
        ),
    }
}

// --- Snapshots ---

#[derive(Deserialize, Debug, Default)]
struct InstanceFilter {
    instance_id: Option<String>,
    limit: Option<usize>,
}

async fn list_snapshots(
    State(state): State<Arc<AppState>>,
    Query(q): Query<InstanceFilter>,
) -> Response {
    match state.engine.list_snapshots(q.instance_id.as_deref()).await {
        Ok(list) => Json(list).into_response(),
        Err(e) => error(StatusCode::BAD_GATEWAY, format!("{:#}", e)),
    }
}

async fn delete_snapshot(
    State(state): State<Arc<AppState>>,
    Path(snapshot_id): Path<String>,
) -> Response {
    match state.engine.delete_snapshot(&snapshot_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error(StatusCode::NOT_FOUND, format!("snapshot {} not found", snapshot_id)),
        Err(e) => error(StatusCode::BAD_GATEWAY, format!("{:#}", e)),
    }
}

async fn list_jobs(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.scheduler.get_status().await)
}

#[derive(Deserialize, Debug)]
struct AddJobRequest {
    instance_id: String,
    host: String,
    #[serde(default = "default_ssh_port")]
    port: u16,
    #[serde(default = "default_workspace")]
    workspace_path: String,
    interval_minutes: u32,
    #[serde(default = "default_true")]
    enabled: bool,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_workspace() -> String {
    "/workspace".to_string()
}

async fn add_job(State(state): State<Arc<AppState>>, Json(req): Json<AddJobRequest>) -> Response {
    match state
        .scheduler
        .add_instance(
            &req.instance_id,
            &req.host,
            req.port,
            &req.workspace_path,
            req.interval_minutes,
            req.enabled,
        )
        .await
    {
        Ok(job) => (StatusCode::CREATED, Json(job)).into_response(),
        Err(e) => error(StatusCode::BAD_REQUEST, format!("{:#}", e)),
    }
}

#[derive(Deserialize, Debug)]
struct UpdateJobRequest {
    interval_minutes: Option<u32>,
    enabled: Option<bool>,
}

async fn update_job(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Json(req): Json<UpdateJobRequest>,
) -> Response {
    match state
        .scheduler
        .update_instance(&instance_id, req.interval_minutes, req.enabled)
        .await
    {
        Ok(Some(job)) => Json(job).into_response(),
        Ok(None) => error(StatusCode::NOT_FOUND, format!("no snapshot job for {}", instance_id)),
        Err(e) => error(StatusCode::BAD_REQUEST, format!("{:#}", e)),
    }
}

async fn remove_job(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
) -> Response {
    match state.scheduler.remove_instance(&instance_id).await {
        Ok(true) => StatusCode::NO_CONTENT.into_response(),
        Ok(false) => error(StatusCode::NOT_FOUND, format!("no snapshot job for {}", instance_id)),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)),
    }
}

#[derive(Deserialize, Debug, Default)]
struct TriggerQuery {
    #[serde(default)]
    force: bool,
}

async fn trigger_job(
    State(state): State<Arc<AppState>>,
    Path(instance_id): Path<String>,
    Query(q): Query<TriggerQuery>,
) -> Response {
    match state.scheduler.trigger_snapshot(&instance_id, q.force).await {
        Ok(Some(result)) => Json(result).into_response(),
        Ok(None) => error(StatusCode::NOT_FOUND, format!("no snapshot job for {}", instance_id)),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, format!("{:#}", e)),
    }
}

async fn history(
    State(state): State<Arc<AppState>>,
    Query(q): Query<InstanceFilter>,
) -> impl IntoResponse {
    let limit = q.limit.unwrap_or(SNAPSHOT_HISTORY_LIMIT);
    Json(
        state
            .scheduler
            .get_history(q.instance_id.as_deref(), limit)
            .await,
    )
}
