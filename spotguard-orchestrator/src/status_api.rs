use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use spotguard_common::{FailoverReason, TargetType};

use crate::failover_proxy::FailoverProxy;

pub fn create_cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Local HTTP surface of the failover proxy.
pub fn router(proxy: Arc<FailoverProxy>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/health", get(health))
        .route("/trigger-failover", post(trigger_failover))
        .route("/restore-gpu", post(restore_gpu))
        .layer(create_cors())
        .with_state(proxy)
}

async fn get_status(State(proxy): State<Arc<FailoverProxy>>) -> impl IntoResponse {
    Json(proxy.status().await)
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn trigger_failover(State(proxy): State<Arc<FailoverProxy>>) -> impl IntoResponse {
    switch(proxy, TargetType::Cpu).await
}

async fn restore_gpu(State(proxy): State<Arc<FailoverProxy>>) -> impl IntoResponse {
    switch(proxy, TargetType::Gpu).await
}

async fn switch(proxy: Arc<FailoverProxy>, to: TargetType) -> (StatusCode, Json<serde_json::Value>) {
    match proxy.switch_to(to, FailoverReason::Manual).await {
        Ok(switched) => (
            StatusCode::OK,
            Json(json!({
                "switched": switched,
                "mode": to.as_str(),
            })),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{:#}", e) })),
        ),
    }
}
