//! API route handlers.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::Json;
use serde::de::DeserializeOwned;
use tracing::info;

use super::error::ApiResult;
use super::state::AppState;
use super::types::ApiResponse;
use crate::service::{PingRequest, PlayRequest, RunRequest, TransferRequest};

/// Plain-text greeting on `/`.
pub async fn hello() -> &'static str {
    "Hello Runway Api"
}

pub async fn health_check(State(state): State<Arc<AppState>>) -> Json<ApiResponse> {
    tracing::trace!(uptime_secs = state.uptime_secs(), "Health check");
    Json(ApiResponse::success("ok"))
}

/// Ad-hoc module run.
pub async fn run(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Json<ApiResponse>> {
    let request: RunRequest = parse(&body)?;
    info!(module = %request.module, hosts = request.target.hosts.len(), "Run request");
    let reply = state.orchestrator.run(request).await?;
    Ok(Json(ApiResponse::success(reply.into_message())))
}

/// Playbook run.
pub async fn play(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Json<ApiResponse>> {
    let request: PlayRequest = parse(&body)?;
    info!(playbook = %request.path.display(), hosts = request.target.hosts.len(), "Play request");
    let reply = state.orchestrator.play(request).await?;
    Ok(Json(ApiResponse::success(reply.into_message())))
}

/// File transfer.
pub async fn transform(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Json<ApiResponse>> {
    let request: TransferRequest = parse(&body)?;
    info!(target_path = %request.target_path, hosts = request.target.hosts.len(), "Transfer request");
    let reply = state.orchestrator.transfer(request).await?;
    Ok(Json(ApiResponse::success(reply.into_message())))
}

pub async fn ping(State(state): State<Arc<AppState>>, body: Bytes) -> ApiResult<Json<ApiResponse>> {
    let request: PingRequest = parse(&body)?;
    let reply = state.orchestrator.ping(request).await?;
    Ok(Json(ApiResponse::success(reply.into_message())))
}

fn parse<T: DeserializeOwned>(body: &[u8]) -> ApiResult<T> {
    Ok(serde_json::from_slice(body)?)
}
