//! API request handlers

use super::models::{
    HealthResponse, LaunchRequest, LaunchResponse, PingResponse, PortStatus, StopAllQuery,
    StopAllResponse, StopResponse, UpdateSettingsRequest,
};
use super::routes::AppState;
use crate::error::ManagerError;
use crate::lifecycle::RunningModel;
use crate::models::ModelFile;
use crate::settings::Settings;
use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
};

/// GET /health - Controller health check
pub async fn health() -> (StatusCode, Json<HealthResponse>) {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "healthy".to_string(),
            timestamp: chrono::Utc::now(),
        }),
    )
}

/// GET /metrics - Prometheus metrics
pub async fn metrics(State(state): State<AppState>) -> String {
    state.prometheus_handle.render()
}

/// GET /ping - Consumer heartbeat; silence beyond the timeout triggers
/// the watchdog
pub async fn ping(State(state): State<AppState>) -> Json<PingResponse> {
    state.heartbeat.touch();
    Json(PingResponse { ok: true })
}

/// GET /api/config - Current settings
pub async fn get_config(State(state): State<AppState>) -> Json<Settings> {
    let settings = state.manager.settings().read().await.clone();
    Json(settings)
}

/// PUT /api/config - Partial settings update, persisted on success
pub async fn update_config(
    State(state): State<AppState>,
    Json(req): Json<UpdateSettingsRequest>,
) -> Result<Json<Settings>, ManagerError> {
    let mut settings = state.manager.settings().write().await;

    let mut candidate = settings.clone();
    if let Some(bind) = req.bind {
        candidate.bind = bind;
    }
    if let Some(model_dir) = req.model_dir {
        candidate.model_dir = model_dir;
    }
    if let Some(llama_server) = req.llama_server {
        candidate.llama_server = llama_server;
    }
    candidate.validate()?;

    state.settings_store.save(&candidate).await?;
    *settings = candidate.clone();

    tracing::info!(
        bind = %candidate.bind,
        model_dir = ?candidate.model_dir,
        llama_server = %candidate.llama_server,
        "Settings updated"
    );

    Ok(Json(candidate))
}

/// GET /api/models - GGUF files in the configured model directory
pub async fn list_models(State(state): State<AppState>) -> Json<Vec<ModelFile>> {
    Json(state.manager.list_model_files().await)
}

/// GET /api/running - Managed and discovered instances, reconciled fresh
pub async fn list_running(State(state): State<AppState>) -> Json<Vec<RunningModel>> {
    Json(state.manager.list_running().await)
}

/// GET /api/ports/{port} - Advisory bind probe
pub async fn check_port(
    State(state): State<AppState>,
    Path(port): Path<u32>,
) -> Result<Json<PortStatus>, ManagerError> {
    let free = state.manager.check_port(port).await?;
    Ok(Json(PortStatus { port, free }))
}

/// POST /api/launch - Spawn a model server and register it
pub async fn launch(
    State(state): State<AppState>,
    Json(req): Json<LaunchRequest>,
) -> Result<(StatusCode, Json<LaunchResponse>), ManagerError> {
    let instance = state
        .manager
        .launch(req.model_path, req.port, req.host)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(LaunchResponse {
            pid: instance.pid,
            model_path: instance.model_path,
            port: instance.port,
            host: instance.host,
        }),
    ))
}

/// POST /api/stop/{pid} - Stop a managed or discovered instance
pub async fn stop(State(state): State<AppState>, Path(pid): Path<u32>) -> Json<StopResponse> {
    let stopped = state.manager.stop(pid).await;
    Json(StopResponse { stopped })
}

/// POST /api/stop-all - Stop every managed instance; `?external=true`
/// also signals discovered ones
pub async fn stop_all(
    State(state): State<AppState>,
    Query(query): Query<StopAllQuery>,
) -> Json<StopAllResponse> {
    let stopped = state.manager.stop_all(query.external).await;
    Json(StopAllResponse { stopped })
}
