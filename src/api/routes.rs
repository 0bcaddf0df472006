//! API route definitions

use crate::lifecycle::LifecycleManager;
use crate::settings::SettingsStore;
use crate::watchdog::Heartbeat;
use axum::{
    Router,
    routing::{get, post},
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use super::handlers;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<LifecycleManager>,
    pub settings_store: Arc<SettingsStore>,
    pub heartbeat: Arc<Heartbeat>,
    pub prometheus_handle: metrics_exporter_prometheus::PrometheusHandle,
}

/// Create the main API router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Health, metrics, heartbeat
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .route("/ping", get(handlers::ping))
        // Settings
        .route(
            "/api/config",
            get(handlers::get_config).put(handlers::update_config),
        )
        // Model files and running instances
        .route("/api/models", get(handlers::list_models))
        .route("/api/running", get(handlers::list_running))
        .route("/api/ports/{port}", get(handlers::check_port))
        // Lifecycle
        .route("/api/launch", post(handlers::launch))
        .route("/api/stop/{pid}", post(handlers::stop))
        .route("/api/stop-all", post(handlers::stop_all))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}
