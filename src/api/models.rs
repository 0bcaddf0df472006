//! API request and response models

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Heartbeat acknowledgement
#[derive(Debug, Serialize, Deserialize)]
pub struct PingResponse {
    pub ok: bool,
}

/// Request to launch a model server
#[derive(Debug, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub model_path: PathBuf,

    /// Wider than u16 so out-of-range values reach validation instead of
    /// failing JSON deserialization.
    pub port: u32,

    /// Bind host for the spawned server; defaults to the configured bind
    /// address.
    #[serde(default)]
    pub host: Option<String>,
}

/// Launched instance summary
#[derive(Debug, Serialize, Deserialize)]
pub struct LaunchResponse {
    pub pid: u32,
    pub model_path: PathBuf,
    pub port: u16,
    pub host: String,
}

/// Stop outcome; unknown pids are `stopped: false`, not an error
#[derive(Debug, Serialize, Deserialize)]
pub struct StopResponse {
    pub stopped: bool,
}

/// Stop-all acknowledgement
#[derive(Debug, Serialize, Deserialize)]
pub struct StopAllResponse {
    pub stopped: usize,
}

/// Query parameters for stop-all scope
#[derive(Debug, Default, Deserialize)]
pub struct StopAllQuery {
    /// Also signal discovered external instances.
    #[serde(default)]
    pub external: bool,
}

/// Port probe result
#[derive(Debug, Serialize, Deserialize)]
pub struct PortStatus {
    pub port: u32,
    pub free: bool,
}

/// Partial settings update; absent fields keep their current value
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct UpdateSettingsRequest {
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub model_dir: Option<PathBuf>,
    #[serde(default)]
    pub llama_server: Option<String>,
}
