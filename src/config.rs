//! Configuration structures and loading logic

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Static controller configuration.
///
/// Distinct from [`crate::settings::Settings`]: this is fixed at startup
/// (file + env + CLI), while settings are runtime-mutable through the API.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub api_port: u16,
    pub settings_file: PathBuf,

    /// Whether the heartbeat watchdog runs at all. Disable for headless
    /// use where no GUI pings the controller.
    pub heartbeat_enabled: bool,
    pub heartbeat_timeout_secs: u64,
    pub heartbeat_poll_secs: u64,

    /// Liveness polling cadence while stopping an external instance.
    pub stop_poll_interval_ms: u64,
    /// Upper bound on waiting for an external instance to die.
    pub stop_timeout_secs: u64,

    /// How long after spawn the child is checked for an immediate exit.
    pub spawn_check_delay_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            api_port: default_api_port(),
            settings_file: default_settings_file(),
            heartbeat_enabled: true,
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            heartbeat_poll_secs: default_heartbeat_poll(),
            stop_poll_interval_ms: default_stop_poll_interval(),
            stop_timeout_secs: default_stop_timeout(),
            spawn_check_delay_ms: default_spawn_check_delay(),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from file with environment variable overrides.
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content).context("Failed to parse TOML config")?
        } else {
            Self::default()
        };

        // Environment variable overrides
        if let Ok(port) = std::env::var("LLAMACTL_API_PORT") {
            config.api_port = port.parse().context("Invalid LLAMACTL_API_PORT value")?;
        }
        if let Ok(settings_file) = std::env::var("LLAMACTL_SETTINGS_FILE") {
            config.settings_file = PathBuf::from(settings_file);
        }
        if let Ok(timeout) = std::env::var("LLAMACTL_HEARTBEAT_TIMEOUT") {
            config.heartbeat_timeout_secs = timeout
                .parse()
                .context("Invalid LLAMACTL_HEARTBEAT_TIMEOUT value")?;
        }

        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.api_port < 1024 {
            anyhow::bail!("API port must be >= 1024 (got {})", self.api_port);
        }

        if self.heartbeat_poll_secs == 0 {
            anyhow::bail!("Heartbeat poll interval must be > 0");
        }
        if self.heartbeat_poll_secs >= self.heartbeat_timeout_secs {
            anyhow::bail!(
                "Heartbeat poll interval ({}) must be shorter than the timeout ({})",
                self.heartbeat_poll_secs,
                self.heartbeat_timeout_secs
            );
        }

        if self.stop_poll_interval_ms == 0 {
            anyhow::bail!("Stop poll interval must be > 0");
        }

        Ok(())
    }
}

// Default functions
fn default_api_port() -> u16 {
    11313
}
fn default_settings_file() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("llamactl").join("settings.toml"))
        .unwrap_or_else(|| PathBuf::from("llamactl-settings.toml"))
}
fn default_heartbeat_timeout() -> u64 {
    15
}
fn default_heartbeat_poll() -> u64 {
    2
}
fn default_stop_poll_interval() -> u64 {
    100
}
fn default_stop_timeout() -> u64 {
    10
}
fn default_spawn_check_delay() -> u64 {
    250
}
