//! Persisted server configuration (bind host, model directory, binary)

use crate::error::ManagerError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Selector value for the bundled per-platform server binary.
pub const INTERNAL_SERVER: &str = "internal";

/// User-facing server configuration, mutable only through the config
/// endpoint and persisted across controller restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Interface spawned servers (and the API itself) bind to.
    pub bind: String,
    /// Directory scanned for GGUF model files.
    pub model_dir: PathBuf,
    /// `"internal"` or an explicit path to a llama-server binary.
    pub llama_server: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            model_dir: default_model_dir(),
            llama_server: INTERNAL_SERVER.to_string(),
        }
    }
}

fn default_model_dir() -> PathBuf {
    dirs::download_dir()
        .or_else(|| dirs::home_dir().map(|h| h.join("Downloads")))
        .unwrap_or_else(|| PathBuf::from("."))
}

impl Settings {
    /// Resolve the llama-server binary this configuration points at.
    ///
    /// The internal selector maps to `bin/<os>/<arch>/llama-server` next to
    /// the controller executable.
    pub fn resolve_server_binary(&self) -> PathBuf {
        if self.llama_server == INTERNAL_SERVER {
            internal_server_path()
        } else {
            PathBuf::from(&self.llama_server)
        }
    }

    /// Reject bind addresses that are not parseable IPs.
    pub fn validate(&self) -> Result<(), ManagerError> {
        if self.bind.parse::<std::net::IpAddr>().is_err() {
            return Err(ManagerError::InvalidInput(format!(
                "bind address '{}' is not a valid IP address",
                self.bind
            )));
        }
        Ok(())
    }
}

fn internal_server_path() -> PathBuf {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));

    let binary = if cfg!(windows) {
        "llama-server.exe"
    } else {
        "llama-server"
    };

    exe_dir
        .join("bin")
        .join(std::env::consts::OS)
        .join(std::env::consts::ARCH)
        .join(binary)
}

// ============================================================================
// Storage backend
// ============================================================================

/// Trait for settings storage operations.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Save content to a file path atomically.
    async fn save(&self, path: &Path, content: &str) -> Result<()>;

    /// Load content from a file path; `None` if the file doesn't exist.
    async fn load(&self, path: &Path) -> Result<Option<String>>;
}

/// Production storage backend using tokio::fs.
pub struct FileSystemStorage;

impl FileSystemStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Default for FileSystemStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for FileSystemStorage {
    async fn save(&self, path: &Path, content: &str) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create settings directory: {:?}", parent))?;
        }

        // Atomic write: write to temp file, then rename.
        let temp_file = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_file)
            .await
            .context("Failed to create temp settings file")?;
        file.write_all(content.as_bytes())
            .await
            .context("Failed to write settings file")?;
        file.sync_all()
            .await
            .context("Failed to sync settings file")?;

        fs::rename(&temp_file, path)
            .await
            .context("Failed to rename temp settings file")?;

        Ok(())
    }

    async fn load(&self, path: &Path) -> Result<Option<String>> {
        if !path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read settings file: {:?}", path))?;

        Ok(Some(content))
    }
}

// ============================================================================
// Settings store
// ============================================================================

/// Loads and persists [`Settings`] as TOML.
pub struct SettingsStore {
    settings_file: PathBuf,
    storage: Arc<dyn StorageBackend>,
}

impl SettingsStore {
    pub fn new_with_storage(settings_file: PathBuf, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            settings_file,
            storage,
        }
    }

    pub fn new(settings_file: PathBuf) -> Self {
        Self::new_with_storage(settings_file, Arc::new(FileSystemStorage::new()))
    }

    /// Load settings, falling back to defaults when the file is missing
    /// or unparseable. A corrupt settings file must not keep the
    /// controller from starting.
    pub async fn load(&self) -> Settings {
        let content = match self.storage.load(&self.settings_file).await {
            Ok(Some(content)) => content,
            Ok(None) => {
                tracing::info!(path = ?self.settings_file, "No settings file, using defaults");
                return Settings::default();
            }
            Err(e) => {
                tracing::warn!(
                    path = ?self.settings_file,
                    error = %e,
                    "Failed to read settings, using defaults"
                );
                return Settings::default();
            }
        };

        match toml::from_str(&content) {
            Ok(settings) => {
                tracing::info!(path = ?self.settings_file, "Settings loaded");
                settings
            }
            Err(e) => {
                tracing::warn!(
                    path = ?self.settings_file,
                    error = %e,
                    "Settings file unparseable, using defaults"
                );
                Settings::default()
            }
        }
    }

    /// Persist settings atomically.
    pub async fn save(&self, settings: &Settings) -> Result<()> {
        let content =
            toml::to_string_pretty(settings).context("Failed to serialize settings to TOML")?;

        self.storage.save(&self.settings_file, &content).await?;

        tracing::debug!(path = ?self.settings_file, "Settings saved");
        Ok(())
    }
}

// ============================================================================
// Mock implementation for testing
// ============================================================================
