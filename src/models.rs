//! Model file discovery in the configured model directory

use serde::Serialize;
use std::path::{Path, PathBuf};

/// A GGUF model file available for launching.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelFile {
    pub filename: String,
    pub path: PathBuf,
}

/// List `.gguf` files (case-insensitive extension) in `dir`.
///
/// A missing or unreadable directory yields an empty list.
pub async fn list_model_files(dir: &Path) -> Vec<ModelFile> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::debug!(dir = ?dir, error = %e, "Model directory not readable");
            return Vec::new();
        }
    };

    let mut models = Vec::new();
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        let is_gguf = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case("gguf"));
        if !is_gguf {
            continue;
        }
        if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        if let Some(filename) = path.file_name().and_then(|f| f.to_str()) {
            models.push(ModelFile {
                filename: filename.to_string(),
                path: path.clone(),
            });
        }
    }

    // Directory iteration order is platform-dependent; sort for a stable view.
    models.sort_by(|a, b| a.filename.cmp(&b.filename));
    models
}
