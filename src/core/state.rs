//! AQ-012: Artifact persistence — load, save (atomic), path derivation.
//!
//! The engine hands artifacts back to the caller; the CLI stores them here
//! as one JSON file per plan.

use super::types::Artifact;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid artifact {path}: {message}")]
    Format { path: PathBuf, message: String },
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StateError + '_ {
    move |source| StateError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Derive the artifact path for a plan within the output directory.
pub fn artifact_path(out_dir: &Path, plan_id: &str) -> PathBuf {
    out_dir.join(format!("{}.json", plan_id))
}

/// Load an artifact. Returns None if the file doesn't exist.
pub fn load_artifact(out_dir: &Path, plan_id: &str) -> Result<Option<Artifact>, StateError> {
    let path = artifact_path(out_dir, plan_id);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path).map_err(io_error(&path))?;
    let artifact = serde_json::from_str(&content).map_err(|e| StateError::Format {
        path: path.clone(),
        message: e.to_string(),
    })?;
    Ok(Some(artifact))
}

/// Save an artifact atomically (write to temp, then rename). Returns the
/// final path.
pub fn save_artifact(out_dir: &Path, artifact: &Artifact) -> Result<PathBuf, StateError> {
    std::fs::create_dir_all(out_dir).map_err(io_error(out_dir))?;
    let path = artifact_path(out_dir, &artifact.plan_id);

    let json = serde_json::to_string_pretty(artifact).map_err(|e| StateError::Format {
        path: path.clone(),
        message: e.to_string(),
    })?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json).map_err(io_error(&tmp_path))?;
    std::fs::rename(&tmp_path, &path).map_err(io_error(&path))?;

    Ok(path)
}
