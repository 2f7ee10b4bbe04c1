//! Per-title image description, stored as JSON next to the title's data.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImageConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    NotFound(String),
    #[error("{what} image not found: {}", .path.display())]
    MissingImage { what: &'static str, path: PathBuf },
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    pub base_path: String,
    pub patch_path: String,
    #[serde(default = "default_true")]
    pub delta_enabled: bool,
}

/// An [`ImageConfig`] with absolute, existing paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub base_path: PathBuf,
    pub patch_path: PathBuf,
    pub delta_enabled: bool,
}

pub fn load(path: &Path) -> Result<ImageConfig, ImageConfigError> {
    if !path.exists() {
        return Err(ImageConfigError::NotFound(format!(
            "image config not found: {}",
            path.display()
        )));
    }
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

pub fn save(path: &Path, cfg: &ImageConfig) -> Result<(), ImageConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, serde_json::to_string_pretty(cfg)?)?;
    Ok(())
}

/// Resolves relative image paths against the directory holding the config file.
pub fn resolve(path: &Path, cfg: &ImageConfig) -> Result<ResolvedImage, ImageConfigError> {
    let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
    let base_path = resolve_with_base(base_dir, &cfg.base_path);
    let patch_path = resolve_with_base(base_dir, &cfg.patch_path);

    if !base_path.exists() {
        return Err(ImageConfigError::MissingImage {
            what: "Base",
            path: base_path,
        });
    }
    if !patch_path.exists() {
        return Err(ImageConfigError::MissingImage {
            what: "Patch",
            path: patch_path,
        });
    }

    Ok(ResolvedImage {
        base_path,
        patch_path,
        delta_enabled: cfg.delta_enabled,
    })
}

fn resolve_with_base(base: &Path, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}
