//! Differencing (copy-on-write) overlays over a read-only parent image.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::backend::DiskImaging;
use crate::error::ImagingError;

pub const RUNTIME_SUFFIX: &str = "-runtime";
pub const DEFAULT_EXTENSION: &str = "vhd";

/// Where the overlay for `patch` lives: `<dir>/<stem>-runtime.<ext>`.
///
/// Deterministic so a crashed session's leftover lands on the same path and gets
/// discarded by the next one.
pub fn runtime_path_for(patch: &Path) -> PathBuf {
    let parent = patch
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let stem = patch
        .file_stem()
        .and_then(OsStr::to_str)
        .unwrap_or("runtime");
    let ext = patch
        .extension()
        .and_then(OsStr::to_str)
        .unwrap_or(DEFAULT_EXTENSION);
    parent.join(format!("{stem}{RUNTIME_SUFFIX}.{ext}"))
}

/// Force-detaches and deletes whatever sits at `overlay`.
///
/// A failed detach is only logged; a file that cannot be deleted is an error since a new
/// overlay cannot be created over it.
pub fn discard_stale(backend: &dyn DiskImaging, overlay: &Path) -> Result<(), ImagingError> {
    if let Err(e) = backend.detach(overlay) {
        tracing::warn!("Failed to detach stale overlay {}: {e}", overlay.display());
    }
    if fs::metadata(overlay).is_ok() {
        tracing::info!("Removing stale overlay {}", overlay.display());
        fs::remove_file(overlay)?;
    }
    Ok(())
}

/// Creates a fresh overlay whose parent is `patch`. The base is never opened for writing.
pub fn prepare_overlay(
    backend: &dyn DiskImaging,
    patch: &Path,
) -> Result<OverlayGuard, ImagingError> {
    let overlay = runtime_path_for(patch);
    discard_stale(backend, &overlay)?;

    if let Err(e) = backend.create_differencing(&overlay, patch) {
        if fs::metadata(&overlay).is_ok() {
            let _ = fs::remove_file(&overlay);
        }
        return Err(e);
    }
    if fs::metadata(&overlay).is_err() {
        return Err(ImagingError::ImageNotCreated(overlay));
    }
    tracing::debug!(
        "Created overlay {} over {}",
        overlay.display(),
        patch.display()
    );
    Ok(OverlayGuard::new(overlay))
}

/// Owns an overlay file for the duration of a session.
///
/// The file is deleted by [`OverlayGuard::remove`], or when the guard is dropped.
#[derive(Debug)]
pub struct OverlayGuard {
    path: Option<PathBuf>,
}

impl OverlayGuard {
    pub fn new(path: PathBuf) -> Self {
        OverlayGuard { path: Some(path) }
    }

    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }

    /// Deletes the overlay now. Missing files count as removed.
    pub fn remove(mut self) -> io::Result<()> {
        match self.path.take() {
            Some(path) => remove_if_present(&path),
            None => Ok(()),
        }
    }
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

impl Drop for OverlayGuard {
    fn drop(&mut self) {
        if let Some(path) = self.path.take()
            && let Err(e) = remove_if_present(&path)
        {
            tracing::error!("Failed to remove overlay {}: {e}", path.display());
        }
    }
}
