use std::path::PathBuf;

use libvdisk::ImagingError;
use thiserror::Error;

/// Everything that can go wrong in a mount session.
///
/// Mount-phase variants end the session before success is reported. `Teardown` and
/// `ForeignHandleReclaim` are only ever collected as warnings.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{}", common::MISSING_ARGUMENTS)]
    Arguments,

    #[error("mount point already in use: {}", .0.display())]
    MountPointBusy(PathBuf),

    #[error("Failed to create runtime image: {0}")]
    ImageCreation(#[source] ImagingError),

    #[error("Failed to mount {}: {source}", .path.display())]
    Mount {
        path: PathBuf,
        #[source]
        source: ImagingError,
    },

    #[error("Teardown step `{step}` failed: {source}")]
    Teardown {
        step: &'static str,
        #[source]
        source: ImagingError,
    },

    #[error("Failed to reclaim handles on {}: {source}", .path.display())]
    ForeignHandleReclaim {
        path: PathBuf,
        #[source]
        source: ImagingError,
    },

    #[error("Failed to launch mount helper: {0}")]
    Launch(String),

    #[error("Timed out waiting for mount helper")]
    HelperTimeout,

    #[error("Failed to parse mount helper result: {0}")]
    ResultParse(String),

    #[error("{0}")]
    Reported(String),

    #[error("Timed out waiting for mount helper to release the session")]
    TeardownTimeout,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Mount point check failures keep their own variant; anything else the check runs
    /// into is a mount failure.
    pub fn from_guard(mount_point: PathBuf, err: ImagingError) -> Self {
        match err {
            ImagingError::MountPointBusy(path) => SessionError::MountPointBusy(path),
            source => SessionError::Mount {
                path: mount_point,
                source,
            },
        }
    }
}
