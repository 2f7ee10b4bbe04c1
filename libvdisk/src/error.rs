use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ImagingError {
    #[error("mount point already in use: {}", .0.display())]
    MountPointBusy(PathBuf),

    #[error("Failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} failed: {message}")]
    Command { program: String, message: String },

    #[error("Failed to create runtime image {}", .0.display())]
    ImageNotCreated(PathBuf),

    #[error("No mountable volume found on {}", .0.display())]
    NoVolumes(PathBuf),

    #[error("No free device to attach {}", .0.display())]
    NoFreeDevice(PathBuf),

    #[error("No filesystem type could mount {}", .0.display())]
    UnknownFilesystem(PathBuf),

    #[error("Simulated failure: {0}")]
    Simulated(String),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[cfg(unix)]
    #[error(transparent)]
    Nix(#[from] nix::Error),

    #[cfg(target_os = "linux")]
    #[error(transparent)]
    Proc(#[from] procfs::ProcError),
}
