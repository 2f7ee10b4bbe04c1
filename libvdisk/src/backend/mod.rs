use std::path::{Path, PathBuf};

use crate::error::ImagingError;

#[cfg(target_os = "linux")]
pub mod linux;
pub mod simulated;
pub mod windows;

/// A volume found on an attached image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    /// Backend specific identifier (partition number, device node, ...).
    pub id: String,
    pub device: Option<PathBuf>,
}

/// The operating system's virtual disk facilities.
///
/// Only the helper process (or an already privileged orchestrator) talks to an
/// implementation of this trait.
pub trait DiskImaging: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether `mount_point` is currently bound to some volume.
    fn mount_point_in_use(&self, mount_point: &Path) -> Result<bool, ImagingError>;

    /// Creates a copy-on-write image at `child` whose parent is `parent`.
    fn create_differencing(&self, child: &Path, parent: &Path) -> Result<(), ImagingError>;

    /// Attaches `image` read-write without assigning it a drive identity and returns its
    /// volumes in discovery order.
    fn attach(&self, image: &Path) -> Result<Vec<Volume>, ImagingError>;

    fn bind(&self, image: &Path, volume: &Volume, mount_point: &Path)
    -> Result<(), ImagingError>;

    /// Detaches `image`, dropping any binding it holds. Detaching an image that is not
    /// attached succeeds.
    fn detach(&self, image: &Path) -> Result<(), ImagingError>;

    /// Asks other software holding `mount_point` open to let go. Returns how many holders
    /// were asked.
    fn reclaim_foreign_handles(&self, mount_point: &Path) -> Result<usize, ImagingError>;
}

/// Options for [`native`].
#[derive(Debug, Clone, Default)]
pub struct NativeOptions {
    pub mount_point: PathBuf,
    /// Process names asked to exit when they sit inside the mount point (Unix only).
    pub reclaim_process_names: Vec<String>,
}

/// The imaging backend for the platform this binary was built for.
pub fn native(options: &NativeOptions) -> Box<dyn DiskImaging> {
    #[cfg(windows)]
    {
        let _ = options;
        Box::new(windows::PowerShellImaging::new())
    }
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::NbdImaging::new(options.reclaim_process_names.clone()))
    }
    #[cfg(not(any(windows, target_os = "linux")))]
    {
        tracing::warn!("No native imaging backend on this platform, using the simulated one");
        Box::new(simulated::SimulatedImaging::new(&options.mount_point))
    }
}
