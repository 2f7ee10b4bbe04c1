//! The single shared mount point is only safe to use when nothing is bound to it.

use std::path::Path;

use crate::backend::DiskImaging;
use crate::error::ImagingError;

/// Point-in-time check that `mount_point` is free. There is no lock behind it: at most
/// one session may be active at a time.
pub fn ensure_free(backend: &dyn DiskImaging, mount_point: &Path) -> Result<(), ImagingError> {
    if backend.mount_point_in_use(mount_point)? {
        tracing::warn!("Mount point {} is already bound", mount_point.display());
        return Err(ImagingError::MountPointBusy(mount_point.to_path_buf()));
    }
    Ok(())
}
