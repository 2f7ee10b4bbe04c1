//! Session teardown. Every step may fail independently; failures become warnings and
//! the remaining steps still run.

use libvdisk::{DiskImaging, ImagingError};

use crate::error::SessionError;
use crate::helper::MountedSession;

#[derive(Debug, Default)]
pub struct TeardownReport {
    pub warnings: Vec<SessionError>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    fn step(&mut self, step: &'static str, res: Result<(), ImagingError>) {
        if let Err(source) = res {
            let warning = SessionError::Teardown { step, source };
            tracing::warn!("{warning}");
            self.warnings.push(warning);
        }
    }
}

/// Detaches the mounted image (which drops the mount point binding), detaches the
/// overlay a second time in case it is still attached on its own, then deletes it.
pub fn teardown(backend: &dyn DiskImaging, mounted: MountedSession) -> TeardownReport {
    let mut report = TeardownReport::default();
    let (mount_path, overlay) = mounted.into_parts();

    report.step("detach mount", backend.detach(&mount_path));
    if let Some(overlay) = overlay {
        report.step("detach overlay", backend.detach(overlay.path()));
        report.step("remove overlay", overlay.remove().map_err(ImagingError::from));
    }
    tracing::info!("Released {}", mount_path.display());
    report
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;
    use std::time::Duration;

    use common::{ArtifactPaths, MountRequest};
    use libvdisk::backend::simulated::{BINDING_FILE, SimulatedFailure, SimulatedImaging};

    use super::*;
    use crate::helper::Session;

    fn mount(
        backend: &dyn DiskImaging,
        patch: PathBuf,
        mount_point: PathBuf,
    ) -> MountedSession {
        let artifacts = ArtifactPaths::in_dir(patch.parent().unwrap(), "t");
        let request = MountRequest::new(None, patch, true, artifacts).unwrap();
        Session::new(backend, mount_point, Duration::ZERO)
            .mount(&request)
            .unwrap()
    }

    #[test]
    fn test_detach_failures_are_collected() {
        let tmp = tempfile::tempdir().unwrap();
        let patch = tmp.path().join("title.vhd");
        fs::write(&patch, b"base").unwrap();
        let mount_point = tmp.path().join("mnt");

        // stale-overlay discard tolerates the failing detach, teardown records both
        let backend = SimulatedImaging::failing_at(&mount_point, SimulatedFailure::Detach);
        let mounted = mount(&backend, patch, mount_point.clone());
        let overlay = mounted.runtime_path().unwrap().to_path_buf();

        let report = teardown(&backend, mounted);
        assert_eq!(report.warnings.len(), 2);
        assert!(report.warnings[0].to_string().contains("detach mount"));
        assert!(report.warnings[1].to_string().contains("detach overlay"));
        // the overlay is still removed
        assert!(!overlay.exists());
        assert!(mount_point.join(BINDING_FILE).exists());
    }

    #[test]
    fn test_missing_overlay_is_not_a_warning() {
        let tmp = tempfile::tempdir().unwrap();
        let patch = tmp.path().join("title.vhd");
        fs::write(&patch, b"base").unwrap();
        let mount_point = tmp.path().join("mnt");
        let backend = SimulatedImaging::new(&mount_point);

        let mounted = mount(&backend, patch, mount_point.clone());
        fs::remove_file(mounted.runtime_path().unwrap()).unwrap();
        let report = teardown(&backend, mounted);
        assert!(report.is_clean());
        assert!(!mount_point.join(BINDING_FILE).exists());
    }
}
