//! A filesystem-only stand-in for the imaging facilities.
//!
//! Differencing images are small text files naming their parent, and a binding is a
//! `.vdm-binding` record inside the mount point directory. Good enough to drive the
//! whole session protocol on hosts without imaging tools, and to inject failures.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::{DiskImaging, Volume};
use crate::error::ImagingError;

pub const BINDING_FILE: &str = ".vdm-binding";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedFailure {
    CreateDifferencing,
    Attach,
    NoVolumes,
    Bind,
    Detach,
    Reclaim,
}

#[derive(Debug)]
pub struct SimulatedImaging {
    mount_point: PathBuf,
    failure: Option<SimulatedFailure>,
    journal: Mutex<Vec<String>>,
}

impl SimulatedImaging {
    /// `mount_point` is the location whose binding a detach releases.
    pub fn new(mount_point: impl Into<PathBuf>) -> Self {
        SimulatedImaging {
            mount_point: mount_point.into(),
            failure: None,
            journal: Mutex::default(),
        }
    }

    pub fn failing_at(mount_point: impl Into<PathBuf>, failure: SimulatedFailure) -> Self {
        SimulatedImaging {
            failure: Some(failure),
            ..SimulatedImaging::new(mount_point)
        }
    }

    /// Operations performed so far, e.g. `attach /g/title-runtime.vhd`.
    pub fn journal(&self) -> Vec<String> {
        self.journal.lock().map(|j| j.clone()).unwrap_or_default()
    }

    fn record(&self, op: &str, path: &Path) {
        if let Ok(mut journal) = self.journal.lock() {
            journal.push(format!("{op} {}", path.display()));
        }
    }

    fn check(&self, at: SimulatedFailure) -> Result<(), ImagingError> {
        if self.failure == Some(at) {
            return Err(ImagingError::Simulated(format!("{at:?}")));
        }
        Ok(())
    }

    /// Image currently bound at `mount_point`, if any.
    pub fn bound_image(mount_point: &Path) -> Option<PathBuf> {
        fs::read_to_string(mount_point.join(BINDING_FILE))
            .ok()
            .map(|s| PathBuf::from(s.trim()))
    }
}

impl DiskImaging for SimulatedImaging {
    fn name(&self) -> &'static str {
        "simulated"
    }

    fn mount_point_in_use(&self, mount_point: &Path) -> Result<bool, ImagingError> {
        Ok(mount_point.join(BINDING_FILE).exists())
    }

    fn create_differencing(&self, child: &Path, parent: &Path) -> Result<(), ImagingError> {
        self.record("create", child);
        self.check(SimulatedFailure::CreateDifferencing)?;
        if !parent.exists() {
            return Err(ImagingError::Simulated(format!(
                "parent image {} does not exist",
                parent.display()
            )));
        }
        fs::write(child, format!("differencing parent={}\n", parent.display()))?;
        Ok(())
    }

    fn attach(&self, image: &Path) -> Result<Vec<Volume>, ImagingError> {
        self.record("attach", image);
        self.check(SimulatedFailure::Attach)?;
        if !image.exists() {
            return Err(ImagingError::Simulated(format!(
                "image {} does not exist",
                image.display()
            )));
        }
        if self.failure == Some(SimulatedFailure::NoVolumes) {
            return Ok(Vec::new());
        }
        Ok(vec![Volume {
            id: "1".to_string(),
            device: None,
        }])
    }

    fn bind(&self, image: &Path, _volume: &Volume, mount_point: &Path) -> Result<(), ImagingError> {
        self.record("bind", mount_point);
        self.check(SimulatedFailure::Bind)?;
        fs::create_dir_all(mount_point)?;
        fs::write(
            mount_point.join(BINDING_FILE),
            image.to_string_lossy().as_bytes(),
        )?;
        Ok(())
    }

    fn detach(&self, image: &Path) -> Result<(), ImagingError> {
        self.record("detach", image);
        self.check(SimulatedFailure::Detach)?;
        if Self::bound_image(&self.mount_point).as_deref() == Some(image) {
            fs::remove_file(self.mount_point.join(BINDING_FILE))?;
        }
        Ok(())
    }

    fn reclaim_foreign_handles(&self, mount_point: &Path) -> Result<usize, ImagingError> {
        self.record("reclaim", mount_point);
        self.check(SimulatedFailure::Reclaim)?;
        Ok(0)
    }
}
