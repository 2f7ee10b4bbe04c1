//! Write-once filesystem artifacts and the polling that waits on them.
//!
//! The orchestrator and the helper share no memory; every message between them is a file
//! that appears exactly once. [`Signal`] is the seam a native cross-process event could
//! slot into.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use common::MountResult;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollOptions {
    pub interval: Duration,
    /// `None` polls forever.
    pub timeout: Option<Duration>,
}

impl PollOptions {
    pub fn bounded(interval: Duration, timeout: Duration) -> Self {
        PollOptions {
            interval,
            timeout: Some(timeout),
        }
    }

    pub fn unbounded(interval: Duration) -> Self {
        PollOptions {
            interval,
            timeout: None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Timed out after {0:?}")]
pub struct WaitTimedOut(pub Duration);

/// Calls `check` every `poll.interval` until it yields a value or the timeout passes.
/// `check` always runs at least once.
pub fn wait_until<T>(
    poll: &PollOptions,
    mut check: impl FnMut() -> Option<T>,
) -> Result<T, WaitTimedOut> {
    let start = Instant::now();
    loop {
        if let Some(value) = check() {
            return Ok(value);
        }
        if let Some(timeout) = poll.timeout
            && start.elapsed() >= timeout
        {
            return Err(WaitTimedOut(timeout));
        }
        sleep(poll.interval);
    }
}

/// A level-triggered, presence-only signal.
pub trait Signal {
    fn raise(&self) -> io::Result<()>;

    fn is_raised(&self) -> bool;

    fn clear(&self) -> io::Result<()>;

    fn wait(&self, poll: &PollOptions) -> Result<(), WaitTimedOut> {
        wait_until(poll, || self.is_raised().then_some(()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileArtifact {
    path: PathBuf,
}

impl FileArtifact {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileArtifact { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `data` through a temporary file and a rename, so readers see either nothing
    /// or the whole content.
    pub fn publish(&self, data: &[u8]) -> io::Result<()> {
        let dir = match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::Builder::new()
            .prefix(".vdm-artifact-")
            .tempfile_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    pub fn read(&self) -> io::Result<String> {
        fs::read_to_string(&self.path)
    }

    pub fn publish_result(&self, result: &MountResult) -> io::Result<()> {
        let json = result.to_json().map_err(io::Error::other)?;
        self.publish(json.as_bytes())
    }
}

impl Signal for FileArtifact {
    fn raise(&self) -> io::Result<()> {
        self.publish(b"1")
    }

    fn is_raised(&self) -> bool {
        fs::metadata(&self.path).is_ok()
    }

    fn clear(&self) -> io::Result<()> {
        match fs::remove_file(&self.path) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}
