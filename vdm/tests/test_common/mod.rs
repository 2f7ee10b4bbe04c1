#![allow(dead_code)]

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::Mutex;
use std::thread::JoinHandle;

use clap::Parser;
use tempfile::TempDir;
use vdm::config::{BackendKind, Config};
use vdm::helper::{self, HelperArgs};
use vdm::image_config::ResolvedImage;
use vdm::orchestrator::HelperLauncher;

pub struct Workspace {
    pub dir: TempDir,
    pub base: PathBuf,
    pub patch: PathBuf,
    pub mount_point: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("base.vhd");
        let patch = dir.path().join("title.vhd");
        fs::write(&base, b"base").unwrap();
        fs::write(&patch, b"patch").unwrap();
        Workspace {
            base,
            patch,
            mount_point: dir.path().join("mnt"),
            dir,
        }
    }

    pub fn config(&self) -> Config {
        Config {
            mount_point: self.mount_point.clone(),
            backend: BackendKind::Simulated,
            poll_interval_ms: 5,
            result_timeout_secs: 10,
            teardown_timeout_secs: 10,
            settle_delay_ms: 0,
            ..Config::default()
        }
    }

    pub fn image(&self, delta_enabled: bool) -> ResolvedImage {
        ResolvedImage {
            base_path: self.base.clone(),
            patch_path: self.patch.clone(),
            delta_enabled,
        }
    }

    pub fn runtime_files(&self) -> Vec<PathBuf> {
        runtime_files(self.dir.path())
    }
}

pub fn runtime_files(dir: &Path) -> Vec<PathBuf> {
    fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| p.to_string_lossy().contains("-runtime"))
        .collect()
}

/// Runs the helper on a thread of the test process.
#[derive(Default)]
pub struct ThreadLauncher {
    handles: Mutex<Vec<JoinHandle<u8>>>,
}

impl ThreadLauncher {
    /// Exit statuses of every helper started so far.
    pub fn join(&self) -> Vec<u8> {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }
}

impl HelperLauncher for ThreadLauncher {
    fn launch(&self, args: Vec<OsString>) -> anyhow::Result<Option<Child>> {
        let argv = std::iter::once(OsString::from("helper")).chain(args);
        let args = HelperArgs::try_parse_from(argv)?;
        let handle = std::thread::spawn(move || helper::main(args));
        self.handles.lock().unwrap().push(handle);
        Ok(None)
    }
}
