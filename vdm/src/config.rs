use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;
use libvdisk::DiskImaging;
use libvdisk::backend::{self, NativeOptions, simulated::SimulatedImaging};
use serde::{Deserialize, Serialize};

#[cfg(windows)]
static MOUNT_POINT: &str = "X:\\";
#[cfg(not(windows))]
static MOUNT_POINT: &str = "/mnt/vdm";

pub static MOUNT_POINT_ENV: &str = "VDM_MOUNT_POINT";

#[derive(Serialize, Deserialize, ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Native,
    Simulated,
}

/// Settings shared by the orchestrator and the helper. The helper never reads the config
/// file; the orchestrator passes what it needs on the command line.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// The single location every session's volume is bound to.
    pub mount_point: PathBuf,
    pub backend: BackendKind,
    pub poll_interval_ms: u64,
    pub result_timeout_secs: u64,
    pub teardown_timeout_secs: u64,
    /// Pause between binding the volume and asking foreign handles to close.
    pub settle_delay_ms: u64,
    /// Prefix used to start the helper with privileges on Unix, e.g. `["sudo", "-n"]`.
    pub elevate_with: Vec<String>,
    pub reclaim_process_names: Vec<String>,
    /// Defaults to the running executable.
    pub helper_exe: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            mount_point: PathBuf::from(MOUNT_POINT),
            backend: BackendKind::Native,
            poll_interval_ms: 200,
            result_timeout_secs: 60,
            teardown_timeout_secs: 30,
            settle_delay_ms: 300,
            elevate_with: vec!["pkexec".to_string()],
            reclaim_process_names: ["nautilus", "nemo", "dolphin", "thunar", "pcmanfm"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            helper_exe: None,
        }
    }
}

impl Config {
    const APP_NAME: &'static str = "vdm";
    const CONFIG_NAME: &'static str = "vdm";

    /// Loads `vdm.toml` from the user's config directory, creating it with defaults when
    /// absent. `VDM_MOUNT_POINT` overrides the mount point.
    pub fn load() -> anyhow::Result<Self> {
        let mut config: Config = confy::load(Self::APP_NAME, Self::CONFIG_NAME)
            .with_context(|| {
                format!(
                    "failed to load config file `{}.{}`",
                    Self::APP_NAME,
                    Self::CONFIG_NAME,
                )
            })?;
        if let Some(mount_point) = std::env::var_os(MOUNT_POINT_ENV).filter(|v| !v.is_empty()) {
            config.mount_point = PathBuf::from(mount_point);
        }
        Ok(config)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn result_timeout(&self) -> Duration {
        Duration::from_secs(self.result_timeout_secs)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn imaging(&self) -> Box<dyn DiskImaging> {
        match self.backend {
            BackendKind::Native => backend::native(&NativeOptions {
                mount_point: self.mount_point.clone(),
                reclaim_process_names: self.reclaim_process_names.clone(),
            }),
            BackendKind::Simulated => Box::new(SimulatedImaging::new(&self.mount_point)),
        }
    }

    /// Whether this process may call the imaging facilities itself.
    pub fn is_privileged() -> bool {
        #[cfg(unix)]
        {
            nix::unistd::geteuid().is_root()
        }
        #[cfg(windows)]
        {
            unsafe { winapi::um::shlobj::IsUserAnAdmin() != 0 }
        }
        #[cfg(not(any(unix, windows)))]
        {
            false
        }
    }
}
