//! Linux backend: qcow2 overlays through `qemu-img`, block devices through `qemu-nbd`.
//!
//! The nbd module has to be loaded with partition support (`modprobe nbd max_part=16`).

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use nix::mount::{MntFlags, MsFlags, mount, umount2};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use procfs::process::{Process, all_processes};

use super::{DiskImaging, Volume};
use crate::command;
use crate::error::ImagingError;

const SYS_BLOCK: &str = "/sys/block";
const FILESYSTEMS: &str = "/proc/filesystems";
const NBD_DEVICES: usize = 16;
const DEVICE_SETTLE: Duration = Duration::from_secs(3);

#[derive(Debug)]
pub struct NbdImaging {
    reclaim_process_names: Vec<String>,
}

impl NbdImaging {
    pub fn new(reclaim_process_names: Vec<String>) -> Self {
        NbdImaging {
            reclaim_process_names,
        }
    }

    fn free_device(&self) -> Option<String> {
        (0..NBD_DEVICES)
            .map(|i| format!("nbd{i}"))
            .find(|dev| {
                let sys = Path::new(SYS_BLOCK).join(dev);
                sys.exists() && !sys.join("pid").exists()
            })
    }

    /// The nbd device currently serving `image`, found through the owning qemu-nbd's
    /// command line.
    fn device_for(&self, image: &Path) -> Option<String> {
        let wanted = absolute(image);
        (0..NBD_DEVICES).map(|i| format!("nbd{i}")).find(|dev| {
            let Some(pid) = fs::read_to_string(Path::new(SYS_BLOCK).join(dev).join("pid"))
                .ok()
                .and_then(|pid| pid.trim().parse::<i32>().ok())
            else {
                return false;
            };
            Process::new(pid)
                .and_then(|p| p.cmdline())
                .map(|args| args.iter().any(|arg| absolute(Path::new(arg)) == wanted))
                .unwrap_or(false)
        })
    }
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize()
        .or_else(|_| std::path::absolute(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// `(source, mount point)` pairs of this process's mount namespace.
fn mounts() -> Result<Vec<(Option<String>, PathBuf)>, ImagingError> {
    Ok(Process::myself()?
        .mountinfo()?
        .into_iter()
        .map(|m| (m.mount_source, m.mount_point))
        .collect())
}

/// Block filesystems the kernel knows about, in registration order.
fn parse_filesystems(table: &str) -> Vec<String> {
    table
        .lines()
        .filter(|l| !l.starts_with("nodev"))
        .map(|l| l.trim().to_string())
        .filter(|l| !l.is_empty())
        .collect()
}

fn parent_format(parent: &Path) -> &'static str {
    match parent
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("vhd") => "vpc",
        Some("vhdx") => "vhdx",
        Some("qcow2") => "qcow2",
        Some("vmdk") => "vmdk",
        _ => "raw",
    }
}

fn partitions(dev: &str) -> Result<Vec<Volume>, ImagingError> {
    let mut names: Vec<String> = fs::read_dir(Path::new(SYS_BLOCK).join(dev))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(&format!("{dev}p")))
        .collect();
    names.sort_by_key(|n| n[dev.len() + 1..].parse::<u32>().unwrap_or(u32::MAX));
    let names = if names.is_empty() {
        vec![dev.to_string()]
    } else {
        names
    };
    Ok(names
        .into_iter()
        .map(|n| Volume {
            device: Some(PathBuf::from(format!("/dev/{n}"))),
            id: n,
        })
        .collect())
}

/// SIGTERM without giving up on the remaining holders when one cannot be signalled.
fn ask_to_leave(pid: i32) -> bool {
    match kill(Pid::from_raw(pid), Signal::SIGTERM) {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Failed to signal {pid}: {e}");
            false
        }
    }
}

fn wait_for_size(dev: &str) {
    let size = Path::new(SYS_BLOCK).join(dev).join("size");
    let start = Instant::now();
    while start.elapsed() < DEVICE_SETTLE {
        let ready = fs::read_to_string(&size)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
            .is_some_and(|s| s > 0);
        if ready {
            return;
        }
        sleep(Duration::from_millis(100));
    }
}

impl DiskImaging for NbdImaging {
    fn name(&self) -> &'static str {
        "qemu-nbd"
    }

    fn mount_point_in_use(&self, mount_point: &Path) -> Result<bool, ImagingError> {
        if !mount_point.exists() {
            return Ok(false);
        }
        let target = absolute(mount_point);
        Ok(mounts()?.iter().any(|(_, p)| *p == target))
    }

    fn create_differencing(&self, child: &Path, parent: &Path) -> Result<(), ImagingError> {
        command::run(
            command::quiet("qemu-img")
                .args(["create", "-q", "-f", "qcow2", "-F", parent_format(parent), "-b"])
                .arg(absolute(parent))
                .arg(child),
        )?;
        Ok(())
    }

    fn attach(&self, image: &Path) -> Result<Vec<Volume>, ImagingError> {
        let dev = self
            .free_device()
            .ok_or_else(|| ImagingError::NoFreeDevice(image.to_path_buf()))?;
        command::run(
            command::quiet("qemu-nbd")
                .arg(format!("--connect=/dev/{dev}"))
                .arg(absolute(image)),
        )?;
        wait_for_size(&dev);
        partitions(&dev)
    }

    fn bind(&self, _image: &Path, volume: &Volume, mount_point: &Path) -> Result<(), ImagingError> {
        let device = volume
            .device
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/dev/{}", volume.id)));
        fs::create_dir_all(mount_point)?;
        for fstype in parse_filesystems(&fs::read_to_string(FILESYSTEMS)?) {
            match mount(
                Some(&device),
                mount_point,
                Some(fstype.as_str()),
                MsFlags::empty(),
                None::<&str>,
            ) {
                Ok(()) => {
                    tracing::debug!("Mounted {} as {fstype}", device.display());
                    return Ok(());
                }
                Err(e) => tracing::trace!("{fstype} rejected {}: {e}", device.display()),
            }
        }
        Err(ImagingError::UnknownFilesystem(device))
    }

    fn detach(&self, image: &Path) -> Result<(), ImagingError> {
        let Some(dev) = self.device_for(image) else {
            return Ok(());
        };
        let node = format!("/dev/{dev}");
        for (source, target) in mounts()? {
            let Some(source) = source else {
                continue;
            };
            if source == node || source.starts_with(&format!("{node}p")) {
                umount2(&target, MntFlags::MNT_DETACH)?;
            }
        }
        command::run(command::quiet("qemu-nbd").arg("--disconnect").arg(&node))?;
        Ok(())
    }

    fn reclaim_foreign_handles(&self, mount_point: &Path) -> Result<usize, ImagingError> {
        let target = absolute(mount_point);
        let me = std::process::id() as i32;
        let mut asked = 0;
        for process in all_processes()?.filter_map(|p| p.ok()) {
            if process.pid == me {
                continue;
            }
            let Ok(stat) = process.stat() else {
                continue;
            };
            if !self.reclaim_process_names.iter().any(|n| *n == stat.comm) {
                continue;
            }
            let inside = process
                .cwd()
                .map(|cwd| cwd.starts_with(&target))
                .unwrap_or(false);
            if !inside {
                continue;
            }
            tracing::info!(
                "Asking {} ({}) to leave {}",
                stat.comm,
                process.pid,
                target.display()
            );
            if ask_to_leave(process.pid) {
                asked += 1;
            }
        }
        Ok(asked)
    }
}
