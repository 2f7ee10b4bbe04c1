//! Windows backend built on diskpart and the Storage PowerShell module.
//!
//! The script builders are plain string functions so they can be checked on any host;
//! only running them needs Windows.

use std::fs;
use std::io::Write;
use std::path::Path;

use super::{DiskImaging, Volume};
use crate::command;
use crate::error::ImagingError;

#[derive(Debug, Default)]
pub struct PowerShellImaging;

impl PowerShellImaging {
    pub fn new() -> Self {
        PowerShellImaging
    }

    fn powershell(&self, script: &str) -> Result<String, ImagingError> {
        command::run(command::quiet("powershell").args(["-NoProfile", "-Command", script]))
    }

    fn diskpart(&self, script: &str) -> Result<(), ImagingError> {
        let mut file = tempfile::Builder::new()
            .prefix("vdm_diskpart_")
            .suffix(".txt")
            .tempfile()?;
        file.write_all(script.as_bytes())?;
        file.flush()?;
        command::run(command::quiet("diskpart.exe").arg("/s").arg(file.path()))?;
        Ok(())
    }
}

/// Quotes `value` as a PowerShell single-quoted string.
pub fn ps_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn ps_path(path: &Path) -> String {
    ps_quote(&path.to_string_lossy())
}

fn storage_type(image: &Path) -> &'static str {
    match image.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("vhdx") => "VHDX",
        _ => "VHD",
    }
}

pub fn diskpart_create_script(child: &Path, parent: &Path) -> String {
    format!(
        "create vdisk file=\"{}\" parent=\"{}\"\n",
        child.to_string_lossy(),
        parent.to_string_lossy()
    )
}

pub fn attach_script(image: &Path) -> String {
    format!(
        "Mount-DiskImage -ImagePath {} -StorageType {} -NoDriveLetter -PassThru -Access ReadWrite \
         -Confirm:$false -ErrorAction Stop | Get-Disk | Get-Partition | \
         Where-Object {{ ($_ | Get-Volume) -ne $Null }} | ForEach-Object {{ $_.PartitionNumber }}",
        ps_path(image),
        storage_type(image)
    )
}

pub fn bind_script(image: &Path, partition: &str, mount_point: &Path) -> String {
    format!(
        "Get-DiskImage -ImagePath {} | Get-Disk | Get-Partition -PartitionNumber {} | \
         Add-PartitionAccessPath -AccessPath {} -ErrorAction Stop | Out-Null",
        ps_path(image),
        partition,
        ps_path(mount_point)
    )
}

pub fn detach_script(image: &Path) -> String {
    format!(
        "Dismount-DiskImage -ImagePath {} -Confirm:$false -ErrorAction SilentlyContinue | Out-Null",
        ps_path(image)
    )
}

/// `file:///X:` style prefix Explorer reports for windows showing `mount_point`.
pub fn location_url(mount_point: &Path) -> String {
    let raw = mount_point.to_string_lossy().replace('\\', "/");
    format!("file:///{}", raw.trim_end_matches('/'))
}

pub fn reclaim_script(mount_point: &Path) -> String {
    let url = location_url(mount_point);
    format!(
        "$shell = New-Object -ComObject Shell.Application; \
         $open = @($shell.Windows() | Where-Object {{ $_.LocationURL -like {} -or $_.LocationURL -like {} }}); \
         $open | ForEach-Object {{ $_.Quit() }}; $open.Count",
        ps_quote(&url),
        ps_quote(&format!("{url}/*"))
    )
}

/// `X:\`, `X:` or `X:/`.
fn is_drive_root(path: &Path) -> bool {
    let raw = path.to_string_lossy();
    let bytes = raw.as_bytes();
    matches!(bytes.len(), 2 | 3)
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && bytes.get(2).is_none_or(|c| *c == b'\\' || *c == b'/')
}

#[cfg(windows)]
fn is_reparse_point(path: &Path) -> bool {
    use std::os::windows::fs::MetadataExt;
    fs::symlink_metadata(path)
        .map(|m| m.file_attributes() & winapi::um::winnt::FILE_ATTRIBUTE_REPARSE_POINT != 0)
        .unwrap_or(false)
}

#[cfg(not(windows))]
fn is_reparse_point(_path: &Path) -> bool {
    false
}

impl DiskImaging for PowerShellImaging {
    fn name(&self) -> &'static str {
        "powershell"
    }

    fn mount_point_in_use(&self, mount_point: &Path) -> Result<bool, ImagingError> {
        if is_drive_root(mount_point) {
            return Ok(mount_point.exists());
        }
        Ok(is_reparse_point(mount_point))
    }

    fn create_differencing(&self, child: &Path, parent: &Path) -> Result<(), ImagingError> {
        self.diskpart(&diskpart_create_script(child, parent))
    }

    fn attach(&self, image: &Path) -> Result<Vec<Volume>, ImagingError> {
        let out = self.powershell(&attach_script(image))?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && l.chars().all(|c| c.is_ascii_digit()))
            .map(|n| Volume {
                id: n.to_string(),
                device: None,
            })
            .collect())
    }

    fn bind(&self, image: &Path, volume: &Volume, mount_point: &Path) -> Result<(), ImagingError> {
        if !is_drive_root(mount_point) {
            fs::create_dir_all(mount_point)?;
        }
        self.powershell(&bind_script(image, &volume.id, mount_point))?;
        Ok(())
    }

    fn detach(&self, image: &Path) -> Result<(), ImagingError> {
        self.powershell(&detach_script(image))?;
        Ok(())
    }

    fn reclaim_foreign_handles(&self, mount_point: &Path) -> Result<usize, ImagingError> {
        let out = self.powershell(&reclaim_script(mount_point))?;
        Ok(out.lines().last().and_then(|l| l.trim().parse().ok()).unwrap_or(0))
    }
}
