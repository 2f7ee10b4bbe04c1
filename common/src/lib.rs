use std::ffi::OsString;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error text written to the result artifact when a required path is absent.
pub const MISSING_ARGUMENTS: &str = "Missing arguments";

/// The three filesystem locations the orchestrator and the helper talk through.
///
/// Each one is written exactly once. `result` carries a [`MountResult`], `signal` and
/// `done` are presence-only markers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    pub result: PathBuf,
    pub signal: PathBuf,
    pub done: PathBuf,
}

impl ArtifactPaths {
    pub fn in_dir(dir: &Path, tag: &str) -> Self {
        ArtifactPaths {
            result: dir.join(format!("vdm_result_{tag}.json")),
            signal: dir.join(format!("vdm_signal_{tag}.flag")),
            done: dir.join(format!("vdm_done_{tag}.flag")),
        }
    }
}

/// One mount session as requested by the orchestrator. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountRequest {
    /// Advisory only; the base is never opened for writing.
    pub base_path: Option<PathBuf>,
    /// Mounted directly, or used as the parent of the differencing overlay.
    pub patch_path: PathBuf,
    pub use_delta: bool,
    pub artifacts: ArtifactPaths,
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("{}", MISSING_ARGUMENTS)]
pub struct MissingArguments;

impl MountRequest {
    /// Builds a request, rejecting it when any of the four required paths is empty.
    pub fn new(
        base_path: Option<PathBuf>,
        patch_path: PathBuf,
        use_delta: bool,
        artifacts: ArtifactPaths,
    ) -> Result<Self, MissingArguments> {
        let required = [
            patch_path.as_path(),
            artifacts.result.as_path(),
            artifacts.signal.as_path(),
            artifacts.done.as_path(),
        ];
        if required.iter().any(|p| p.as_os_str().is_empty()) {
            return Err(MissingArguments);
        }
        Ok(MountRequest {
            base_path: base_path.filter(|p| !p.as_os_str().is_empty()),
            patch_path,
            use_delta,
            artifacts,
        })
    }

    /// Command line understood by `vdm helper`.
    pub fn to_helper_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::with_capacity(12);
        if let Some(base) = &self.base_path {
            args.push("--base".into());
            args.push(base.into());
        }
        args.push("--patch".into());
        args.push(self.patch_path.clone().into());
        args.push("--delta".into());
        args.push(if self.use_delta { "1" } else { "0" }.into());
        args.push("--result".into());
        args.push(self.artifacts.result.clone().into());
        args.push("--signal".into());
        args.push(self.artifacts.signal.clone().into());
        args.push("--done".into());
        args.push(self.artifacts.done.clone().into());
        args
    }
}

/// Record written once by the helper to the result artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountResult {
    pub ok: bool,
    pub mount_path: Option<String>,
    pub runtime_path: Option<String>,
    pub error: Option<String>,
}

/// Paths of a session that reported success.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountedPaths {
    pub mount_path: PathBuf,
    pub runtime_path: Option<PathBuf>,
}

impl MountResult {
    pub fn success(mount_path: &Path, runtime_path: Option<&Path>) -> Self {
        MountResult {
            ok: true,
            mount_path: Some(mount_path.to_string_lossy().into_owned()),
            runtime_path: runtime_path.map(|p| p.to_string_lossy().into_owned()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        MountResult {
            ok: false,
            mount_path: None,
            runtime_path: None,
            error: Some(error.into()),
        }
    }

    /// Compact JSON without a byte-order mark.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(data: &str) -> serde_json::Result<Self> {
        let trimmed = data.trim();
        let trimmed = trimmed.strip_prefix('\u{feff}').unwrap_or(trimmed);
        serde_json::from_str(trimmed)
    }

    /// Exactly one of `ok == true` or a non-null `error` must hold; anything else is
    /// reported as a failure.
    pub fn into_outcome(self) -> Result<MountedPaths, String> {
        match (self.ok, self.error, self.mount_path) {
            (true, None, Some(mount_path)) => Ok(MountedPaths {
                mount_path: PathBuf::from(mount_path),
                runtime_path: self.runtime_path.map(PathBuf::from),
            }),
            (true, None, None) => {
                Err("Mount helper reported success without a mount path".to_string())
            }
            (true, Some(error), _) => Err(format!(
                "Mount helper reported an inconsistent result: {error}"
            )),
            (false, Some(error), _) => Err(error),
            (false, None, _) => Err("Mount helper failed".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifacts() -> ArtifactPaths {
        ArtifactPaths::in_dir(Path::new("/tmp"), "t1")
    }

    #[test]
    fn test_request_rejects_empty_paths() {
        let mut paths = artifacts();
        paths.signal = PathBuf::new();
        let res = MountRequest::new(None, PathBuf::from("/img/title.vhd"), true, paths);
        assert_eq!(res.unwrap_err(), MissingArguments);

        let res = MountRequest::new(None, PathBuf::new(), true, artifacts());
        assert!(res.is_err());
        assert_eq!(MissingArguments.to_string(), "Missing arguments");
    }

    #[test]
    fn test_request_drops_empty_base() {
        let req = MountRequest::new(
            Some(PathBuf::new()),
            PathBuf::from("/img/title.vhd"),
            false,
            artifacts(),
        )
        .unwrap();
        assert!(req.base_path.is_none());
        let args = req.to_helper_args();
        assert!(!args.contains(&OsString::from("--base")));
        assert_eq!(args[0], OsString::from("--patch"));
        assert_eq!(args[3], OsString::from("0"));
    }

    #[test]
    fn test_result_json_shape() {
        let overlay = Path::new("/img/title-runtime.vhd");
        let res = MountResult::success(overlay, Some(overlay));
        let json = res.to_json().unwrap();
        assert!(!json.starts_with('\u{feff}'));
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["ok"], true);
        assert_eq!(value["mount_path"], "/img/title-runtime.vhd");
        assert_eq!(value["runtime_path"], "/img/title-runtime.vhd");
        assert!(value["error"].is_null());
    }

    #[test]
    fn test_result_parse_tolerates_bom() {
        let data = concat!(
            "\u{feff}",
            r#"{"ok":false,"mount_path":null,"runtime_path":null,"error":"boom"}"#,
            "\r\n"
        );
        let res = MountResult::from_json(data).unwrap();
        assert_eq!(res.into_outcome().unwrap_err(), "boom");
    }

    #[test]
    fn test_inconsistent_results_are_failures() {
        let res = MountResult {
            ok: true,
            mount_path: None,
            runtime_path: None,
            error: None,
        };
        assert!(res.into_outcome().is_err());

        let res = MountResult {
            ok: false,
            mount_path: Some("/x".into()),
            runtime_path: None,
            error: None,
        };
        assert_eq!(res.into_outcome().unwrap_err(), "Mount helper failed");
    }
}
