//! The unprivileged side of a session.
//!
//! When this process may not touch the imaging facilities it re-executes itself as
//! `vdm helper` with privileges and talks to that helper only through the result, signal
//! and done artifacts.

use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use anyhow::Context;
use common::{ArtifactPaths, MountRequest, MountResult, MountedPaths};
use libvdisk::DiskImaging;
use uuid::Uuid;

use crate::artifact::{FileArtifact, PollOptions, Signal, wait_until};
use crate::config::Config;
use crate::error::SessionError;
use crate::helper::{HelperArgs, MountedSession, Session};
use crate::image_config::ResolvedImage;
use crate::teardown;

/// Starts a helper with the given arguments (everything after `vdm helper`).
///
/// Returns the child when there is one to reap; elevation mechanisms that detach from the
/// helper return `None`.
pub trait HelperLauncher {
    fn launch(&self, args: Vec<OsString>) -> anyhow::Result<Option<Child>>;
}

/// Launches `<exe> helper ...`, optionally through the platform's elevation mechanism.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    exe: PathBuf,
    elevate: bool,
    #[cfg_attr(windows, allow(dead_code))]
    elevate_with: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(exe: impl Into<PathBuf>) -> Self {
        ProcessLauncher {
            exe: exe.into(),
            elevate: false,
            elevate_with: Vec::new(),
        }
    }

    /// The configured helper executable (or this one), elevated unless we already are.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let exe = match &config.helper_exe {
            Some(exe) => exe.clone(),
            None => std::env::current_exe().context("Failed to locate the vdm executable")?,
        };
        Ok(ProcessLauncher {
            exe,
            elevate: !Config::is_privileged(),
            elevate_with: config.elevate_with.clone(),
        })
    }

    pub fn elevated(mut self, elevate: bool) -> Self {
        self.elevate = elevate;
        self
    }

    fn helper_args(args: Vec<OsString>) -> Vec<OsString> {
        std::iter::once(OsString::from("helper")).chain(args).collect()
    }

    #[cfg(windows)]
    fn launch_elevated(&self, args: Vec<OsString>) -> anyhow::Result<Option<Child>> {
        use libvdisk::backend::windows::ps_quote;

        let list = Self::helper_args(args)
            .iter()
            .map(|arg| {
                let arg = arg.to_string_lossy();
                if arg.contains(' ') {
                    ps_quote(&format!("\"{arg}\""))
                } else {
                    ps_quote(&arg)
                }
            })
            .collect::<Vec<_>>()
            .join(",");
        let script = format!(
            "Start-Process -FilePath {} -ArgumentList @({list}) -Verb RunAs -WindowStyle Hidden",
            ps_quote(&self.exe.to_string_lossy()),
        );
        let mut command = libvdisk::command::quiet("powershell");
        command.args(["-NoProfile", "-NonInteractive", "-Command", &script]);
        libvdisk::command::run(&mut command).context("Failed to start elevated helper")?;
        Ok(None)
    }

    #[cfg(not(windows))]
    fn launch_elevated(&self, args: Vec<OsString>) -> anyhow::Result<Option<Child>> {
        let Some((program, prefix)) = self.elevate_with.split_first() else {
            anyhow::bail!("No elevation command configured");
        };
        let child = Command::new(program)
            .args(prefix)
            .arg(&self.exe)
            .args(Self::helper_args(args))
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn `{program}`"))?;
        Ok(Some(child))
    }
}

impl HelperLauncher for ProcessLauncher {
    fn launch(&self, args: Vec<OsString>) -> anyhow::Result<Option<Child>> {
        if self.elevate {
            return self.launch_elevated(args);
        }
        let child = Command::new(&self.exe)
            .args(Self::helper_args(args))
            .stdin(Stdio::null())
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.exe.display()))?;
        Ok(Some(child))
    }
}

/// One helper-backed session as seen from the orchestrator.
#[derive(Debug)]
pub struct HelperSession {
    artifacts: ArtifactPaths,
    poll_interval: Duration,
    child: Option<Child>,
}

impl HelperSession {
    /// Launches a helper and waits for its result.
    ///
    /// The session is returned even on failure: a helper that is late or wrote garbage has
    /// already been told to unwind, and [`HelperSession::release`] still has to run.
    pub fn request_mount(
        launcher: &dyn HelperLauncher,
        config: &Config,
        base: Option<&Path>,
        patch: &Path,
        use_delta: bool,
    ) -> (HelperSession, MountResult) {
        let tag = Uuid::new_v4().simple().to_string();
        let artifacts = ArtifactPaths::in_dir(&std::env::temp_dir(), &tag);
        Self::request_mount_with(launcher, config, artifacts, base, patch, use_delta)
    }

    /// Like [`HelperSession::request_mount`] with caller-chosen artifact paths.
    pub fn request_mount_with(
        launcher: &dyn HelperLauncher,
        config: &Config,
        artifacts: ArtifactPaths,
        base: Option<&Path>,
        patch: &Path,
        use_delta: bool,
    ) -> (HelperSession, MountResult) {
        let mut session = HelperSession {
            artifacts: artifacts.clone(),
            poll_interval: config.poll_interval(),
            child: None,
        };
        let request = match MountRequest::new(
            base.map(Path::to_path_buf),
            patch.to_path_buf(),
            use_delta,
            artifacts,
        ) {
            Ok(request) => request,
            Err(e) => return (session, MountResult::failure(e.to_string())),
        };

        let mut args = request.to_helper_args();
        args.extend(HelperArgs::config_args(config));
        match launcher.launch(args) {
            Ok(child) => session.child = child,
            Err(e) => {
                let err = SessionError::Launch(format!("{e:#}"));
                tracing::error!("{err}");
                return (session, MountResult::failure(err.to_string()));
            }
        }

        let poll = PollOptions::bounded(session.poll_interval, config.result_timeout());
        let result = session.await_result(&poll);
        (session, result)
    }

    fn await_result(&mut self, poll: &PollOptions) -> MountResult {
        let artifact = FileArtifact::new(&self.artifacts.result);
        let waited = wait_until(poll, || {
            // Check the child first: it may write the result and exit between the two
            // checks, never the other way round.
            let exited = self.child_exit_status();
            if artifact.is_raised() {
                return Some(Ok(()));
            }
            exited.map(|status| {
                Err(format!(
                    "mount helper exited with {status} without a result"
                ))
            })
        });

        let err = match waited {
            Ok(Ok(())) => match artifact.read() {
                Ok(data) => match MountResult::from_json(&data) {
                    Ok(result) => return result,
                    Err(e) => SessionError::ResultParse(e.to_string()),
                },
                Err(e) => SessionError::ResultParse(e.to_string()),
            },
            Ok(Err(exited)) => SessionError::Reported(exited),
            Err(_) => SessionError::HelperTimeout,
        };
        tracing::error!("{err}");
        // The helper may still mount later; make sure it unwinds right away if it does.
        if let Err(e) = self.signal_teardown() {
            tracing::warn!("Failed to raise {}: {e}", self.artifacts.signal.display());
        }
        MountResult::failure(err.to_string())
    }

    fn child_exit_status(&mut self) -> Option<std::process::ExitStatus> {
        self.child.as_mut().and_then(|c| c.try_wait().ok().flatten())
    }

    pub fn artifacts(&self) -> &ArtifactPaths {
        &self.artifacts
    }

    /// Tells the helper to tear down. May be called before the result was consumed.
    pub fn signal_teardown(&self) -> io::Result<()> {
        FileArtifact::new(&self.artifacts.signal).raise()
    }

    /// Whether the helper raised done within `timeout`.
    pub fn await_teardown_complete(&self, timeout: Duration) -> bool {
        let poll = PollOptions::bounded(self.poll_interval, timeout);
        FileArtifact::new(&self.artifacts.done).wait(&poll).is_ok()
    }

    /// Deletes the artifacts and reaps the helper if it has exited.
    ///
    /// A raised signal without a matching done is kept while the helper may still be
    /// running, so it sees the signal and unwinds.
    pub fn release(mut self) {
        let exited = self.child_exit_status();
        let signal = FileArtifact::new(&self.artifacts.signal);
        let done = FileArtifact::new(&self.artifacts.done);
        let keep_signal = signal.is_raised() && !done.is_raised() && exited.is_none();

        for artifact in [FileArtifact::new(&self.artifacts.result), done] {
            if let Err(e) = artifact.clear() {
                tracing::warn!("Failed to remove {}: {e}", artifact.path().display());
            }
        }
        if keep_signal {
            tracing::warn!(
                "Helper did not finish, leaving {} in place",
                signal.path().display()
            );
        } else if let Err(e) = signal.clear() {
            tracing::warn!("Failed to remove {}: {e}", signal.path().display());
        }

        if let Some(status) = exited {
            tracing::debug!("Mount helper exited with {status}");
        }
    }
}

/// An in-process session, used when this process is already privileged.
pub struct DirectMount {
    backend: Box<dyn DiskImaging>,
    mounted: MountedSession,
}

pub enum MountHandle {
    Direct(DirectMount),
    Helper(HelperSession),
}

impl MountHandle {
    /// Releases the session. Direct teardown only warns; a helper that does not raise done
    /// within `timeout` is an error.
    pub fn unmount(self, timeout: Duration) -> Result<(), SessionError> {
        match self {
            MountHandle::Direct(DirectMount { backend, mounted }) => {
                let report = teardown::teardown(backend.as_ref(), mounted);
                if !report.is_clean() {
                    tracing::warn!("Teardown finished with {} warning(s)", report.warnings.len());
                }
                Ok(())
            }
            MountHandle::Helper(session) => {
                let raised = session.signal_teardown();
                let finished = raised.is_ok() && session.await_teardown_complete(timeout);
                session.release();
                raised?;
                if finished {
                    Ok(())
                } else {
                    Err(SessionError::TeardownTimeout)
                }
            }
        }
    }
}

/// Mounts `image` in process when privileged, through a helper otherwise.
pub fn mount_with_elevation(
    config: &Config,
    image: &ResolvedImage,
) -> Result<(MountHandle, MountedPaths), SessionError> {
    if Config::is_privileged() {
        return mount_direct(config, image);
    }
    let launcher =
        ProcessLauncher::from_config(config).map_err(|e| SessionError::Launch(format!("{e:#}")))?;
    mount_via_helper(&launcher, config, image)
}

pub fn mount_direct(
    config: &Config,
    image: &ResolvedImage,
) -> Result<(MountHandle, MountedPaths), SessionError> {
    let backend = config.imaging();
    let mounted = Session::new(
        backend.as_ref(),
        config.mount_point.clone(),
        config.settle_delay(),
    )
    .mount_source(
        Some(&image.base_path),
        &image.patch_path,
        image.delta_enabled,
    )?;
    let paths = MountedPaths {
        mount_path: mounted.mount_path().to_path_buf(),
        runtime_path: mounted.runtime_path().map(Path::to_path_buf),
    };
    Ok((MountHandle::Direct(DirectMount { backend, mounted }), paths))
}

pub fn mount_via_helper(
    launcher: &dyn HelperLauncher,
    config: &Config,
    image: &ResolvedImage,
) -> Result<(MountHandle, MountedPaths), SessionError> {
    let (session, result) = HelperSession::request_mount(
        launcher,
        config,
        Some(&image.base_path),
        &image.patch_path,
        image.delta_enabled,
    );
    let claimed_success = result.ok;
    match result.into_outcome() {
        Ok(paths) => Ok((MountHandle::Helper(session), paths)),
        Err(e) => {
            // A helper that believes it mounted sits in AwaitSignal with the volume bound.
            if claimed_success {
                tracing::warn!("Rejecting helper result, asking it to release the volume");
                match session.signal_teardown() {
                    Ok(()) => {
                        if !session.await_teardown_complete(config.teardown_timeout()) {
                            tracing::warn!("Mount helper did not release the rejected session");
                        }
                    }
                    Err(e) => tracing::warn!(
                        "Failed to raise {}: {e}",
                        session.artifacts().signal.display()
                    ),
                }
            }
            session.release();
            Err(SessionError::Reported(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::Mutex;

    use super::*;

    /// Writes a canned result instead of starting anything.
    struct Canned {
        result: Option<String>,
        launched: Mutex<Vec<OsString>>,
    }

    impl HelperLauncher for Canned {
        fn launch(&self, args: Vec<OsString>) -> anyhow::Result<Option<Child>> {
            let at = args.iter().position(|a| a == "--result").unwrap();
            if let Some(result) = &self.result {
                FileArtifact::new(PathBuf::from(&args[at + 1]))
                    .publish(result.as_bytes())
                    .unwrap();
            }
            *self.launched.lock().unwrap() = args;
            Ok(None)
        }
    }

    struct Failing;

    impl HelperLauncher for Failing {
        fn launch(&self, _: Vec<OsString>) -> anyhow::Result<Option<Child>> {
            anyhow::bail!("user declined elevation")
        }
    }

    /// Starts a process that exits at once without writing anything.
    #[cfg(unix)]
    struct Exiting;

    #[cfg(unix)]
    impl HelperLauncher for Exiting {
        fn launch(&self, _: Vec<OsString>) -> anyhow::Result<Option<Child>> {
            Ok(Some(Command::new("sh").args(["-c", "exit 0"]).spawn()?))
        }
    }

    fn config() -> Config {
        Config {
            poll_interval_ms: 5,
            result_timeout_secs: 0,
            ..Config::default()
        }
    }

    fn request(launcher: &dyn HelperLauncher, dir: &Path) -> (HelperSession, MountResult) {
        HelperSession::request_mount_with(
            launcher,
            &config(),
            ArtifactPaths::in_dir(dir, "t"),
            None,
            Path::new("/g/title.vhd"),
            true,
        )
    }

    #[test]
    fn test_result_is_consumed() {
        let tmp = tempfile::tempdir().unwrap();
        let json = MountResult::success(Path::new("/g/title-runtime.vhd"), None)
            .to_json()
            .unwrap();
        let launcher = Canned {
            result: Some(json),
            launched: Mutex::default(),
        };

        let (session, result) = request(&launcher, tmp.path());
        assert!(result.ok);
        let args = launcher.launched.lock().unwrap().clone();
        assert!(args.contains(&OsString::from("--mount-point")));
        assert!(!session.artifacts().signal.exists());

        session.release();
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_timeout_raises_signal() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = Canned {
            result: None,
            launched: Mutex::default(),
        };

        let (session, result) = request(&launcher, tmp.path());
        assert!(!result.ok);
        assert_eq!(
            result.error.as_deref(),
            Some("Timed out waiting for mount helper")
        );
        let signal = session.artifacts().signal.clone();
        assert!(signal.exists());

        // no done yet, the signal outlives the session
        session.release();
        assert!(signal.exists());
    }

    #[test]
    fn test_garbage_result_is_a_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let launcher = Canned {
            result: Some("not json".to_string()),
            launched: Mutex::default(),
        };
        let (session, result) = request(&launcher, tmp.path());
        assert!(!result.ok);
        assert!(result.error.unwrap().starts_with("Failed to parse mount helper result"));
        assert!(session.artifacts().signal.exists());
    }

    #[test]
    fn test_launch_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let (session, result) = request(&Failing, tmp.path());
        assert!(!result.ok);
        assert_eq!(
            result.error.as_deref(),
            Some("Failed to launch mount helper: user declined elevation")
        );
        assert!(!session.artifacts().signal.exists());
        session.release();
    }

    #[test]
    fn test_unmount_times_out_without_done() {
        let tmp = tempfile::tempdir().unwrap();
        let session = HelperSession {
            artifacts: ArtifactPaths::in_dir(tmp.path(), "t"),
            poll_interval: Duration::from_millis(5),
            child: None,
        };
        let err = MountHandle::Helper(session)
            .unmount(Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, SessionError::TeardownTimeout));
    }

    #[test]
    fn test_unmount_after_done() {
        let tmp = tempfile::tempdir().unwrap();
        let artifacts = ArtifactPaths::in_dir(tmp.path(), "t");
        FileArtifact::new(&artifacts.done).raise().unwrap();
        let session = HelperSession {
            artifacts,
            poll_interval: Duration::from_millis(5),
            child: None,
        };
        MountHandle::Helper(session)
            .unmount(Duration::from_millis(20))
            .unwrap();
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_rejected_success_asks_helper_to_release() {
        let launcher = Canned {
            result: Some(
                r#"{"ok":true,"mount_path":null,"runtime_path":null,"error":null}"#.to_string(),
            ),
            launched: Mutex::default(),
        };
        let config = Config {
            teardown_timeout_secs: 0,
            ..config()
        };
        let image = ResolvedImage {
            base_path: PathBuf::from("/g/base.vhd"),
            patch_path: PathBuf::from("/g/title.vhd"),
            delta_enabled: true,
        };

        let err = mount_via_helper(&launcher, &config, &image).err().unwrap();
        assert_eq!(
            err.to_string(),
            "Mount helper reported success without a mount path"
        );
        let args = launcher.launched.lock().unwrap().clone();
        let at = args.iter().position(|a| a == "--signal").unwrap();
        let signal = PathBuf::from(&args[at + 1]);
        // still raised: the helper has not answered with done yet
        assert!(signal.exists());
        fs::remove_file(signal).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_exited_helper_leaves_no_signal() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config {
            result_timeout_secs: 10,
            ..config()
        };
        let (session, result) = HelperSession::request_mount_with(
            &Exiting,
            &config,
            ArtifactPaths::in_dir(tmp.path(), "t"),
            None,
            Path::new("/g/title.vhd"),
            true,
        );
        assert!(!result.ok);
        assert!(result.error.unwrap().contains("without a result"));
        assert!(session.artifacts().signal.exists());

        session.release();
        assert_eq!(fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unwritable_signal_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let session = HelperSession {
            artifacts: ArtifactPaths::in_dir(&tmp.path().join("gone"), "t"),
            poll_interval: Duration::from_millis(5),
            child: None,
        };
        let err = MountHandle::Helper(session)
            .unmount(Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, SessionError::Io(_)));
    }
}
