//! The privileged helper process.
//!
//! One helper instance owns one session: it mounts, reports, blocks until the
//! orchestrator raises the signal artifact, tears down and raises the done artifact.

use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use clap::Parser;
use common::{ArtifactPaths, MissingArguments, MountRequest, MountResult};
use libvdisk::overlay::{self, OverlayGuard};
use libvdisk::{DiskImaging, ImagingError, guard};

use crate::artifact::{FileArtifact, PollOptions, Signal};
use crate::config::{BackendKind, Config};
use crate::error::SessionError;
use crate::teardown;

pub const EXIT_OK: u8 = 0;
/// The mount failed and the failure was written to the result artifact.
pub const EXIT_REPORTED: u8 = 1;
/// Nothing could be reported: the result path was unknown or unwritable.
pub const EXIT_UNREPORTED: u8 = 2;
/// Teardown ran but the done artifact could not be raised.
pub const EXIT_DONE_UNWRITTEN: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ParseArgs,
    CheckMountPointFree,
    PrepareSource,
    Mount,
    ReclaimForeignHandles,
    ReportSuccess,
    ReportError,
    AwaitSignal,
    Teardown,
    Done,
}

fn parse_flag(value: &str) -> Result<bool, String> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(format!("expected 1/0 or true/false, got `{other}`")),
    }
}

/// Every path is optional here so a missing one is reported through the result artifact
/// instead of a usage error.
#[derive(Parser, Debug, Clone)]
pub struct HelperArgs {
    /// Base image, advisory only
    #[arg(long, value_name = "PATH")]
    pub base: Option<PathBuf>,

    /// Image to mount, or the parent of the overlay when delta is on
    #[arg(long, value_name = "PATH")]
    pub patch: Option<PathBuf>,

    /// Mount a disposable differencing overlay instead of the patch itself
    #[arg(
        long,
        value_name = "BOOL",
        default_value = "1",
        value_parser = parse_flag,
        action = clap::ArgAction::Set
    )]
    pub delta: bool,

    #[arg(long, value_name = "PATH")]
    pub result: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    pub signal: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    pub done: Option<PathBuf>,

    #[arg(long, value_name = "PATH")]
    pub mount_point: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    #[arg(long, value_name = "MS")]
    pub poll_interval_ms: Option<u64>,

    #[arg(long, value_name = "MS")]
    pub settle_delay_ms: Option<u64>,

    #[arg(long = "reclaim-process", value_name = "NAME")]
    pub reclaim_process: Vec<String>,
}

impl HelperArgs {
    pub fn to_request(&self) -> Result<MountRequest, MissingArguments> {
        let (Some(patch), Some(result), Some(signal), Some(done)) =
            (&self.patch, &self.result, &self.signal, &self.done)
        else {
            return Err(MissingArguments);
        };
        MountRequest::new(
            self.base.clone(),
            patch.clone(),
            self.delta,
            ArtifactPaths {
                result: result.clone(),
                signal: signal.clone(),
                done: done.clone(),
            },
        )
    }

    /// Defaults overridden by whatever the orchestrator passed along.
    pub fn config(&self) -> Config {
        let mut config = Config::default();
        if let Some(mount_point) = &self.mount_point {
            config.mount_point = mount_point.clone();
        }
        if let Some(backend) = self.backend {
            config.backend = backend;
        }
        if let Some(ms) = self.poll_interval_ms {
            config.poll_interval_ms = ms;
        }
        if let Some(ms) = self.settle_delay_ms {
            config.settle_delay_ms = ms;
        }
        if !self.reclaim_process.is_empty() {
            config.reclaim_process_names = self.reclaim_process.clone();
        }
        config
    }

    /// Arguments that carry `config` over to the helper's command line.
    pub fn config_args(config: &Config) -> Vec<std::ffi::OsString> {
        let mut args: Vec<std::ffi::OsString> = vec![
            "--mount-point".into(),
            config.mount_point.clone().into(),
            "--backend".into(),
            match config.backend {
                BackendKind::Native => "native",
                BackendKind::Simulated => "simulated",
            }
            .into(),
            "--poll-interval-ms".into(),
            config.poll_interval_ms.to_string().into(),
            "--settle-delay-ms".into(),
            config.settle_delay_ms.to_string().into(),
        ];
        for name in &config.reclaim_process_names {
            args.push("--reclaim-process".into());
            args.push(name.into());
        }
        args
    }
}

/// What a successful mount holds on to until teardown.
#[derive(Debug)]
pub struct MountedSession {
    mount_path: PathBuf,
    overlay: Option<OverlayGuard>,
}

impl MountedSession {
    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    pub fn runtime_path(&self) -> Option<&Path> {
        self.overlay.as_ref().map(OverlayGuard::path)
    }

    pub fn to_result(&self) -> MountResult {
        MountResult::success(&self.mount_path, self.runtime_path())
    }

    pub(crate) fn into_parts(self) -> (PathBuf, Option<OverlayGuard>) {
        (self.mount_path, self.overlay)
    }
}

/// Mount-phase state: which phase we are in and where the volume goes.
pub struct Session<'a> {
    backend: &'a dyn DiskImaging,
    mount_point: PathBuf,
    settle_delay: Duration,
    phase: Phase,
}

impl<'a> Session<'a> {
    pub fn new(
        backend: &'a dyn DiskImaging,
        mount_point: PathBuf,
        settle_delay: Duration,
    ) -> Self {
        Session {
            backend,
            mount_point,
            settle_delay,
            phase: Phase::ParseArgs,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }

    fn enter(&mut self, phase: Phase) {
        tracing::debug!("{:?} -> {:?}", self.phase, phase);
        self.phase = phase;
    }

    pub fn mount(&mut self, request: &MountRequest) -> Result<MountedSession, SessionError> {
        self.mount_source(
            request.base_path.as_deref(),
            &request.patch_path,
            request.use_delta,
        )
    }

    /// Runs the mount phases. On error nothing acquired here is left behind: a partial
    /// binding is detached and a fresh overlay is deleted.
    pub fn mount_source(
        &mut self,
        base: Option<&Path>,
        patch: &Path,
        use_delta: bool,
    ) -> Result<MountedSession, SessionError> {
        if let Some(base) = base
            && !base.exists()
        {
            tracing::warn!("Base image {} does not exist", base.display());
        }

        self.enter(Phase::CheckMountPointFree);
        guard::ensure_free(self.backend, &self.mount_point)
            .map_err(|e| SessionError::from_guard(self.mount_point.clone(), e))?;

        self.enter(Phase::PrepareSource);
        let overlay = if use_delta {
            Some(
                overlay::prepare_overlay(self.backend, patch)
                    .map_err(SessionError::ImageCreation)?,
            )
        } else {
            None
        };
        let source = overlay
            .as_ref()
            .map(|o| o.path().to_path_buf())
            .unwrap_or_else(|| patch.to_path_buf());

        self.enter(Phase::Mount);
        if let Err(source_err) = self.attach_and_bind(&source) {
            if let Err(e) = self.backend.detach(&source) {
                tracing::warn!("Rollback of {} failed: {e}", source.display());
            }
            drop(overlay);
            return Err(SessionError::Mount {
                path: source,
                source: source_err,
            });
        }
        tracing::info!(
            "Mounted {} at {}",
            source.display(),
            self.mount_point.display()
        );

        self.enter(Phase::ReclaimForeignHandles);
        if let Err(e) = self.reclaim_foreign_handles() {
            tracing::warn!("{e}");
        }

        Ok(MountedSession {
            mount_path: source,
            overlay,
        })
    }

    fn attach_and_bind(&self, source: &Path) -> Result<(), ImagingError> {
        let volumes = self.backend.attach(source)?;
        let volume = volumes
            .first()
            .ok_or_else(|| ImagingError::NoVolumes(source.to_path_buf()))?;
        self.backend.bind(source, volume, &self.mount_point)
    }

    fn reclaim_foreign_handles(&self) -> Result<(), SessionError> {
        sleep(self.settle_delay);
        let asked = self
            .backend
            .reclaim_foreign_handles(&self.mount_point)
            .map_err(|source| SessionError::ForeignHandleReclaim {
                path: self.mount_point.clone(),
                source,
            })?;
        if asked > 0 {
            tracing::info!(
                "Asked {asked} holder(s) of {} to close",
                self.mount_point.display()
            );
        }
        Ok(())
    }
}

/// Entry point of `vdm helper`, returns the process exit status.
pub fn main(args: HelperArgs) -> u8 {
    let config = args.config();
    let backend = config.imaging();
    tracing::debug!("Helper using the {} backend", backend.name());
    run(&args, &config, backend.as_ref())
}

/// The whole helper lifecycle against `backend`.
pub fn run(args: &HelperArgs, config: &Config, backend: &dyn DiskImaging) -> u8 {
    let request = match args.to_request() {
        Ok(request) => request,
        Err(MissingArguments) => {
            let err = SessionError::Arguments;
            tracing::error!("{err}: {args:?}");
            return match &args.result {
                Some(result) => {
                    let failure = MountResult::failure(err.to_string());
                    report(&FileArtifact::new(result), &failure);
                    EXIT_REPORTED
                }
                None => EXIT_UNREPORTED,
            };
        }
    };
    let artifacts = &request.artifacts;
    let result = FileArtifact::new(&artifacts.result);
    let mut session = Session::new(
        backend,
        config.mount_point.clone(),
        config.settle_delay(),
    );

    let mounted = match session.mount(&request) {
        Ok(mounted) => mounted,
        Err(e) => {
            session.enter(Phase::ReportError);
            tracing::error!("{e}");
            report(&result, &MountResult::failure(e.to_string()));
            return EXIT_REPORTED;
        }
    };

    session.enter(Phase::ReportSuccess);
    if let Err(e) = result.publish_result(&mounted.to_result()) {
        tracing::error!("Failed to write {}: {e}", result.path().display());
        teardown::teardown(backend, mounted);
        return EXIT_UNREPORTED;
    }

    session.enter(Phase::AwaitSignal);
    let signal = FileArtifact::new(&artifacts.signal);
    // Unbounded, so a timeout is impossible.
    let _ = signal.wait(&PollOptions::unbounded(config.poll_interval()));

    session.enter(Phase::Teardown);
    let report = teardown::teardown(backend, mounted);
    if !report.is_clean() {
        tracing::warn!("Teardown finished with {} warning(s)", report.warnings.len());
    }

    session.enter(Phase::Done);
    if let Err(e) = FileArtifact::new(&artifacts.done).raise() {
        tracing::error!("Failed to raise {}: {e}", artifacts.done.display());
        return EXIT_DONE_UNWRITTEN;
    }
    EXIT_OK
}

fn report(result: &FileArtifact, value: &MountResult) {
    if let Err(e) = result.publish_result(value) {
        tracing::error!("Failed to write {}: {e}", result.path().display());
    }
}
