use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::BackendKind;
use crate::helper::HelperArgs;

#[derive(Parser, Debug)]
#[command(
    name = "vdm",
    about = "Mounts a read-only disk image as a disposable session volume"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Mount an image, hold it until Ctrl-C, then release it
    Session(SessionArgs),
    /// Print where the overlay for a patch image is created
    RuntimePath(RuntimePathArgs),
    #[command(hide = true)]
    Helper(HelperArgs),
}

#[derive(Parser, Debug)]
pub struct SessionArgs {
    /// Image configuration (JSON with base_path, patch_path, delta_enabled)
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,

    /// Mount the patch image itself instead of a disposable overlay
    #[arg(long)]
    pub no_delta: bool,

    /// Overrides the configured mount point
    #[arg(short, long, value_name = "PATH")]
    pub mount_point: Option<PathBuf>,

    /// Overrides the configured imaging backend
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Always go through a helper process, even when already privileged
    #[arg(long)]
    pub force_helper: bool,
}

#[derive(Parser, Debug)]
pub struct RuntimePathArgs {
    #[arg(value_name = "PATCH")]
    pub patch: PathBuf,
}
