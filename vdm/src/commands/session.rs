use anyhow::Context;

use crate::args::SessionArgs;
use crate::config::Config;
use crate::image_config;
use crate::orchestrator::{self, ProcessLauncher};
use crate::rt;

pub fn session(args: SessionArgs) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(mount_point) = args.mount_point {
        config.mount_point = mount_point;
    }
    if let Some(backend) = args.backend {
        config.backend = backend;
    }

    let image_cfg = image_config::load(&args.config)?;
    let mut image = image_config::resolve(&args.config, &image_cfg)?;
    if args.no_delta {
        image.delta_enabled = false;
    }

    let (handle, paths) = if args.force_helper {
        let launcher = ProcessLauncher::from_config(&config)?;
        orchestrator::mount_via_helper(&launcher, &config, &image)?
    } else {
        orchestrator::mount_with_elevation(&config, &image)?
    };
    tracing::info!(
        "Session volume {} is available at {}",
        paths.mount_path.display(),
        config.mount_point.display()
    );
    println!("{}", config.mount_point.display());

    let waited = rt::wait_for_ctrl_c();
    tracing::info!("Releasing session");
    handle
        .unmount(config.teardown_timeout())
        .context("Failed to release the session")?;
    waited
}
