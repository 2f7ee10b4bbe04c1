pub mod session;

pub use session::session;

use libvdisk::overlay;

use crate::args::RuntimePathArgs;

pub fn runtime_path(args: RuntimePathArgs) -> anyhow::Result<()> {
    println!("{}", overlay::runtime_path_for(&args.patch).display());
    Ok(())
}
