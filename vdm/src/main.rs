use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use vdm::args::{Cli, Commands};
use vdm::{commands, helper};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let res = match cli.command {
        Commands::Helper(args) => return ExitCode::from(helper::main(args)),
        Commands::Session(args) => commands::session(args),
        Commands::RuntimePath(args) => commands::runtime_path(args),
    };
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e:?}");
            ExitCode::FAILURE
        }
    }
}
