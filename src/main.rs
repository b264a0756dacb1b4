mod cli;
mod commands;

use std::env;
use std::process::ExitCode;

use clap::Parser;

use crate::cli::{Cli, Command};

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Some(mode) = cli.color {
        devspace::set_color_mode(mode);
    }
    let log_dir = env::current_dir()
        .ok()
        .and_then(|d| devspace::logging::project_log_dir(&d));
    devspace::logging::init_logging(cli.verbose, log_dir.as_deref());

    match &cli.command {
        Command::Up(args) => commands::up::run_up(args),
        Command::Remove { cmd } => commands::remove::run_remove(cmd),
    }
}
