use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;

use skillsync::app;
use skillsync::cli::{Cli, Commands};
use skillsync::config::{self, SyncConfig};
use skillsync::util::setup_tracing;

fn main() -> ExitCode {
    match run() {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            eprintln!("skillsync error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run() -> Result<u8> {
    setup_tracing();
    let cli = Cli::parse();
    let config = SyncConfig::load_or_init()?;

    match cli.command {
        Some(Commands::Status) => {
            app::print_status(&config)?;
            Ok(0)
        }
        Some(Commands::Usage { limit, json }) => {
            app::print_usage(&config, limit, json)?;
            Ok(0)
        }
        Some(Commands::Catalog { sort }) => {
            app::print_catalog(&config, sort.unwrap_or(config.sort))?;
            Ok(0)
        }
        Some(Commands::Doctor) => app::doctor(&config),
        Some(Commands::Watch) | None => {
            app::watch(&config, config::runtime_settings())?;
            Ok(0)
        }
    }
}
