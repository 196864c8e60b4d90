mod cli;
mod commands;
mod error;
mod output;

use std::path::PathBuf;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use shellyctl_config::Config;
use shellyctl_core::FleetConfig;

use crate::cli::{Cli, Command, GlobalOpts};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        // Config commands work on the file, not on devices
        Command::Config(args) => commands::config_cmd::handle(args, &cli.global),

        Command::Completions(args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "shellyctl", &mut std::io::stdout());
            Ok(())
        }

        cmd => {
            let fleet_config = build_fleet_config(&cli.global)?;
            tracing::debug!(command = ?cmd, "dispatching command");
            commands::dispatch(cmd, fleet_config, &cli.global).await
        }
    }
}

/// The config file the CLI reads: `--config` or the platform default.
pub(crate) fn config_file(global: &GlobalOpts) -> PathBuf {
    global
        .config
        .clone()
        .unwrap_or_else(shellyctl_config::config_path)
}

pub(crate) fn load_config(global: &GlobalOpts) -> Result<Config, CliError> {
    Ok(shellyctl_config::load_config_from(&config_file(global))?)
}

/// Build a `FleetConfig` from the config file and CLI overrides.
fn build_fleet_config(global: &GlobalOpts) -> Result<FleetConfig, CliError> {
    let mut cfg = load_config(global)?;
    if let Some(timeout) = global.timeout {
        cfg.transport.timeout_secs = timeout;
    }
    Ok(cfg.to_fleet_config()?)
}
