//! Command dispatch: bridges CLI args -> core sessions -> output formatting.

pub mod config_cmd;
pub mod discover;
pub mod logs;
pub mod scripts;
pub mod watch;

use std::sync::Arc;

use shellyctl_core::{DeviceSession, Discovery, FleetConfig};

use crate::cli::{Command, GlobalOpts};
use crate::error::CliError;

/// Dispatch a device-bound command to the appropriate handler.
pub async fn dispatch(
    cmd: Command,
    config: FleetConfig,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    match cmd {
        Command::Discover(args) => discover::handle(args, config, global).await,
        Command::Watch(args) => watch::handle(args, config, global).await,
        Command::Scripts(args) => scripts::handle(args, config, global).await,
        Command::Logs(args) => logs::handle(args, config, global).await,
        // Config and Completions are handled before dispatch
        Command::Config(_) | Command::Completions(_) => Err(CliError::Internal(
            "command does not need a device".into(),
        )),
    }
}

/// Open a session to one device and wait until its scripts are synced.
pub(crate) async fn connect(device: &str, config: FleetConfig) -> Result<DeviceSession, CliError> {
    let discovery = Discovery::new(config.discovery.clone());
    let session = DeviceSession::new(device, Arc::new(config), discovery)
        .map_err(|e| CliError::for_device(e, device))?;
    session.start();
    if let Err(e) = session.wait_ready().await {
        session.destroy();
        return Err(CliError::for_device(e, device));
    }
    tracing::debug!(device, name = %session.display_name(), "connected");
    Ok(session)
}
