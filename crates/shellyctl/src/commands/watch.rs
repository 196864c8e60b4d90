//! Watch command handler: runs the whole fleet until Ctrl-C.

use chrono::Local;
use tokio::sync::broadcast::error::RecvError;

use shellyctl_core::{Fleet, FleetConfig, RegistryEvent, SessionEvent};

use crate::cli::{GlobalOpts, WatchArgs};
use crate::error::CliError;
use crate::output;

pub async fn handle(
    args: WatchArgs,
    mut config: FleetConfig,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    if args.no_discovery {
        config.discovery.enabled = false;
    }
    let color = output::should_color(&global.color);

    let fleet = Fleet::new(config);
    let mut events = fleet.subscribe();
    fleet.start()?;
    for device in &args.devices {
        fleet.add_device(device)?;
    }
    if !global.quiet {
        eprintln!("Watching devices, press Ctrl-C to stop");
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event) => {
                    if let Some(line) = describe(&fleet, &event, color) {
                        output::print_output(&line, global.quiet);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event output fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    fleet.shutdown();
    Ok(())
}

/// One console line per event worth showing.
fn describe(fleet: &Fleet, event: &RegistryEvent, color: bool) -> Option<String> {
    let stamp = output::dim(&Local::now().format("%H:%M:%S").to_string(), color);
    let device = output::accent(event.device(), color);

    let text = match event {
        RegistryEvent::Changed { device: id } => {
            let session = fleet.registry().device(id)?;
            format!(
                "{} ready ({} scripts)",
                session.display_name(),
                session.scripts().len()
            )
        }
        RegistryEvent::Session { event, .. } => match event {
            SessionEvent::ScriptChanged(script) => format!(
                "script {} '{}'{}",
                script.id,
                script.name,
                if script.running { " running" } else { "" }
            ),
            SessionEvent::Changed => "scripts resynced".to_string(),
            SessionEvent::ErrorMessage(message) => output::alert(message, color),
            SessionEvent::Closed => "disconnected".to_string(),
            SessionEvent::Ready
            | SessionEvent::DebugMessage(_)
            | SessionEvent::ConsoleFormatChanged { .. } => return None,
        },
    };
    Some(format!("{stamp} {device} {text}"))
}
