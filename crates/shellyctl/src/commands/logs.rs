//! Logs command handler: follows one device's debug log until Ctrl-C.

use tokio::sync::broadcast::error::RecvError;

use shellyctl_core::{DeviceSession, FleetConfig, LogEntry, SessionEvent};

use crate::cli::{GlobalOpts, LogsArgs, OutputFormat};
use crate::error::CliError;
use crate::output;

use super::connect;

pub async fn handle(
    args: LogsArgs,
    config: FleetConfig,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let session = connect(&args.device, config).await?;
    apply_filters(&session, &args);

    let color = output::should_color(&global.color);
    let mut events = session.subscribe();
    session.open_debug_log()?;
    if !global.quiet {
        eprintln!(
            "Following {} ({}), press Ctrl-C to stop",
            session.display_name(),
            session.identifier()
        );
    }

    let result = follow(&session, &mut events, global, color).await;
    session.destroy();
    result
}

/// Without flags, the session default (print output only) applies.
fn apply_filters(session: &DeviceSession, args: &LogsArgs) {
    if !args.print && !args.log {
        return;
    }
    let format = session.console_format();
    if format.show_print != args.print {
        session.toggle_print_output();
    }
    if format.show_log != args.log {
        session.toggle_log_output();
    }
}

async fn follow(
    session: &DeviceSession,
    events: &mut tokio::sync::broadcast::Receiver<SessionEvent>,
    global: &GlobalOpts,
    color: bool,
) -> Result<(), CliError> {
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok(()),
            event = events.recv() => match event {
                Ok(SessionEvent::DebugMessage(entry)) => {
                    if session.console_format().admits(&entry) {
                        output::print_output(&render(&entry, &global.output, color)?, global.quiet);
                    }
                }
                Ok(SessionEvent::Closed) | Err(RecvError::Closed) => {
                    return Err(CliError::ConnectionFailed {
                        device: session.identifier().to_string(),
                        reason: "device closed the connection".into(),
                    });
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "log output fell behind");
                }
            }
        }
    }
}

fn render(entry: &LogEntry, format: &OutputFormat, color: bool) -> Result<String, CliError> {
    match format {
        OutputFormat::Json | OutputFormat::JsonCompact => Ok(serde_json::to_string(entry)?),
        OutputFormat::Plain => Ok(entry.message.clone()),
        OutputFormat::Table => {
            let stamp = entry
                .timestamp_utc()
                .map(|t| t.format("%H:%M:%S%.3f").to_string())
                .unwrap_or_default();
            let message = if entry.is_print() {
                entry.message.clone()
            } else {
                output::dim(&entry.message, color)
            };
            Ok(format!("{} {message}", output::dim(&stamp, color)))
        }
    }
}
