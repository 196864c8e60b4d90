//! Discover command handler.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use shellyctl_core::{Discovery, FleetConfig};

use crate::cli::{DiscoverArgs, GlobalOpts, OutputFormat};
use crate::error::CliError;
use crate::output;

pub async fn handle(
    args: DiscoverArgs,
    config: FleetConfig,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let discovery = Discovery::new(config.discovery);
    let streaming = matches!(global.output, OutputFormat::Table | OutputFormat::Plain);
    let quiet = global.quiet;
    let found = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&found);
    discovery.subscribe(move |identifier| {
        if streaming {
            output::print_output(&identifier, quiet);
        }
        sink.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(identifier);
    });

    discovery.start()?;
    if !quiet && streaming {
        eprintln!("Browsing for {}s...", args.seconds);
    }

    tokio::select! {
        () = tokio::time::sleep(Duration::from_secs(args.seconds)) => {}
        _ = tokio::signal::ctrl_c() => {}
    }
    discovery.destroy();

    let found = found.lock().unwrap_or_else(PoisonError::into_inner).clone();
    if !streaming {
        let rendered =
            output::render_single(&global.output, &found, |_| String::new(), |_| String::new())?;
        output::print_output(&rendered, quiet);
    } else if found.is_empty() && !quiet {
        eprintln!("No devices found");
    }
    Ok(())
}
