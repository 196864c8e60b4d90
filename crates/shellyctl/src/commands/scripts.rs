//! Script command handlers.

use serde::Serialize;
use tabled::Tabled;

use shellyctl_api::{HttpTransport, ScriptApi, ScriptInfo, upload_code};
use shellyctl_core::{DeviceSession, FleetConfig, Script, UploadReport};

use crate::cli::{GlobalOpts, ScriptsArgs, ScriptsCommand};
use crate::error::CliError;
use crate::output;

use super::connect;

// ── Rows ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct ScriptView {
    id: u32,
    name: String,
    enabled: bool,
    running: bool,
}

impl From<Script> for ScriptView {
    fn from(s: Script) -> Self {
        Self {
            id: s.id,
            name: s.name,
            enabled: s.enabled,
            running: s.running,
        }
    }
}

impl From<ScriptInfo> for ScriptView {
    fn from(s: ScriptInfo) -> Self {
        Self {
            id: s.id,
            name: s.name,
            enabled: s.enable,
            running: s.running,
        }
    }
}

#[derive(Tabled)]
struct ScriptRow {
    #[tabled(rename = "ID")]
    id: u32,
    #[tabled(rename = "Name")]
    name: String,
    #[tabled(rename = "Enabled")]
    enabled: String,
    #[tabled(rename = "Running")]
    running: String,
}

fn yes_no(flag: bool) -> String {
    if flag { "yes" } else { "no" }.to_string()
}

fn to_row(s: &ScriptView) -> ScriptRow {
    ScriptRow {
        id: s.id,
        name: s.name.clone(),
        enabled: yes_no(s.enabled),
        running: yes_no(s.running),
    }
}

// ── Target ──────────────────────────────────────────────────────────

/// Where script commands go: a synced session, or bare HTTP requests.
enum Target {
    Session(DeviceSession),
    Http {
        device: String,
        http: HttpTransport,
        chunk_size: usize,
    },
}

impl Target {
    async fn open(args: &ScriptsArgs, config: FleetConfig) -> Result<Self, CliError> {
        if args.http {
            let http = HttpTransport::new(&args.device, &config.transport)?;
            return Ok(Self::Http {
                device: args.device.clone(),
                http,
                chunk_size: config.upload.chunk_size,
            });
        }
        Ok(Self::Session(connect(&args.device, config).await?))
    }

    async fn list(&self) -> Result<Vec<ScriptView>, CliError> {
        Ok(match self {
            Self::Session(s) => s.scripts().into_iter().map(ScriptView::from).collect(),
            Self::Http { http, .. } => http
                .list_scripts()
                .await?
                .into_iter()
                .map(ScriptView::from)
                .collect(),
        })
    }

    async fn code(&self, id: u32) -> Result<String, CliError> {
        match self {
            Self::Session(s) => s.script_code(id)?.ok_or_else(|| CliError::Protocol {
                message: format!("code of script {id} could not be read"),
            }),
            Self::Http { http, .. } => Ok(http.get_code(id).await?),
        }
    }

    async fn put(&self, id: u32, code: &str) -> Result<UploadReport, CliError> {
        match self {
            Self::Session(s) => Ok(s.upload_script(id, code).await?),
            Self::Http {
                http, chunk_size, ..
            } => Ok(upload_code(http, id, code, *chunk_size).await?),
        }
    }

    async fn create(&self, name: &str, code: &str) -> Result<u32, CliError> {
        match self {
            Self::Session(s) => Ok(s.create_script(name, code).await?),
            Self::Http {
                http, chunk_size, ..
            } => {
                let id = http.create_script(name).await?;
                upload_code(http, id, code, *chunk_size).await?;
                Ok(id)
            }
        }
    }

    async fn run(&self, cmd: &ScriptsCommand) -> Result<Option<String>, CliError> {
        let message = match (self, cmd) {
            (Self::Session(s), ScriptsCommand::Delete { id }) => {
                s.delete_script(*id).await?;
                format!("Script {id} deleted")
            }
            (Self::Http { http, .. }, ScriptsCommand::Delete { id }) => {
                http.delete_script(*id).await?;
                format!("Script {id} deleted")
            }
            (Self::Session(s), ScriptsCommand::Start { id }) => {
                started(*id, s.start_script(*id).await?)
            }
            (Self::Http { http, .. }, ScriptsCommand::Start { id }) => {
                started(*id, http.start_script(*id).await?)
            }
            (Self::Session(s), ScriptsCommand::Stop { id }) => {
                stopped(*id, s.stop_script(*id).await?)
            }
            (Self::Http { http, .. }, ScriptsCommand::Stop { id }) => {
                stopped(*id, http.stop_script(*id).await?)
            }
            (Self::Session(s), ScriptsCommand::Enable { id }) => {
                toggled(*id, true, s.enable_script(*id).await?)
            }
            (Self::Http { http, .. }, ScriptsCommand::Enable { id }) => {
                toggled(*id, true, http.set_enabled(*id, true).await?)
            }
            (Self::Session(s), ScriptsCommand::Disable { id }) => {
                toggled(*id, false, s.disable_script(*id).await?)
            }
            (Self::Http { http, .. }, ScriptsCommand::Disable { id }) => {
                toggled(*id, false, http.set_enabled(*id, false).await?)
            }
            (Self::Session(s), ScriptsCommand::Rename { id, name }) => {
                s.rename_script(*id, name).await?;
                format!("Script {id} renamed to '{name}'")
            }
            (Self::Http { http, .. }, ScriptsCommand::Rename { id, name }) => {
                http.rename_script(*id, name).await?;
                format!("Script {id} renamed to '{name}'")
            }
            _ => return Ok(None),
        };
        Ok(Some(message))
    }

    async fn eval(&self, id: u32, code: &str) -> Result<String, CliError> {
        match self {
            Self::Session(s) => Ok(s.eval_script(id, code).await?),
            Self::Http { http, .. } => Ok(http.eval_script(id, code).await?),
        }
    }

    fn close(&self) {
        if let Self::Session(s) = self {
            s.destroy();
        }
    }

    fn device(&self) -> &str {
        match self {
            Self::Session(s) => s.identifier(),
            Self::Http { device, .. } => device,
        }
    }
}

fn started(id: u32, was_running: bool) -> String {
    if was_running {
        format!("Script {id} was already running")
    } else {
        format!("Script {id} started")
    }
}

fn stopped(id: u32, was_running: bool) -> String {
    if was_running {
        format!("Script {id} stopped")
    } else {
        format!("Script {id} was not running")
    }
}

fn toggled(id: u32, enabled: bool, restart_required: bool) -> String {
    let state = if enabled { "enabled" } else { "disabled" };
    if restart_required {
        format!("Script {id} {state}; restart the device to apply")
    } else {
        format!("Script {id} {state}")
    }
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(
    args: ScriptsArgs,
    config: FleetConfig,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let target = Target::open(&args, config)
        .await
        .map_err(|e| e.on_device(&args.device))?;
    let result = execute(&target, &args.command, global).await;
    target.close();
    result.map_err(|e| e.on_device(target.device()))
}

async fn execute(
    target: &Target,
    cmd: &ScriptsCommand,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    match cmd {
        ScriptsCommand::List => {
            let scripts = target.list().await?;
            let out = output::render_list(&global.output, &scripts, to_row, |s| s.id.to_string())?;
            output::print_output(&out, global.quiet);
        }

        ScriptsCommand::Get { id } => {
            let code = target.code(*id).await?;
            output::print_output(&code, global.quiet);
        }

        ScriptsCommand::Put { id, file } => {
            let code = std::fs::read_to_string(file)?;
            let report = target.put(*id, &code).await?;
            if !global.quiet {
                eprintln!(
                    "Uploaded {} characters to script {id} on {} ({} writes, {} retries)",
                    code.chars().count(),
                    target.device(),
                    report.writes,
                    report.retries
                );
            }
        }

        ScriptsCommand::Create { name, file } => {
            let code = std::fs::read_to_string(file)?;
            let id = target.create(name, &code).await?;
            output::print_output(&id.to_string(), global.quiet);
        }

        ScriptsCommand::Eval { id, code } => {
            let result = target.eval(*id, code).await?;
            output::print_output(&result, global.quiet);
        }

        other => {
            let message = target.run(other).await?;
            if let Some(message) = message.filter(|_| !global.quiet) {
                eprintln!("{message}");
            }
        }
    }
    Ok(())
}
