//! Clap derive structures for the `shellyctl` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// shellyctl -- manage scripts on Shelly Gen2+ devices
#[derive(Debug, Parser)]
#[command(
    name = "shellyctl",
    version,
    about = "Manage Shelly device scripts from the command line",
    long_about = "Discover Shelly Gen2+ devices on the local network, edit their scripts,\n\
        and follow their debug logs.\n\n\
        Devices are addressed by host name, IP address, or host:port.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "SHELLYCTL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "SHELLYCTL_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// When to use color output
    #[arg(long, default_value = "auto", global = true)]
    pub color: ColorMode,

    /// Device request timeout in seconds (overrides config)
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

// ── Output & Color Enums ─────────────────────────────────────────────

#[derive(Debug, Clone, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// Plain text, one value per line (scripting)
    Plain,
}

#[derive(Debug, Clone, ValueEnum)]
pub enum ColorMode {
    /// Auto-detect (color if terminal is interactive)
    Auto,
    /// Always emit color codes
    Always,
    /// Never emit color codes
    Never,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Browse the network for Shelly devices
    Discover(DiscoverArgs),

    /// Discover devices, connect to each, and print what happens
    Watch(WatchArgs),

    /// Manage the scripts on one device
    #[command(alias = "s")]
    Scripts(ScriptsArgs),

    /// Follow a device's debug log
    Logs(LogsArgs),

    /// Manage the configuration file
    Config(ConfigArgs),

    /// Generate shell completions
    Completions(CompletionsArgs),
}

// ── Discover / Watch ─────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct DiscoverArgs {
    /// How long to browse
    #[arg(long, default_value = "5")]
    pub seconds: u64,
}

#[derive(Debug, Args)]
pub struct WatchArgs {
    /// Also connect to these devices, discovered or not
    #[arg(long = "device", short = 'd')]
    pub devices: Vec<String>,

    /// Do not browse the network; only use --device
    #[arg(long)]
    pub no_discovery: bool,
}

// ── Scripts ──────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ScriptsArgs {
    /// Device host name, IP address, or host:port
    pub device: String,

    /// Use plain HTTP requests instead of the WebSocket control channel
    #[arg(long, global = true)]
    pub http: bool,

    #[command(subcommand)]
    pub command: ScriptsCommand,
}

#[derive(Debug, Subcommand)]
pub enum ScriptsCommand {
    /// List scripts
    #[command(alias = "ls")]
    List,

    /// Print a script's code
    Get { id: u32 },

    /// Replace a script's code with a file's contents
    Put {
        id: u32,
        /// Source file
        file: PathBuf,
    },

    /// Create a script from a file
    Create {
        name: String,
        /// Source file
        file: PathBuf,
    },

    /// Delete a script
    #[command(alias = "rm")]
    Delete { id: u32 },

    /// Start a script
    Start { id: u32 },

    /// Stop a script
    Stop { id: u32 },

    /// Run a script when the device boots
    Enable { id: u32 },

    /// Do not run a script when the device boots
    Disable { id: u32 },

    /// Rename a script
    Rename { id: u32, name: String },

    /// Evaluate an expression inside a running script
    Eval { id: u32, code: String },
}

// ── Logs ─────────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct LogsArgs {
    /// Device host name, IP address, or host:port
    pub device: String,

    /// Show print() output (default when no filter is given)
    #[arg(long)]
    pub print: bool,

    /// Show firmware log output
    #[arg(long)]
    pub log: bool,
}

// ── Config ───────────────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the resolved configuration
    Show,

    /// Print the config file path
    Path,

    /// Write a default config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    pub shell: clap_complete::Shell,
}
