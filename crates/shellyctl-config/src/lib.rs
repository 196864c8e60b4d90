//! Configuration for shellyctl.
//!
//! TOML file + `SHELLYCTL_` environment overrides, merged with figment,
//! and translation to `shellyctl_core::FleetConfig`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use shellyctl_core::config::DEFAULT_SERVICE_TYPE;
use shellyctl_core::{DiscoveryConfig, FleetConfig, ResetPolicy, TransportConfig, UploadConfig};

// ── Error ───────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("config file already exists: {}", path.display())]
    AlreadyExists { path: PathBuf },

    #[error("failed to serialize config: {0}")]
    Serialization(#[from] toml::ser::Error),

    #[error("config loading failed: {0}")]
    Figment(Box<figment::Error>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

// ── TOML config structs ─────────────────────────────────────────────

/// Top-level TOML configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub discovery: DiscoverySection,

    #[serde(default)]
    pub transport: TransportSection,

    #[serde(default)]
    pub upload: UploadSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DiscoverySection {
    /// Browse mDNS when the fleet starts.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_service_type")]
    pub service_type: String,

    /// `"ban-discovered"` or `"forget"`.
    #[serde(default)]
    pub reset_policy: ResetPolicy,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: true,
            service_type: default_service_type(),
            reset_policy: ResetPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TransportSection {
    /// HTTP request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// `src` tag on RPC envelopes.
    #[serde(default = "default_source")]
    pub source: String,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            source: default_source(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct UploadSection {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    #[serde(default = "default_save_timeout")]
    pub save_timeout_secs: u64,
}

impl Default for UploadSection {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            save_timeout_secs: default_save_timeout(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.into()
}
fn default_timeout() -> u64 {
    10
}
fn default_source() -> String {
    TransportConfig::default().source
}
fn default_chunk_size() -> usize {
    UploadConfig::default().chunk_size
}
fn default_save_timeout() -> u64 {
    5
}

// ── Translation ─────────────────────────────────────────────────────

impl Config {
    /// Validate and build the runtime configuration.
    pub fn to_fleet_config(&self) -> Result<FleetConfig, ConfigError> {
        if self.upload.chunk_size == 0 {
            return Err(validation("upload.chunk_size", "must be greater than zero"));
        }
        if self.transport.source.trim().is_empty() {
            return Err(validation("transport.source", "must not be empty"));
        }
        if !self.discovery.service_type.ends_with(".local.") {
            return Err(validation(
                "discovery.service_type",
                format!(
                    "expected a name ending in '.local.', got '{}'",
                    self.discovery.service_type
                ),
            ));
        }

        Ok(FleetConfig {
            transport: TransportConfig {
                timeout: Duration::from_secs(self.transport.timeout_secs),
                source: self.transport.source.clone(),
            },
            discovery: DiscoveryConfig {
                enabled: self.discovery.enabled,
                service_type: self.discovery.service_type.clone(),
                reset_policy: self.discovery.reset_policy,
            },
            upload: UploadConfig {
                chunk_size: self.upload.chunk_size,
                save_timeout: Duration::from_secs(self.upload.save_timeout_secs),
            },
        })
    }
}

fn validation(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Validation {
        field: field.into(),
        reason: reason.into(),
    }
}

// ── Config file path ────────────────────────────────────────────────

/// Resolve the config file path via XDG / platform conventions.
pub fn config_path() -> PathBuf {
    ProjectDirs::from("com", "shellyctl", "shellyctl").map_or_else(
        || {
            let mut p = dirs_fallback();
            p.push("config.toml");
            p
        },
        |dirs| dirs.config_dir().join("config.toml"),
    )
}

fn dirs_fallback() -> PathBuf {
    let mut p = PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()));
    p.push(".config");
    p.push("shellyctl");
    p
}

// ── Config loading ──────────────────────────────────────────────────

fn figment(path: &Path) -> Figment {
    Figment::new()
        .merge(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("SHELLYCTL_").split("__"))
}

/// Load the full Config from the canonical file + environment.
pub fn load_config() -> Result<Config, ConfigError> {
    load_config_from(&config_path())
}

/// Load from an explicit file + environment. A missing file is not an
/// error.
pub fn load_config_from(path: &Path) -> Result<Config, ConfigError> {
    let config: Config = figment(path).extract()?;
    Ok(config)
}

/// Load config, returning a default if loading fails.
pub fn load_config_or_default() -> Config {
    load_config().unwrap_or_default()
}

// ── Config saving ───────────────────────────────────────────────────

/// Serialize config to TOML and write to the canonical config path.
pub fn save_config(cfg: &Config) -> Result<PathBuf, ConfigError> {
    let path = config_path();
    save_config_to(cfg, &path)?;
    Ok(path)
}

pub fn save_config_to(cfg: &Config, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let toml_str = toml::to_string_pretty(cfg)?;
    std::fs::write(path, toml_str)?;
    Ok(())
}

/// Write a default config file. Refuses to overwrite an existing one.
pub fn init_config(path: &Path) -> Result<(), ConfigError> {
    if path.exists() {
        return Err(ConfigError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    save_config_to(&Config::default(), path)
}
