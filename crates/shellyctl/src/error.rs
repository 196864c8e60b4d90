//! CLI error types with miette diagnostics.
//!
//! Maps `CoreError` variants into user-facing errors with actionable help text.

use miette::Diagnostic;
use thiserror::Error;

use shellyctl_config::ConfigError;
use shellyctl_core::CoreError;

/// Process exit codes.
pub mod exit_code {
    pub const GENERAL: i32 = 1;
    pub const USAGE: i32 = 2;
    pub const AUTH: i32 = 3;
    pub const NOT_FOUND: i32 = 4;
    pub const CONNECTION: i32 = 7;
    pub const TIMEOUT: i32 = 8;
}

/// Placeholder device for errors converted without context.
const UNKNOWN_DEVICE: &str = "(unknown)";

#[derive(Debug, Error, Diagnostic)]
#[allow(dead_code)]
pub enum CliError {
    // ── Connection ───────────────────────────────────────────────────
    #[error("Could not connect to device {device}")]
    #[diagnostic(
        code(shellyctl::connection_failed),
        help(
            "Check that the device is powered and reachable.\n\
             Reason: {reason}\n\
             Try: shellyctl scripts {device} list --http"
        )
    )]
    ConnectionFailed { device: String, reason: String },

    #[error("Device {device} requires authentication")]
    #[diagnostic(
        code(shellyctl::auth_required),
        help("Disable authentication in the device's web UI; shellyctl does not send credentials.")
    )]
    AuthRequired { device: String },

    // ── Resources ────────────────────────────────────────────────────
    #[error("{resource_type} '{identifier}' not found")]
    #[diagnostic(
        code(shellyctl::not_found),
        help("Run: shellyctl {list_command} to see what is available")
    )]
    NotFound {
        resource_type: String,
        identifier: String,
        list_command: String,
    },

    // ── Device ───────────────────────────────────────────────────────
    #[error("{message}")]
    #[diagnostic(code(shellyctl::device_error))]
    Device { code: Option<i64>, message: String },

    #[error("Unexpected reply from device: {message}")]
    #[diagnostic(code(shellyctl::protocol))]
    Protocol { message: String },

    // ── Validation ───────────────────────────────────────────────────
    #[error("Invalid value for {field}: {reason}")]
    #[diagnostic(code(shellyctl::validation))]
    Validation { field: String, reason: String },

    // ── Configuration ────────────────────────────────────────────────
    #[error(transparent)]
    #[diagnostic(
        code(shellyctl::config),
        help("Inspect it with: shellyctl config show")
    )]
    Config(Box<ConfigError>),

    // ── Timeout ──────────────────────────────────────────────────────
    #[error("Request timed out: {reason}")]
    #[diagnostic(
        code(shellyctl::timeout),
        help("Increase timeout with --timeout or check the device's Wi-Fi signal.")
    )]
    Timeout { reason: String },

    // ── Internal ─────────────────────────────────────────────────────
    #[error("{0}")]
    #[diagnostic(code(shellyctl::internal))]
    Internal(String),

    // ── IO / Serialization ───────────────────────────────────────────
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Failed to render output: {0}")]
    #[diagnostic(code(shellyctl::json))]
    Json(#[from] serde_json::Error),
}

impl From<ConfigError> for CliError {
    fn from(err: ConfigError) -> Self {
        Self::Config(Box::new(err))
    }
}

impl CliError {
    /// Map this error to an exit code for process termination.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::ConnectionFailed { .. } => exit_code::CONNECTION,
            Self::AuthRequired { .. } => exit_code::AUTH,
            Self::NotFound { .. } => exit_code::NOT_FOUND,
            Self::Timeout { .. } => exit_code::TIMEOUT,
            Self::Validation { .. } | Self::Config(_) => exit_code::USAGE,
            _ => exit_code::GENERAL,
        }
    }

    /// Attach the device identifier to errors that lack one.
    pub fn for_device(err: CoreError, device: &str) -> Self {
        match err {
            CoreError::ConnectionFailed { reason } => Self::ConnectionFailed {
                device: device.into(),
                reason,
            },
            CoreError::Unauthorized { .. } => Self::AuthRequired {
                device: device.into(),
            },
            CoreError::SessionDestroyed { .. } => Self::ConnectionFailed {
                device: device.into(),
                reason: "session closed".into(),
            },
            other => other.into(),
        }
    }

    /// Fill in `device` where a conversion had none to give.
    pub fn on_device(self, device: &str) -> Self {
        match self {
            Self::ConnectionFailed { device: d, reason } if d == UNKNOWN_DEVICE => {
                Self::ConnectionFailed {
                    device: device.into(),
                    reason,
                }
            }
            Self::AuthRequired { device: d } if d == UNKNOWN_DEVICE => Self::AuthRequired {
                device: device.into(),
            },
            other => other,
        }
    }
}

// ── CoreError → CliError mapping ─────────────────────────────────────

impl From<CoreError> for CliError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::ConnectionFailed { reason } => CliError::ConnectionFailed {
                device: UNKNOWN_DEVICE.into(),
                reason,
            },
            CoreError::Unauthorized { .. } => CliError::AuthRequired {
                device: UNKNOWN_DEVICE.into(),
            },
            CoreError::Timeout { reason } => CliError::Timeout { reason },
            CoreError::Protocol { message } => CliError::Protocol { message },
            CoreError::Device { code, message } => CliError::Device { code, message },
            CoreError::DeviceNotFound { identifier } => CliError::NotFound {
                resource_type: "device".into(),
                identifier,
                list_command: "discover".into(),
            },
            CoreError::ScriptNotFound { device, id } => CliError::NotFound {
                resource_type: "script".into(),
                identifier: id.to_string(),
                list_command: format!("scripts {device} list"),
            },
            CoreError::SessionDestroyed { device } => CliError::ConnectionFailed {
                device,
                reason: "session closed".into(),
            },
            CoreError::Discovery { message } | CoreError::Internal(message) => {
                CliError::Internal(message)
            }
        }
    }
}

impl From<shellyctl_api::Error> for CliError {
    fn from(err: shellyctl_api::Error) -> Self {
        CoreError::from(err).into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_error_class() {
        let unauthorized = CliError::for_device(
            CoreError::Unauthorized {
                message: "401".into(),
            },
            "10.0.0.5",
        );
        assert_eq!(unauthorized.exit_code(), exit_code::AUTH);

        let missing: CliError = CoreError::ScriptNotFound {
            device: "10.0.0.5".into(),
            id: 3,
        }
        .into();
        assert_eq!(missing.exit_code(), exit_code::NOT_FOUND);

        let refused = CliError::for_device(
            CoreError::ConnectionFailed {
                reason: "refused".into(),
            },
            "10.0.0.5",
        );
        assert_eq!(refused.exit_code(), exit_code::CONNECTION);
        assert!(matches!(refused, CliError::ConnectionFailed { ref device, .. } if device == "10.0.0.5"));
    }

    #[test]
    fn on_device_fills_only_missing_devices() {
        let converted: CliError = CoreError::Unauthorized {
            message: "401".into(),
        }
        .into();
        assert!(matches!(
            converted.on_device("10.0.0.7"),
            CliError::AuthRequired { ref device } if device == "10.0.0.7"
        ));

        let known = CliError::for_device(
            CoreError::ConnectionFailed {
                reason: "refused".into(),
            },
            "10.0.0.5",
        );
        assert!(matches!(
            known.on_device("10.0.0.7"),
            CliError::ConnectionFailed { ref device, .. } if device == "10.0.0.5"
        ));
    }

    #[test]
    fn device_errors_keep_their_text() {
        let err: CliError = CoreError::Device {
            code: Some(-103),
            message: "Invalid argument 'id'".into(),
        }
        .into();
        assert_eq!(err.to_string(), "Invalid argument 'id'");
        assert_eq!(err.exit_code(), exit_code::GENERAL);
    }
}
