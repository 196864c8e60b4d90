// ── Core error types ──
//
// Errors surfaced by sessions, the registry, and discovery. Consumers
// never match on transport details; the `From<shellyctl_api::Error>` impl
// folds wire failures into these variants while keeping the device's
// own error text.

use thiserror::Error;

/// Unified error type for the core crate.
#[derive(Debug, Clone, Error)]
pub enum CoreError {
    // ── Connection errors ────────────────────────────────────────────
    #[error("Cannot reach device: {reason}")]
    ConnectionFailed { reason: String },

    #[error("Device requires authentication: {message}")]
    Unauthorized { message: String },

    #[error("Operation timed out: {reason}")]
    Timeout { reason: String },

    // ── Device errors ────────────────────────────────────────────────
    #[error("Unexpected reply from device: {message}")]
    Protocol { message: String },

    /// A call the device rejected. Displays the device's own message.
    #[error("{message}")]
    Device { code: Option<i64>, message: String },

    // ── Lookup errors ────────────────────────────────────────────────
    #[error("Device not found: {identifier}")]
    DeviceNotFound { identifier: String },

    #[error("Script {id} not found on {device}")]
    ScriptNotFound { device: String, id: u32 },

    // ── Lifecycle errors ─────────────────────────────────────────────
    #[error("Session for {device} has been destroyed")]
    SessionDestroyed { device: String },

    #[error("Discovery error: {message}")]
    Discovery { message: String },

    // ── Internal errors ──────────────────────────────────────────────
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Returns `true` for authorization failures.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Returns `true` if the device could not be reached.
    pub fn is_connection(&self) -> bool {
        matches!(self, Self::ConnectionFailed { .. })
    }
}

// ── Conversion from transport-layer errors ───────────────────────────

impl From<shellyctl_api::Error> for CoreError {
    fn from(err: shellyctl_api::Error) -> Self {
        use shellyctl_api::Error as Api;

        if err.is_unauthorized() {
            return CoreError::Unauthorized {
                message: err.to_string(),
            };
        }

        match err {
            Api::Connect { .. } | Api::ChannelClosed => CoreError::ConnectionFailed {
                reason: err.to_string(),
            },
            Api::Transport(ref e) => {
                if e.is_timeout() {
                    CoreError::Timeout {
                        reason: e.to_string(),
                    }
                } else if e.is_connect() {
                    CoreError::ConnectionFailed {
                        reason: e.to_string(),
                    }
                } else {
                    CoreError::Device {
                        code: None,
                        message: e.to_string(),
                    }
                }
            }
            Api::InvalidUrl(e) => CoreError::ConnectionFailed {
                reason: format!("invalid device address: {e}"),
            },
            Api::Rpc { code, message } => CoreError::Device { code, message },
            Api::Http { status, body } => CoreError::Device {
                code: Some(i64::from(status)),
                message: if body.is_empty() {
                    format!("HTTP {status}")
                } else {
                    body
                },
            },
            Api::Protocol(message) => CoreError::Protocol { message },
            Api::Deserialization { message, body: _ } => CoreError::Protocol { message },
            Api::Unauthorized => CoreError::Unauthorized {
                message: "Device requires authentication".into(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use shellyctl_api::Error as Api;

    use super::*;

    #[test]
    fn device_errors_keep_the_original_text() {
        let err = CoreError::from(Api::Rpc {
            code: Some(-103),
            message: "Invalid argument 'id'".into(),
        });
        assert_eq!(err.to_string(), "Invalid argument 'id'");
        assert!(matches!(err, CoreError::Device { code: Some(-103), .. }));
    }

    #[test]
    fn code_401_maps_to_unauthorized() {
        let err = CoreError::from(Api::Rpc {
            code: Some(401),
            message: "auth".into(),
        });
        assert!(err.is_unauthorized());
        assert!(CoreError::from(Api::Unauthorized).is_unauthorized());
    }

    #[test]
    fn closed_channel_is_a_connection_failure() {
        assert!(CoreError::from(Api::ChannelClosed).is_connection());
    }

    #[test]
    fn wire_shape_errors_are_protocol_errors() {
        let err = CoreError::from(Api::Deserialization {
            message: "missing field `id`".into(),
            body: "{}".into(),
        });
        assert!(matches!(err, CoreError::Protocol { .. }));
    }
}
