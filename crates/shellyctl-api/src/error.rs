use serde_json::Value;
use thiserror::Error;

/// Top-level error type for the `shellyctl-api` crate.
///
/// Covers every failure mode across both device surfaces: the persistent
/// WebSocket control channel, the HTTP fallback, and the debug log stream.
/// `shellyctl-core` maps these into session-level diagnostics.
#[derive(Debug, Error)]
pub enum Error {
    // ── Connection ──────────────────────────────────────────────────
    /// The control channel could not be established.
    #[error("Cannot open channel to {url}: {reason}")]
    Connect { url: String, reason: String },

    /// The channel closed while a call was outstanding, or a call was
    /// issued after the channel closed.
    #[error("Channel closed")]
    ChannelClosed,

    /// HTTP transport error (connection refused, DNS failure, etc.)
    #[error("HTTP transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    // ── Authorization ───────────────────────────────────────────────
    /// The device demands credentials we do not hold.
    #[error("Device requires authentication")]
    Unauthorized,

    // ── Device ──────────────────────────────────────────────────────
    /// Structured error returned by the device for one call.
    #[error("{message}")]
    Rpc { code: Option<i64>, message: String },

    /// Non-success HTTP status without a structured error body.
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    // ── Data ────────────────────────────────────────────────────────
    /// A frame or body did not have the expected shape.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON deserialization failed, with the raw body for debugging.
    #[error("Deserialization error: {message}")]
    Deserialization { message: String, body: String },
}

impl Error {
    /// Build an [`Error::Rpc`] from the `error` member of a reply.
    ///
    /// Shelly devices send `{ "code": -103, "message": "..." }`; anything
    /// else is carried verbatim as the message.
    pub(crate) fn from_rpc_error(value: &Value) -> Self {
        let code = value.get("code").and_then(Value::as_i64);
        let message = value
            .get("message")
            .and_then(Value::as_str)
            .map_or_else(|| value.to_string(), String::from);
        if code == Some(401) {
            return Self::Unauthorized;
        }
        Self::Rpc { code, message }
    }

    /// Returns `true` if the device rejected us for lack of credentials.
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized | Self::Rpc { code: Some(401), .. }
        )
    }

    /// Returns `true` if this error means the device could not be reached
    /// or the channel to it is gone.
    pub fn is_connection(&self) -> bool {
        match self {
            Self::Connect { .. } | Self::ChannelClosed => true,
            Self::Transport(e) => e.is_connect() || e.is_timeout(),
            _ => false,
        }
    }

    /// The device-reported error code, if available.
    pub fn rpc_code(&self) -> Option<i64> {
        match self {
            Self::Rpc { code, .. } => *code,
            Self::Unauthorized => Some(401),
            _ => None,
        }
    }
}
