// Shared transport configuration and device endpoint construction.
//
// Both the WebSocket control channel and the HTTP fallback address a
// device by its identifier (host name, address, or `host:port`). This
// module owns the URL shapes and the reqwest builder so neither
// transport duplicates them.

use std::time::Duration;

use url::Url;

use crate::error::Error;

/// Default `src` tag stamped on every RPC envelope.
pub const DEFAULT_SOURCE: &str = "shellyctl";

/// Shared transport configuration for building device clients.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Per-request timeout for the HTTP fallback.
    pub timeout: Duration,
    /// Value of the `src` field on outgoing RPC envelopes.
    pub source: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            source: DEFAULT_SOURCE.to_string(),
        }
    }
}

impl TransportConfig {
    /// Build a `reqwest::Client` from this config.
    pub fn build_client(&self) -> Result<reqwest::Client, Error> {
        reqwest::Client::builder()
            .timeout(self.timeout)
            .user_agent(concat!("shellyctl/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::Transport)
    }
}

// ── Endpoint URLs ────────────────────────────────────────────────────

/// Control channel: `ws://{identifier}/rpc`
pub fn rpc_url(identifier: &str) -> Result<Url, Error> {
    Ok(Url::parse(&format!("ws://{identifier}/rpc"))?)
}

/// Debug log stream: `ws://{identifier}/debug/log`
pub fn debug_log_url(identifier: &str) -> Result<Url, Error> {
    Ok(Url::parse(&format!("ws://{identifier}/debug/log"))?)
}

/// HTTP fallback root: `http://{identifier}/`
pub fn http_base_url(identifier: &str) -> Result<Url, Error> {
    Ok(Url::parse(&format!("http://{identifier}/"))?)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_urls_follow_device_layout() {
        let id = "shellyplus1-a8032ab12345.local";
        assert_eq!(
            rpc_url(id).unwrap().as_str(),
            "ws://shellyplus1-a8032ab12345.local/rpc"
        );
        assert_eq!(
            debug_log_url(id).unwrap().as_str(),
            "ws://shellyplus1-a8032ab12345.local/debug/log"
        );
        assert_eq!(
            http_base_url("192.168.33.1:8080").unwrap().as_str(),
            "http://192.168.33.1:8080/"
        );
    }

    #[test]
    fn identifier_that_is_not_a_host_is_rejected() {
        assert!(matches!(rpc_url("bad host"), Err(Error::InvalidUrl(_))));
    }

    #[test]
    fn default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.source, "shellyctl");
    }
}
