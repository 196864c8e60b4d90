// HTTP fallback transport
//
// Stateless per-call access to the same RPC surface the control channel
// exposes, for devices whose WebSocket channel is unavailable. Each call
// is an independent request against `/rpc/<method>`: parameterless calls
// are GETs, calls with parameters POST their params as the JSON body.

use serde_json::Value;
use tracing::debug;
use url::Url;

use crate::error::Error;
use crate::transport::{TransportConfig, http_base_url};

/// Request/response client for `http://{identifier}/rpc/<method>`.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpTransport {
    /// Build a transport for a device identifier.
    pub fn new(identifier: &str, config: &TransportConfig) -> Result<Self, Error> {
        let http = config.build_client()?;
        let base_url = http_base_url(identifier)?;
        Ok(Self { http, base_url })
    }

    /// Build a transport around an existing client and base URL.
    pub fn with_client(http: reqwest::Client, base_url: Url) -> Self {
        Self { http, base_url }
    }

    /// The device base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// `{base}rpc/{method}`
    pub(crate) fn method_url(&self, method: &str) -> Result<Url, Error> {
        Ok(self.base_url.join(&format!("rpc/{method}"))?)
    }

    /// Issue one call. Returns the device's result value.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, Error> {
        let url = self.method_url(method)?;

        let request = if is_parameterless(&params) {
            debug!("GET {}", url);
            self.http.get(url)
        } else {
            debug!("POST {}", url);
            self.http.post(url).json(&params)
        };

        let resp = request.send().await.map_err(Error::Transport)?;
        parse_response(resp).await
    }
}

fn is_parameterless(params: &Value) -> bool {
    match params {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Map an HTTP response onto the call outcome.
async fn parse_response(resp: reqwest::Response) -> Result<Value, Error> {
    let status = resp.status();

    if status == reqwest::StatusCode::UNAUTHORIZED {
        return Err(Error::Unauthorized);
    }

    let body = resp.text().await.map_err(Error::Transport)?;

    if status.is_success() {
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_str(&body).map_err(|e| Error::Deserialization {
            message: e.to_string(),
            body,
        });
    }

    // Devices answer failed calls with `{code, message}`; keep that text.
    match serde_json::from_str::<Value>(&body) {
        Ok(value) if value.get("message").is_some() || value.get("code").is_some() => {
            Err(Error::from_rpc_error(&value))
        }
        _ => Err(Error::Http {
            status: status.as_u16(),
            body,
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn method_urls_hang_off_rpc_root() {
        let transport =
            HttpTransport::new("192.168.33.1", &TransportConfig::default()).unwrap();
        assert_eq!(
            transport.method_url("script.list").unwrap().as_str(),
            "http://192.168.33.1/rpc/script.list"
        );
    }

    #[test]
    fn empty_params_mean_get() {
        assert!(is_parameterless(&Value::Null));
        assert!(is_parameterless(&json!({})));
        assert!(!is_parameterless(&json!({ "id": 1 })));
    }
}
