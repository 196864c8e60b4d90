// Wire models for the Shelly RPC surface.
//
// Request and reply envelopes for the control channel, plus the typed
// result shapes of the script and system methods we consume. Replies are
// validated here, at the transport boundary, so nothing above this layer
// handles raw JSON.

use serde::de::{DeserializeOwned, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Error;

// ── Envelopes ────────────────────────────────────────────────────────

/// Outgoing control-channel request.
#[derive(Debug, Serialize)]
pub(crate) struct RpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub src: &'a str,
    pub method: &'a str,
    pub params: &'a Value,
}

/// Any inbound control-channel frame.
///
/// `result`, `error`, and `params` distinguish "absent" from "present but
/// null": a reply of `{"id": 3, "result": null}` is a success.
#[derive(Debug, Deserialize)]
pub(crate) struct InboundFrame {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default, deserialize_with = "present")]
    pub params: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub result: Option<Value>,
    #[serde(default, deserialize_with = "present")]
    pub error: Option<Value>,
}

fn present<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Value>, D::Error> {
    Value::deserialize(deserializer).map(Some)
}

impl InboundFrame {
    /// Numeric request id, if the frame carries one.
    pub fn request_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }

    /// Turn a reply into the caller's outcome. `raw` is the original frame
    /// text, used as the error message when no structured error exists.
    pub fn into_outcome(self, raw: &str) -> Result<Value, Error> {
        match (self.result, self.error) {
            (Some(result), _) => Ok(result),
            (None, Some(error)) => Err(Error::from_rpc_error(&error)),
            (None, None) => Err(Error::Rpc {
                code: None,
                message: raw.to_string(),
            }),
        }
    }
}

// ── Notifications ────────────────────────────────────────────────────

/// An unsolicited device → client message (`NotifyStatus`, `NotifyEvent`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Deserialize)]
struct EventList {
    #[serde(default)]
    events: Vec<ComponentEvent>,
}

#[derive(Debug, Deserialize)]
struct ComponentEvent {
    #[serde(default)]
    component: String,
    #[serde(default)]
    event: String,
}

impl Notification {
    /// Whether this notification says anything about scripts: a status key
    /// like `script:1`, or a `config_changed` event on a script component.
    pub fn touches_scripts(&self) -> bool {
        let Some(params) = self.params.as_object() else {
            return false;
        };
        if params.keys().any(|key| key.starts_with("script")) {
            return true;
        }
        EventList::deserialize(&self.params).is_ok_and(|list| {
            list.events
                .iter()
                .any(|e| e.component.starts_with("script") && e.event == "config_changed")
        })
    }
}

// ── Script methods ───────────────────────────────────────────────────

/// One entry of `script.list`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptInfo {
    pub id: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub enable: bool,
    #[serde(default)]
    pub running: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ScriptList {
    #[serde(default)]
    pub scripts: Vec<ScriptInfo>,
}

/// One page of `script.getcode`.
#[derive(Debug, Deserialize)]
pub(crate) struct CodePage {
    pub data: String,
    #[serde(default)]
    pub left: usize,
}

/// Reply of `script.putcode`: how many characters the device consumed.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PutCodeResult {
    #[serde(default)]
    pub len: Option<usize>,
}

/// Reply of `script.create`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CreatedScript {
    pub id: u32,
}

/// Reply of `script.setConfig` and `sys.setconfig`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct ConfigResult {
    #[serde(default)]
    pub restart_required: bool,
}

/// Reply of `script.start` / `script.stop`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RunResult {
    #[serde(default)]
    pub was_running: bool,
}

/// Reply of `script.eval`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EvalResult {
    #[serde(default)]
    pub result: Value,
}

impl EvalResult {
    /// The evaluated expression as text; strings are unquoted.
    pub fn text(&self) -> String {
        match &self.result {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Reply of `shelly.getdeviceinfo` (the fields we use).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    /// Device generation.
    #[serde(default, rename = "gen")]
    pub generation: Option<u8>,
    #[serde(default)]
    pub ver: Option<String>,
    #[serde(default)]
    pub app: Option<String>,
    #[serde(default)]
    pub auth_en: Option<bool>,
}

/// Decode a call result into its typed shape.
pub(crate) fn decode<T: DeserializeOwned>(method: &str, value: &Value) -> Result<T, Error> {
    T::deserialize(value).map_err(|e| Error::Deserialization {
        message: format!("{method}: {e}"),
        body: value.to_string(),
    })
}
