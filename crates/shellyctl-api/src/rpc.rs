// The call seam shared by both transports, and the typed Shelly script
// operations layered on top of it.

use std::future::Future;

use serde_json::{Value, json};

use crate::error::Error;
use crate::http::HttpTransport;
use crate::models::{
    CodePage, ConfigResult, CreatedScript, DeviceInfo, EvalResult, PutCodeResult, RunResult,
    ScriptInfo, ScriptList, decode,
};
use crate::websocket::RpcTransport;

/// Anything that can carry one RPC-equivalent call to a device.
pub trait RpcCall: Send + Sync {
    fn call(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, Error>> + Send;
}

impl RpcCall for RpcTransport {
    fn call(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, Error>> + Send {
        RpcTransport::call(self, method, params)
    }
}

impl RpcCall for HttpTransport {
    fn call(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, Error>> + Send {
        HttpTransport::call(self, method, params)
    }
}

// ── Channel ──────────────────────────────────────────────────────────

/// Whichever transport a session currently routes through.
#[derive(Debug, Clone)]
pub enum Channel {
    Rpc(RpcTransport),
    Http(HttpTransport),
}

impl Channel {
    pub fn is_rpc(&self) -> bool {
        matches!(self, Self::Rpc(_))
    }
}

impl RpcCall for Channel {
    fn call(
        &self,
        method: &str,
        params: Value,
    ) -> impl Future<Output = Result<Value, Error>> + Send {
        async move {
            match self {
                Self::Rpc(rpc) => rpc.call(method, params).await,
                Self::Http(http) => http.call(method, params).await,
            }
        }
    }
}

// ── Script operations ────────────────────────────────────────────────

/// Typed wrappers for the device methods the session layer consumes.
///
/// Blanket-implemented for every [`RpcCall`], so the same calls work over
/// the control channel and the HTTP fallback.
pub trait ScriptApi: RpcCall {
    /// `script.list`
    fn list_scripts(&self) -> impl Future<Output = Result<Vec<ScriptInfo>, Error>> + Send {
        async move {
            let value = self.call("script.list", json!({})).await?;
            Ok(decode::<ScriptList>("script.list", &value)?.scripts)
        }
    }

    /// `script.getcode`, following `left` until the whole text is read.
    ///
    /// The device pages stored code by bytes: `offset` and `left` both
    /// count UTF-8 bytes, so the next offset advances by the byte length
    /// of the page just read.
    fn get_code(&self, id: u32) -> impl Future<Output = Result<String, Error>> + Send {
        async move {
            let mut code = String::new();
            let mut offset = 0usize;
            loop {
                let params = if offset == 0 {
                    json!({ "id": id })
                } else {
                    json!({ "id": id, "offset": offset })
                };
                let value = self.call("script.getcode", params).await?;
                let page: CodePage = decode("script.getcode", &value)?;
                if page.left == 0 {
                    code.push_str(&page.data);
                    return Ok(code);
                }
                if page.data.is_empty() {
                    return Err(Error::Protocol(format!(
                        "script.getcode for {id} made no progress with {} characters left",
                        page.left
                    )));
                }
                offset += page.data.len();
                code.push_str(&page.data);
            }
        }
    }

    /// One `script.putcode` write. Use [`upload_code`](crate::upload_code)
    /// for whole texts.
    fn put_code(
        &self,
        id: u32,
        code: &str,
        append: bool,
    ) -> impl Future<Output = Result<PutCodeResult, Error>> + Send {
        let params = json!({ "id": id, "code": code, "append": append });
        async move {
            let value = self.call("script.putcode", params).await?;
            if value.is_null() {
                return Ok(PutCodeResult::default());
            }
            decode("script.putcode", &value)
        }
    }

    /// `script.create`
    fn create_script(&self, name: &str) -> impl Future<Output = Result<u32, Error>> + Send {
        let params = json!({ "name": name });
        async move {
            let value = self.call("script.create", params).await?;
            Ok(decode::<CreatedScript>("script.create", &value)?.id)
        }
    }

    /// `script.delete`
    fn delete_script(&self, id: u32) -> impl Future<Output = Result<(), Error>> + Send {
        async move {
            self.call("script.delete", json!({ "id": id })).await?;
            Ok(())
        }
    }

    /// `script.start`, returning whether the script was already running.
    fn start_script(&self, id: u32) -> impl Future<Output = Result<bool, Error>> + Send {
        async move {
            let value = self.call("script.start", json!({ "id": id })).await?;
            Ok(decode_or_default::<RunResult>("script.start", &value)?.was_running)
        }
    }

    /// `script.stop`, returning whether the script was running.
    fn stop_script(&self, id: u32) -> impl Future<Output = Result<bool, Error>> + Send {
        async move {
            let value = self.call("script.stop", json!({ "id": id })).await?;
            Ok(decode_or_default::<RunResult>("script.stop", &value)?.was_running)
        }
    }

    /// `script.setConfig {enable}`, returning `restart_required`.
    fn set_enabled(
        &self,
        id: u32,
        enable: bool,
    ) -> impl Future<Output = Result<bool, Error>> + Send {
        async move {
            let params = json!({ "id": id, "config": { "enable": enable } });
            let value = self.call("script.setConfig", params).await?;
            Ok(decode_or_default::<ConfigResult>("script.setConfig", &value)?.restart_required)
        }
    }

    /// `script.setConfig {name}`
    fn rename_script(&self, id: u32, name: &str) -> impl Future<Output = Result<(), Error>> + Send {
        let params = json!({ "id": id, "config": { "name": name } });
        async move {
            self.call("script.setConfig", params).await?;
            Ok(())
        }
    }

    /// `script.eval`, returning the result as text.
    fn eval_script(
        &self,
        id: u32,
        code: &str,
    ) -> impl Future<Output = Result<String, Error>> + Send {
        let params = json!({ "id": id, "code": code });
        async move {
            let value = self.call("script.eval", params).await?;
            Ok(decode_or_default::<EvalResult>("script.eval", &value)?.text())
        }
    }

    /// `shelly.getdeviceinfo`
    fn device_info(&self) -> impl Future<Output = Result<DeviceInfo, Error>> + Send {
        async move {
            let value = self.call("shelly.getdeviceinfo", json!({})).await?;
            decode("shelly.getdeviceinfo", &value)
        }
    }

    /// `sys.setconfig` turning on the debug log WebSocket.
    fn enable_debug_websocket(&self) -> impl Future<Output = Result<bool, Error>> + Send {
        async move {
            let params = json!({ "config": { "debug": { "websocket": { "enable": true } } } });
            let value = self.call("sys.setconfig", params).await?;
            Ok(decode_or_default::<ConfigResult>("sys.setconfig", &value)?.restart_required)
        }
    }
}

impl<T: RpcCall> ScriptApi for T {}

fn decode_or_default<T>(method: &str, value: &Value) -> Result<T, Error>
where
    T: serde::de::DeserializeOwned + Default,
{
    if value.is_null() {
        Ok(T::default())
    } else {
        decode(method, value)
    }
}
