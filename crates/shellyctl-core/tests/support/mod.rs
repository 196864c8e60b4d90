// A scriptable Shelly device on a local port. Serves the control channel
// at `/rpc` and the debug log at `/debug/log`.
#![allow(clippy::unwrap_used, dead_code)]

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;

pub const GUARD: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct StoredScript {
    pub name: String,
    pub enable: bool,
    pub running: bool,
    pub code: String,
}

#[derive(Default)]
struct DeviceState {
    scripts: Mutex<BTreeMap<u32, StoredScript>>,
    require_auth: AtomicBool,
    fail_list: AtomicBool,
    failing_getcode: Mutex<HashSet<u32>>,
    getcode_delay: Mutex<Option<Duration>>,
    drop_on_getcode: AtomicBool,
    slow_putcode: Mutex<HashSet<u32>>,
    max_accept: Mutex<Option<usize>>,
    calls: Mutex<Vec<String>>,
    rpc_connections: AtomicUsize,
    debug_opens: AtomicUsize,
    debug_active: AtomicUsize,
}

/// Handle to a running fake device.
#[derive(Clone)]
pub struct FakeDevice {
    identifier: String,
    state: Arc<DeviceState>,
    notifications: broadcast::Sender<Value>,
    log_lines: broadcast::Sender<String>,
    drop_rpc: Arc<Mutex<CancellationToken>>,
}

impl FakeDevice {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let identifier = listener.local_addr().unwrap().to_string();
        let (notifications, _) = broadcast::channel(64);
        let (log_lines, _) = broadcast::channel(64);

        let device = Self {
            identifier,
            state: Arc::new(DeviceState::default()),
            notifications,
            log_lines,
            drop_rpc: Arc::new(Mutex::new(CancellationToken::new())),
        };

        let server = device.clone();
        tokio::spawn(async move {
            loop {
                let Ok((tcp, _)) = listener.accept().await else {
                    break;
                };
                let device = server.clone();
                tokio::spawn(async move { device.serve(tcp).await });
            }
        });
        device
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    // ── Setup ───────────────────────────────────────────────────────

    pub fn with_script(&self, id: u32, name: &str, code: &str) -> &Self {
        self.state.scripts.lock().unwrap().insert(
            id,
            StoredScript {
                name: name.into(),
                enable: false,
                running: false,
                code: code.into(),
            },
        );
        self
    }

    pub fn require_auth(&self) {
        self.state.require_auth.store(true, Ordering::SeqCst);
    }

    pub fn fail_list(&self, fail: bool) {
        self.state.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn fail_getcode(&self, id: u32) {
        self.state.failing_getcode.lock().unwrap().insert(id);
    }

    /// Answer every `script.getcode` after `delay`.
    pub fn delay_getcode(&self, delay: Duration) {
        *self.state.getcode_delay.lock().unwrap() = Some(delay);
    }

    /// Close the control channel instead of answering the next
    /// `script.getcode`.
    pub fn drop_on_next_getcode(&self) {
        self.state.drop_on_getcode.store(true, Ordering::SeqCst);
    }

    pub fn remove_script(&self, id: u32) {
        self.state.scripts.lock().unwrap().remove(&id);
    }

    /// Never answer `script.putcode` for `id`.
    pub fn stall_putcode(&self, id: u32) {
        self.state.slow_putcode.lock().unwrap().insert(id);
    }

    /// Accept at most `chars` characters per `script.putcode`.
    pub fn cap_putcode(&self, chars: usize) {
        *self.state.max_accept.lock().unwrap() = Some(chars);
    }

    // ── Driving ─────────────────────────────────────────────────────

    pub fn notify(&self, frame: Value) {
        self.notifications.send(frame).unwrap();
    }

    pub fn log(&self, ts: f64, level: i64, data: &str) {
        let line = json!({ "ts": ts, "level": level, "data": data }).to_string();
        let _ = self.log_lines.send(line);
    }

    /// Close every open control channel from the device side.
    pub fn drop_control_channels(&self) {
        let mut token = self.drop_rpc.lock().unwrap();
        token.cancel();
        *token = CancellationToken::new();
    }

    // ── Inspection ──────────────────────────────────────────────────

    pub fn script(&self, id: u32) -> Option<StoredScript> {
        self.state.scripts.lock().unwrap().get(&id).cloned()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, method: &str) -> usize {
        self.calls().iter().filter(|m| *m == method).count()
    }

    pub fn rpc_connections(&self) -> usize {
        self.state.rpc_connections.load(Ordering::SeqCst)
    }

    pub fn debug_opens(&self) -> usize {
        self.state.debug_opens.load(Ordering::SeqCst)
    }

    pub fn debug_active(&self) -> usize {
        self.state.debug_active.load(Ordering::SeqCst)
    }

    // ── Serving ─────────────────────────────────────────────────────

    async fn serve(self, tcp: TcpStream) {
        let path = Arc::new(Mutex::new(String::new()));
        let seen = Arc::clone(&path);
        let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            *seen.lock().unwrap() = req.uri().path().to_string();
            Ok(resp)
        };
        let Ok(ws) = tokio_tungstenite::accept_hdr_async(tcp, callback).await else {
            return;
        };

        let path = path.lock().unwrap().clone();
        match path.as_str() {
            "/rpc" => self.serve_rpc(ws).await,
            "/debug/log" => self.serve_log(ws).await,
            _ => {}
        }
    }

    async fn serve_rpc(&self, ws: WebSocketStream<TcpStream>) {
        self.state.rpc_connections.fetch_add(1, Ordering::SeqCst);
        let drop_token = self.drop_rpc.lock().unwrap().clone();
        let mut notifications = self.notifications.subscribe();
        let (mut write, mut read) = ws.split();
        let (reply_tx, mut reply_rx) = tokio::sync::mpsc::unbounded_channel::<Value>();

        loop {
            tokio::select! {
                () = drop_token.cancelled() => {
                    let _ = write.close().await;
                    return;
                }
                Ok(frame) = notifications.recv() => {
                    let _ = write.send(Message::text(frame.to_string())).await;
                }
                Some(reply) = reply_rx.recv() => {
                    let _ = write.send(Message::text(reply.to_string())).await;
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        let request: Value = serde_json::from_str(&text).unwrap();
                        let device = self.clone();
                        let tx = reply_tx.clone();
                        tokio::spawn(async move {
                            if let Some(reply) = device.handle(&request).await {
                                let _ = tx.send(reply);
                            }
                        });
                    }
                    Some(Ok(_)) => {}
                    _ => return,
                }
            }
        }
    }

    async fn serve_log(&self, ws: WebSocketStream<TcpStream>) {
        let mut lines = self.log_lines.subscribe();
        self.state.debug_opens.fetch_add(1, Ordering::SeqCst);
        self.state.debug_active.fetch_add(1, Ordering::SeqCst);
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                Ok(line) = lines.recv() => {
                    if write.send(Message::text(line)).await.is_err() {
                        break;
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
        self.state.debug_active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn handle(&self, request: &Value) -> Option<Value> {
        let id = request["id"].clone();
        let method = request["method"].as_str().unwrap_or_default().to_string();
        let params = &request["params"];
        self.state.calls.lock().unwrap().push(method.clone());

        let outcome = if self.state.require_auth.load(Ordering::SeqCst) {
            Err((401, "Unauthorized".to_string()))
        } else {
            self.dispatch(&method, params).await?
        };

        Some(match outcome {
            Ok(result) => json!({ "id": id, "src": "shellyplus1-fake", "result": result }),
            Err((code, message)) => json!({
                "id": id,
                "src": "shellyplus1-fake",
                "error": { "code": code, "message": message }
            }),
        })
    }

    /// `None` means the device never answers.
    async fn dispatch(&self, method: &str, params: &Value) -> Option<Result<Value, (i64, String)>> {
        let script_id = params["id"].as_u64().and_then(|v| u32::try_from(v).ok());
        let not_found = |id: Option<u32>| -> Result<Value, (i64, String)> {
            Err((-105, format!("Argument 'id', value {} not found!", id.unwrap_or_default())))
        };

        let outcome = match method {
            "sys.setconfig" => Ok(json!({ "restart_required": false })),
            "shelly.getdeviceinfo" => Ok(json!({
                "name": "Kitchen",
                "id": "shellyplus1-fake",
                "model": "SNSW-001X16EU",
                "gen": 2,
                "auth_en": false
            })),
            "script.list" => {
                if self.state.fail_list.load(Ordering::SeqCst) {
                    Err((-1, "script.list exploded".to_string()))
                } else {
                    let scripts: Vec<Value> = self
                        .state
                        .scripts
                        .lock()
                        .unwrap()
                        .iter()
                        .map(|(id, s)| {
                            json!({ "id": id, "name": s.name, "enable": s.enable, "running": s.running })
                        })
                        .collect();
                    Ok(json!({ "scripts": scripts }))
                }
            }
            "script.getcode" => {
                let id = script_id?;
                if self.state.drop_on_getcode.swap(false, Ordering::SeqCst) {
                    self.drop_control_channels();
                    return None;
                }
                let delay = *self.state.getcode_delay.lock().unwrap();
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                if self.state.failing_getcode.lock().unwrap().contains(&id) {
                    Err((-108, "Failed to read script".to_string()))
                } else {
                    match self.script(id) {
                        Some(script) => {
                            let offset = usize::try_from(params["offset"].as_u64().unwrap_or(0)).unwrap();
                            let data = script.code.get(offset..).unwrap_or_default();
                            Ok(json!({ "data": data, "left": 0 }))
                        }
                        None => not_found(Some(id)),
                    }
                }
            }
            "script.putcode" => {
                let id = script_id?;
                if self.state.slow_putcode.lock().unwrap().contains(&id) {
                    return None;
                }
                let code = params["code"].as_str().unwrap_or_default();
                let append = params["append"].as_bool().unwrap_or(false);
                let cap = *self.state.max_accept.lock().unwrap();
                let accepted: String = code.chars().take(cap.unwrap_or(usize::MAX)).collect();
                let mut scripts = self.state.scripts.lock().unwrap();
                match scripts.get_mut(&id) {
                    Some(script) => {
                        if !append {
                            script.code.clear();
                        }
                        script.code.push_str(&accepted);
                        Ok(json!({ "len": accepted.chars().count() }))
                    }
                    None => not_found(Some(id)),
                }
            }
            "script.create" => {
                let name = params["name"].as_str().unwrap_or_default().to_string();
                let mut scripts = self.state.scripts.lock().unwrap();
                let id = scripts.keys().next_back().map_or(1, |last| last + 1);
                scripts.insert(
                    id,
                    StoredScript {
                        name,
                        enable: false,
                        running: false,
                        code: String::new(),
                    },
                );
                Ok(json!({ "id": id }))
            }
            "script.delete" => match self.state.scripts.lock().unwrap().remove(&script_id?) {
                Some(_) => Ok(Value::Null),
                None => not_found(script_id),
            },
            "script.start" | "script.stop" => {
                let running = method == "script.start";
                match self.state.scripts.lock().unwrap().get_mut(&script_id?) {
                    Some(script) => {
                        let was_running = script.running;
                        script.running = running;
                        Ok(json!({ "was_running": was_running }))
                    }
                    None => not_found(script_id),
                }
            }
            "script.setConfig" => match self.state.scripts.lock().unwrap().get_mut(&script_id?) {
                Some(script) => {
                    if let Some(name) = params["config"]["name"].as_str() {
                        script.name = name.to_string();
                    }
                    if let Some(enable) = params["config"]["enable"].as_bool() {
                        script.enable = enable;
                    }
                    Ok(json!({ "restart_required": false }))
                }
                None => not_found(script_id),
            },
            "script.eval" => {
                let code = params["code"].as_str().unwrap_or_default();
                Ok(json!({ "result": format!("evaluated {code}") }))
            }
            other => Err((-114, format!("Method {other} failed: No handler"))),
        };
        Some(outcome)
    }
}

/// Poll `condition` until it holds or the guard expires.
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(GUARD, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition did not hold in time");
}

/// Receive until `pick` matches, returning what it picked.
pub async fn next_matching<E, T, F>(rx: &mut broadcast::Receiver<E>, mut pick: F) -> T
where
    E: Clone,
    F: FnMut(&E) -> Option<T>,
{
    tokio::time::timeout(GUARD, async {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(&event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}
