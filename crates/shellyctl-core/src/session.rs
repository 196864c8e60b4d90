// ── Device session ──
//
// One session per device. Opens the control channel, turns on the debug
// log, pulls the script list and code into a local cache, and then keeps
// that cache fresh by resyncing whenever the device reports a script
// change. Script operations go through the control channel while it is
// up and through the HTTP fallback otherwise.
//
//   Connecting → DebugNegotiating → Syncing → Ready
//        │              │              │
//        └──────────────┴──────────────┴──→ Destroyed   (Errored from any)

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use arc_swap::ArcSwapOption;
use shellyctl_api::{
    Channel, DebugLogStream, HttpTransport, Notification, RpcTransport, ScriptApi, UploadReport,
    upload_code,
};
use tokio::sync::{broadcast, mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::FleetConfig;
use crate::discovery::Discovery;
use crate::error::CoreError;
use crate::model::{ConsoleFormat, LogEntry, Script};

const EVENT_CHANNEL_SIZE: usize = 256;

// ── SessionState ─────────────────────────────────────────────────

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum SessionState {
    Connecting,
    DebugNegotiating,
    Syncing,
    Ready,
    Errored,
    Destroyed,
}

impl SessionState {
    /// States a caller waiting for readiness stops at.
    fn is_settled(self) -> bool {
        matches!(self, Self::Ready | Self::Errored | Self::Destroyed)
    }
}

// ── SessionEvent ─────────────────────────────────────────────────

/// Events a session broadcasts to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// First successful sync. Emitted once per session.
    Ready,
    /// A later resync rebuilt the cache.
    Changed,
    /// One per listed script on every sync, in listing order, sent before
    /// any code is fetched (so `code` is `None`).
    ScriptChanged(Script),
    DebugMessage(LogEntry),
    /// A non-fatal problem worth showing to the user.
    ErrorMessage(String),
    /// `index` 0 is print output, 1 is log output.
    ConsoleFormatChanged { index: usize, enabled: bool },
    /// Terminal. Nothing follows.
    Closed,
}

/// How `save_script` got the code onto the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    /// Uploaded into the existing script.
    Uploaded(UploadReport),
    /// The upload failed or timed out; a new script was created with the
    /// code instead.
    Recreated { id: u32 },
}

// ── DeviceSession ────────────────────────────────────────────────

/// Live session with one device.
///
/// Cheaply cloneable via `Arc<SessionInner>`. Create with
/// [`new`](Self::new), then [`start`](Self::start) to connect.
#[derive(Clone)]
pub struct DeviceSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    identifier: String,
    config: Arc<FleetConfig>,
    discovery: Discovery,
    state: watch::Sender<SessionState>,
    events: broadcast::Sender<SessionEvent>,
    display_name: RwLock<String>,
    scripts: RwLock<HashMap<u32, Script>>,
    debug_messages: Mutex<Vec<LogEntry>>,
    console_format: Mutex<ConsoleFormat>,
    rpc: ArcSwapOption<RpcTransport>,
    http: HttpTransport,
    debug_stream: Mutex<Option<DebugLogStream>>,
    sync_lock: tokio::sync::Mutex<()>,
    ready_emitted: AtomicBool,
    destroyed: AtomicBool,
    /// Held while emitting and while flipping `destroyed`, so no event is
    /// sent after `Closed`.
    emit_gate: Mutex<()>,
    last_error: Mutex<Option<CoreError>>,
    cancel: CancellationToken,
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("identifier", &self.inner.identifier)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl DeviceSession {
    /// Create a session. Does NOT connect; call [`start`](Self::start).
    pub fn new(
        identifier: &str,
        config: Arc<FleetConfig>,
        discovery: Discovery,
    ) -> Result<Self, CoreError> {
        let http = HttpTransport::new(identifier, &config.transport)?;
        let (state, _) = watch::channel(SessionState::Connecting);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        Ok(Self {
            inner: Arc::new(SessionInner {
                identifier: identifier.to_string(),
                config,
                discovery,
                state,
                events,
                display_name: RwLock::new(identifier.to_string()),
                scripts: RwLock::new(HashMap::new()),
                debug_messages: Mutex::new(Vec::new()),
                console_format: Mutex::new(ConsoleFormat::default()),
                rpc: ArcSwapOption::empty(),
                http,
                debug_stream: Mutex::new(None),
                sync_lock: tokio::sync::Mutex::new(()),
                ready_emitted: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                emit_gate: Mutex::new(()),
                last_error: Mutex::new(None),
                cancel: CancellationToken::new(),
            }),
        })
    }

    // ── Accessors ────────────────────────────────────────────────

    pub fn identifier(&self) -> &str {
        &self.inner.identifier
    }

    /// The device's reported name, or its identifier until it reports one.
    pub fn display_name(&self) -> String {
        self.inner
            .display_name
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }

    /// Whether script operations currently use the control channel.
    pub fn uses_control_channel(&self) -> bool {
        self.channel().is_rpc()
    }

    /// The last failure that moved this session to `Errored` or
    /// `Destroyed`.
    pub fn last_error(&self) -> Option<CoreError> {
        lock(&self.inner.last_error).clone()
    }

    /// Same underlying session.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Cached scripts, ordered by id.
    pub fn scripts(&self) -> Vec<Script> {
        let mut scripts: Vec<Script> = self
            .inner
            .scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        scripts.sort_by_key(|s| s.id);
        scripts
    }

    pub fn script(&self, id: u32) -> Option<Script> {
        self.inner
            .scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Cached code of a script. `Ok(None)` if its code could not be
    /// fetched during the last sync.
    pub fn script_code(&self, id: u32) -> Result<Option<String>, CoreError> {
        self.script(id)
            .map(|s| s.code)
            .ok_or_else(|| self.script_not_found(id))
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Spawn the connect → negotiate → sync sequence.
    pub fn start(&self) {
        let session = self.clone();
        tokio::spawn(async move { session.run().await });
    }

    /// Wait until the session is `Ready`, or report why it is not.
    pub async fn wait_ready(&self) -> Result<(), CoreError> {
        let mut rx = self.watch_state();
        let state = *rx
            .wait_for(|s| s.is_settled())
            .await
            .map_err(|_| self.destroyed_error())?;

        match state {
            SessionState::Ready => Ok(()),
            _ => Err(self.last_error().unwrap_or_else(|| self.destroyed_error())),
        }
    }

    async fn run(&self) {
        let id = self.inner.identifier.clone();
        info!(device = %id, "connecting");

        let rpc = match RpcTransport::open(&id, &self.inner.config.transport).await {
            Ok(rpc) => rpc,
            Err(e) => {
                let err = CoreError::from(e);
                if err.is_unauthorized() {
                    self.inner.discovery.ban(&id);
                }
                error!(device = %id, error = %err, "cannot open control channel");
                self.record_error(err);
                self.destroy();
                return;
            }
        };

        self.inner.rpc.store(Some(Arc::new(rpc.clone())));
        if self.is_destroyed() {
            if let Some(rpc) = self.inner.rpc.swap(None) {
                rpc.close();
            }
            return;
        }
        self.watch_channel(&rpc);

        // Debug log negotiation
        self.set_state(SessionState::DebugNegotiating);
        if let Err(e) = rpc.enable_debug_websocket().await {
            let err = CoreError::from(e);
            if err.is_unauthorized() {
                warn!(device = %id, "device requires authentication, banning");
                self.inner.discovery.ban(&id);
                self.record_error(err);
                self.destroy();
                return;
            }
            warn!(device = %id, error = %err, "enabling the debug log failed");
            self.emit(SessionEvent::ErrorMessage(format!(
                "Enabling the debug log for {id} failed."
            )));
        }
        if self.is_destroyed() {
            return;
        }

        // Initial sync
        self.set_state(SessionState::Syncing);
        let synced = self.sync().await;
        if self.is_destroyed() {
            return;
        }

        self.install_notification_handler(&rpc);
        match synced {
            Ok(()) => self.become_ready().await,
            Err(err) => self.fail_sync(err),
        }
    }

    /// Destroy the session when the control channel drops on its own.
    fn watch_channel(&self, rpc: &RpcTransport) {
        let session = self.clone();
        let rpc = rpc.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = session.inner.cancel.cancelled() => {}
                () = rpc.closed() => {
                    if rpc.was_lost() {
                        info!(device = %session.identifier(), "control channel lost");
                        session.record_error(CoreError::ConnectionFailed {
                            reason: "control channel closed by device".into(),
                        });
                        session.destroy();
                    }
                }
            }
        });
    }

    /// Resync whenever a notification mentions scripts. One resync per
    /// matching notification.
    fn install_notification_handler(&self, rpc: &RpcTransport) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Notification>();
        rpc.on_notification(move |notification| {
            if notification.touches_scripts() {
                let _ = tx.send(notification);
            }
        });

        let session = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = session.inner.cancel.cancelled() => break,
                    notification = rx.recv() => {
                        let Some(notification) = notification else { break };
                        debug!(
                            device = %session.identifier(),
                            method = %notification.method,
                            "script notification, resyncing"
                        );
                        if let Err(e) = session.resync().await {
                            debug!(device = %session.identifier(), error = %e, "resync failed");
                        }
                    }
                }
            }
        });
    }

    /// Tear the session down. Idempotent; emits `Closed` once.
    pub fn destroy(&self) {
        {
            let _gate = lock(&self.inner.emit_gate);
            if self.inner.destroyed.swap(true, Ordering::SeqCst) {
                return;
            }
        }
        self.inner.cancel.cancel();
        if let Some(rpc) = self.inner.rpc.swap(None) {
            rpc.close();
        }
        self.close_debug_log();
        self.set_state(SessionState::Destroyed);
        info!(device = %self.inner.identifier, "session destroyed");
        let _ = self.inner.events.send(SessionEvent::Closed);
    }

    // ── Sync ─────────────────────────────────────────────────────

    /// Rebuild the script cache from the device.
    ///
    /// Moves an `Errored` session back to `Ready` on success.
    pub async fn resync(&self) -> Result<(), CoreError> {
        self.ensure_alive()?;
        match self.sync().await {
            Ok(()) => {
                self.become_ready().await;
                Ok(())
            }
            Err(err) => {
                self.fail_sync(err.clone());
                Err(err)
            }
        }
    }

    /// List scripts and fetch each one's code into a fresh map, then swap
    /// it in. Serialized per session.
    ///
    /// Nothing is swapped in if the session is destroyed or the control
    /// channel drops while the code is being fetched.
    async fn sync(&self) -> Result<(), CoreError> {
        let _guard = self.inner.sync_lock.lock().await;
        self.ensure_alive()?;

        let channel = self.channel();
        let listed = channel.list_scripts().await?;
        self.ensure_alive()?;
        debug!(device = %self.inner.identifier, scripts = listed.len(), "listed");
        for info in &listed {
            self.emit(SessionEvent::ScriptChanged(Script::from_info(info.clone(), None)));
        }

        let mut fresh = HashMap::with_capacity(listed.len());
        for info in listed {
            let code = match channel.get_code(info.id).await {
                Ok(code) => Some(code),
                Err(e) => {
                    warn!(
                        device = %self.inner.identifier,
                        script = info.id,
                        error = %e,
                        "failed to fetch script code"
                    );
                    None
                }
            };
            let script = Script::from_info(info, code);
            fresh.insert(script.id, script);
        }

        self.ensure_alive()?;
        if let Channel::Rpc(rpc) = &channel {
            if rpc.is_closed() {
                return Err(CoreError::ConnectionFailed {
                    reason: "control channel closed during sync".into(),
                });
            }
        }

        *self
            .inner
            .scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner) = fresh;
        debug!(device = %self.inner.identifier, "synced");
        Ok(())
    }

    async fn become_ready(&self) {
        if self.is_destroyed() {
            return;
        }
        if !self.inner.ready_emitted.load(Ordering::SeqCst) {
            self.refresh_display_name().await;
        }
        self.set_state(SessionState::Ready);
        if self.inner.ready_emitted.swap(true, Ordering::SeqCst) {
            self.emit(SessionEvent::Changed);
        } else {
            info!(
                device = %self.inner.identifier,
                name = %self.display_name(),
                "session ready"
            );
            self.emit(SessionEvent::Ready);
        }
    }

    fn fail_sync(&self, err: CoreError) {
        if self.is_destroyed() {
            return;
        }
        error!(device = %self.inner.identifier, error = %err, "script sync failed");
        self.emit(SessionEvent::ErrorMessage(format!(
            "Fetching scripts from {} failed: {err}",
            self.inner.identifier
        )));
        self.record_error(err);
        self.set_state(SessionState::Errored);
    }

    async fn refresh_display_name(&self) {
        let name = match self.channel().device_info().await {
            Ok(info) => info.name.filter(|n| !n.is_empty()),
            Err(e) => {
                debug!(device = %self.inner.identifier, error = %e, "device info unavailable");
                None
            }
        };
        *self
            .inner
            .display_name
            .write()
            .unwrap_or_else(PoisonError::into_inner) =
            name.unwrap_or_else(|| self.inner.identifier.clone());
    }

    /// Resync after a successful mutation. A failure here is already
    /// surfaced as an `ErrorMessage`.
    async fn refresh_after_change(&self) {
        if let Err(e) = self.resync().await {
            debug!(device = %self.inner.identifier, error = %e, "resync after change failed");
        }
    }

    /// Overwrite the cached enabled flag of one script.
    pub fn set_script_enabled(&self, id: u32, enabled: bool) -> bool {
        let mut scripts = self
            .inner
            .scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        match scripts.get_mut(&id) {
            Some(script) => {
                script.enabled = enabled;
                true
            }
            None => false,
        }
    }

    // ── Script operations ────────────────────────────────────────

    /// Create a script named `name` holding `code`. Returns its id.
    pub async fn create_script(&self, name: &str, code: &str) -> Result<u32, CoreError> {
        self.ensure_alive()?;
        let channel = self.channel();
        let id = channel.create_script(name).await?;
        upload_code(&channel, id, code, self.inner.config.upload.chunk_size).await?;
        info!(device = %self.inner.identifier, script = id, name, "script created");
        self.refresh_after_change().await;
        Ok(id)
    }

    /// Upload `code` as the full text of script `id`.
    pub async fn upload_script(&self, id: u32, code: &str) -> Result<UploadReport, CoreError> {
        self.ensure_alive()?;
        let report = upload_code(&self.channel(), id, code, self.inner.config.upload.chunk_size)
            .await?;
        Ok(report)
    }

    /// Upload `code` into script `id`, giving up after the configured save
    /// timeout and recreating the script as `name` instead.
    pub async fn save_script(
        &self,
        id: u32,
        name: &str,
        code: &str,
    ) -> Result<SaveOutcome, CoreError> {
        self.ensure_alive()?;
        let limit = self.inner.config.upload.save_timeout;

        match tokio::time::timeout(limit, self.upload_script(id, code)).await {
            Ok(Ok(report)) => {
                self.refresh_after_change().await;
                return Ok(SaveOutcome::Uploaded(report));
            }
            Ok(Err(e)) => {
                warn!(device = %self.inner.identifier, script = id, error = %e, "upload failed, recreating script");
            }
            Err(_) => {
                warn!(
                    device = %self.inner.identifier,
                    script = id,
                    timeout_ms = u64::try_from(limit.as_millis()).unwrap_or(u64::MAX),
                    "upload timed out, recreating script"
                );
            }
        }

        let new_id = self.create_script(name, code).await?;
        Ok(SaveOutcome::Recreated { id: new_id })
    }

    pub async fn rename_script(&self, id: u32, name: &str) -> Result<(), CoreError> {
        self.require_script(id)?;
        self.channel().rename_script(id, name).await?;
        self.refresh_after_change().await;
        Ok(())
    }

    pub async fn delete_script(&self, id: u32) -> Result<(), CoreError> {
        self.require_script(id)?;
        self.channel().delete_script(id).await?;
        info!(device = %self.inner.identifier, script = id, "script deleted");
        self.refresh_after_change().await;
        Ok(())
    }

    /// Returns whether the script was already running.
    pub async fn start_script(&self, id: u32) -> Result<bool, CoreError> {
        self.require_script(id)?;
        Ok(self.channel().start_script(id).await?)
    }

    /// Returns whether the script was running.
    pub async fn stop_script(&self, id: u32) -> Result<bool, CoreError> {
        self.require_script(id)?;
        Ok(self.channel().stop_script(id).await?)
    }

    /// Returns whether the device needs a restart for the change.
    pub async fn enable_script(&self, id: u32) -> Result<bool, CoreError> {
        self.set_enabled(id, true).await
    }

    /// Returns whether the device needs a restart for the change.
    pub async fn disable_script(&self, id: u32) -> Result<bool, CoreError> {
        self.set_enabled(id, false).await
    }

    async fn set_enabled(&self, id: u32, enabled: bool) -> Result<bool, CoreError> {
        self.require_script(id)?;
        let restart_required = self.channel().set_enabled(id, enabled).await?;
        self.set_script_enabled(id, enabled);
        Ok(restart_required)
    }

    /// Evaluate `code` in the context of script `id`.
    pub async fn eval_script(&self, id: u32, code: &str) -> Result<String, CoreError> {
        self.require_script(id)?;
        Ok(self.channel().eval_script(id, code).await?)
    }

    // ── Debug log ────────────────────────────────────────────────

    /// Open the device's debug log stream, replacing any open one.
    pub fn open_debug_log(&self) -> Result<(), CoreError> {
        self.ensure_alive()?;
        let weak = Arc::downgrade(&self.inner);
        let stream = DebugLogStream::open(&self.inner.identifier, move |line| {
            if let Some(inner) = weak.upgrade() {
                DeviceSession { inner }.record_log(LogEntry::from(line));
            }
        })?;

        let previous = lock(&self.inner.debug_stream).replace(stream);
        if let Some(previous) = previous {
            previous.close();
        }
        debug!(device = %self.inner.identifier, "debug log opened");
        Ok(())
    }

    /// Close the debug log stream. Returns whether one was open.
    pub fn close_debug_log(&self) -> bool {
        let stream = lock(&self.inner.debug_stream).take();
        match stream {
            Some(stream) => {
                stream.close();
                debug!(device = %self.inner.identifier, "debug log closed");
                true
            }
            None => false,
        }
    }

    pub fn is_debug_log_open(&self) -> bool {
        lock(&self.inner.debug_stream)
            .as_ref()
            .is_some_and(|s| !s.is_closed())
    }

    /// Buffer one log entry and announce it.
    pub fn record_log(&self, entry: LogEntry) {
        lock(&self.inner.debug_messages).push(entry.clone());
        self.emit(SessionEvent::DebugMessage(entry));
    }

    /// Every buffered entry, oldest first.
    pub fn log_entries(&self) -> Vec<LogEntry> {
        lock(&self.inner.debug_messages).clone()
    }

    /// Buffered entries the current console format admits.
    pub fn visible_log_entries(&self) -> Vec<LogEntry> {
        let format = self.console_format();
        lock(&self.inner.debug_messages)
            .iter()
            .filter(|e| format.admits(e))
            .cloned()
            .collect()
    }

    pub fn console_format(&self) -> ConsoleFormat {
        *lock(&self.inner.console_format)
    }

    /// Flip `print()` output. Returns the new setting.
    pub fn toggle_print_output(&self) -> bool {
        let enabled = {
            let mut format = lock(&self.inner.console_format);
            format.show_print = !format.show_print;
            format.show_print
        };
        self.emit(SessionEvent::ConsoleFormatChanged { index: 0, enabled });
        enabled
    }

    /// Flip log output. Returns the new setting.
    pub fn toggle_log_output(&self) -> bool {
        let enabled = {
            let mut format = lock(&self.inner.console_format);
            format.show_log = !format.show_log;
            format.show_log
        };
        self.emit(SessionEvent::ConsoleFormatChanged { index: 1, enabled });
        enabled
    }

    // ── Internals ────────────────────────────────────────────────

    /// Control channel while it is up, HTTP otherwise.
    fn channel(&self) -> Channel {
        match self.inner.rpc.load_full() {
            Some(rpc) if !rpc.is_closed() => Channel::Rpc(RpcTransport::clone(&rpc)),
            _ => Channel::Http(self.inner.http.clone()),
        }
    }

    /// Dropped once the session is destroyed; `Closed` is always last.
    fn emit(&self, event: SessionEvent) {
        let _gate = lock(&self.inner.emit_gate);
        if self.is_destroyed() {
            return;
        }
        let _ = self.inner.events.send(event);
    }

    fn set_state(&self, next: SessionState) {
        let identifier = &self.inner.identifier;
        self.inner.state.send_if_modified(|current| {
            if *current == next || *current == SessionState::Destroyed {
                return false;
            }
            debug!(device = %identifier, from = %current, to = %next, "state");
            *current = next;
            true
        });
    }

    fn record_error(&self, err: CoreError) {
        *lock(&self.inner.last_error) = Some(err);
    }

    fn ensure_alive(&self) -> Result<(), CoreError> {
        if self.is_destroyed() {
            Err(self.destroyed_error())
        } else {
            Ok(())
        }
    }

    fn require_script(&self, id: u32) -> Result<(), CoreError> {
        self.ensure_alive()?;
        if self.script(id).is_some() {
            Ok(())
        } else {
            Err(self.script_not_found(id))
        }
    }

    fn destroyed_error(&self) -> CoreError {
        CoreError::SessionDestroyed {
            device: self.inner.identifier.clone(),
        }
    }

    fn script_not_found(&self, id: u32) -> CoreError {
        CoreError::ScriptNotFound {
            device: self.inner.identifier.clone(),
            id,
        }
    }
}
