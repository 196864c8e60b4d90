// ── Device registry ──
//
// Owns every live session. A session sits in `connecting` from the moment
// it is added until it first reports `Ready`, then moves to `devices`
// where lookups see it. Session events are re-broadcast tagged with the
// device identifier. A session that closes is evicted and, unless banned,
// forgotten by discovery so the device can be found again.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::FleetConfig;
use crate::discovery::Discovery;
use crate::error::CoreError;
use crate::model::ActiveSelection;
use crate::session::{DeviceSession, SessionEvent};

const EVENT_CHANNEL_SIZE: usize = 1024;

/// What the registry broadcasts.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    /// A session event, tagged with its device.
    Session { device: String, event: SessionEvent },
    /// The set of indexed devices changed: `device` became ready or was
    /// evicted.
    Changed { device: String },
}

impl RegistryEvent {
    pub fn device(&self) -> &str {
        match self {
            Self::Session { device, .. } | Self::Changed { device } => device,
        }
    }
}

/// Live device sessions plus the active selection.
///
/// Cheaply cloneable; clones share state.
#[derive(Clone)]
pub struct DeviceRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    config: Arc<FleetConfig>,
    discovery: Discovery,
    connecting: DashMap<String, DeviceSession>,
    devices: DashMap<String, DeviceSession>,
    active: Mutex<Option<ActiveSelection>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl std::fmt::Debug for DeviceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceRegistry")
            .field("devices", &self.device_ids())
            .field("connecting", &self.inner.connecting.len())
            .field("active", &self.active())
            .finish_non_exhaustive()
    }
}

impl DeviceRegistry {
    pub fn new(config: Arc<FleetConfig>, discovery: Discovery) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            inner: Arc::new(RegistryInner {
                config,
                discovery,
                connecting: DashMap::new(),
                devices: DashMap::new(),
                active: Mutex::new(None),
                events,
            }),
        }
    }

    fn active_slot(&self) -> MutexGuard<'_, Option<ActiveSelection>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    // ── Membership ───────────────────────────────────────────────────

    /// Start a session for `identifier`.
    ///
    /// Returns `Ok(None)` without doing anything if the device is banned
    /// or already has a session (connecting or ready).
    pub fn add_device(&self, identifier: &str) -> Result<Option<DeviceSession>, CoreError> {
        if self.inner.discovery.is_banned(identifier) {
            debug!(device = %identifier, "ignoring banned device");
            return Ok(None);
        }
        if self.inner.devices.contains_key(identifier) {
            return Ok(None);
        }

        let session = match self.inner.connecting.entry(identifier.to_string()) {
            Entry::Occupied(_) => return Ok(None),
            Entry::Vacant(slot) => {
                let session = DeviceSession::new(
                    identifier,
                    Arc::clone(&self.inner.config),
                    self.inner.discovery.clone(),
                )?;
                slot.insert(session.clone());
                session
            }
        };

        // Subscribe before starting so no event is missed.
        let events = session.subscribe();
        self.forward(identifier, &session, events);
        session.start();
        info!(device = %identifier, "session started");
        Ok(Some(session))
    }

    /// Drop a session from the registry without destroying it. No-op for
    /// banned devices.
    pub fn remove_device(&self, identifier: &str) -> Option<DeviceSession> {
        if self.inner.discovery.is_banned(identifier) {
            return None;
        }
        let connecting = self.inner.connecting.remove(identifier).map(|(_, s)| s);
        let indexed = self.inner.devices.remove(identifier).map(|(_, s)| s);
        if indexed.is_some() {
            self.emit(RegistryEvent::Changed {
                device: identifier.to_string(),
            });
        }
        indexed.or(connecting)
    }

    /// Destroy every session, connecting or ready.
    pub fn destroy_all(&self) {
        let sessions: Vec<DeviceSession> = self
            .inner
            .connecting
            .iter()
            .chain(self.inner.devices.iter())
            .map(|entry| entry.value().clone())
            .collect();
        for session in sessions {
            session.destroy();
        }
        self.active_slot().take();
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// A ready session.
    pub fn device(&self, identifier: &str) -> Option<DeviceSession> {
        self.inner
            .devices
            .get(identifier)
            .map(|entry| entry.value().clone())
    }

    /// A session in either state, connecting or ready.
    pub fn session(&self, identifier: &str) -> Option<DeviceSession> {
        self.device(identifier).or_else(|| {
            self.inner
                .connecting
                .get(identifier)
                .map(|entry| entry.value().clone())
        })
    }

    /// Ready sessions, ordered by identifier.
    pub fn devices(&self) -> Vec<DeviceSession> {
        let mut devices: Vec<DeviceSession> = self
            .inner
            .devices
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        devices.sort_by(|a, b| a.identifier().cmp(b.identifier()));
        devices
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .devices
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    /// Sessions that have not reported `Ready` yet.
    pub fn connecting_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .connecting
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        ids.sort();
        ids
    }

    // ── Active selection ─────────────────────────────────────────────

    /// Make `script_id` on `identifier` the active script.
    ///
    /// Moving to another device closes the old device's debug log and
    /// opens the new one's. Staying on the same device leaves the stream
    /// alone.
    pub fn set_active(
        &self,
        identifier: &str,
        script_id: u32,
        script_name: &str,
    ) -> Result<(), CoreError> {
        let session = self
            .device(identifier)
            .ok_or_else(|| CoreError::DeviceNotFound {
                identifier: identifier.to_string(),
            })?;

        let previous = self
            .active_slot()
            .replace(ActiveSelection::new(identifier, script_id, script_name));

        match previous {
            Some(previous) if previous.device == identifier => {}
            Some(previous) => {
                if let Some(old) = self.device(&previous.device) {
                    old.close_debug_log();
                }
                session.open_debug_log()?;
            }
            None => session.open_debug_log()?,
        }
        debug!(device = %identifier, script = script_id, "active script set");
        Ok(())
    }

    /// Forget the active selection. Streams stay as they are.
    pub fn clear_active(&self) -> Option<ActiveSelection> {
        self.active_slot().take()
    }

    pub fn active(&self) -> Option<ActiveSelection> {
        self.active_slot().clone()
    }

    /// The session behind the active selection.
    pub fn active_device(&self) -> Option<DeviceSession> {
        let device = self.active()?.device;
        self.device(&device)
    }

    // ── Event forwarding ─────────────────────────────────────────────

    fn forward(
        &self,
        identifier: &str,
        session: &DeviceSession,
        mut events: broadcast::Receiver<SessionEvent>,
    ) {
        let registry = self.clone();
        let session = session.clone();
        let device = identifier.to_string();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(device = %device, skipped, "registry lagged behind session events");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let closed = event == SessionEvent::Closed;
                let indexed =
                    event == SessionEvent::Ready && registry.index(&device, &session);
                registry.emit(RegistryEvent::Session {
                    device: device.clone(),
                    event,
                });
                if indexed {
                    registry.emit(RegistryEvent::Changed {
                        device: device.clone(),
                    });
                }
                if closed {
                    registry.evict(&device, &session);
                    break;
                }
            }
        });
    }

    /// Returns false for a session removed while it was connecting; it is
    /// not brought back.
    fn index(&self, identifier: &str, session: &DeviceSession) -> bool {
        let removed = self
            .inner
            .connecting
            .remove_if(identifier, |_, s| s.ptr_eq(session));
        if removed.is_none() {
            return false;
        }
        self.inner
            .devices
            .insert(identifier.to_string(), session.clone());
        info!(device = %identifier, name = %session.display_name(), "device ready");
        true
    }

    fn evict(&self, identifier: &str, session: &DeviceSession) {
        self.inner
            .connecting
            .remove_if(identifier, |_, s| s.ptr_eq(session));
        let was_indexed = self
            .inner
            .devices
            .remove_if(identifier, |_, s| s.ptr_eq(session))
            .is_some();

        {
            let mut active = self.active_slot();
            if active.as_ref().is_some_and(|a| a.device == identifier) {
                *active = None;
            }
        }

        if !self.inner.discovery.is_banned(identifier) {
            self.inner.discovery.forget(identifier);
        }
        info!(device = %identifier, "session evicted");
        if was_indexed {
            self.emit(RegistryEvent::Changed {
                device: identifier.to_string(),
            });
        }
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.inner.events.send(event);
    }
}
