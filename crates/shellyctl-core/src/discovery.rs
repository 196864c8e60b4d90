// ── Device discovery ──
//
// Browses mDNS for Shelly devices and reports each new identifier once.
// Two disjoint sets live under a single lock: identifiers already
// discovered, and identifiers banned for good (authorization failures,
// and by default everything seen before a reset). Neither set ever
// produces a second callback.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use arc_swap::ArcSwapOption;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{DiscoveryConfig, ResetPolicy};
use crate::error::CoreError;

/// Marker that identifies a Shelly service record name.
pub const SERVICE_SUFFIX: &str = "._shelly._tcp";

/// Extract a device identifier from a service record name.
///
/// `shellyplus1-a8032ab12345._shelly._tcp.local.` becomes
/// `shellyplus1-a8032ab12345.local`. Matching is case-insensitive; names
/// without the marker, or with nothing before it, yield `None`.
pub fn identifier_from_record(name: &str) -> Option<String> {
    let start = name.to_ascii_lowercase().find(SERVICE_SUFFIX)?;
    if start == 0 {
        return None;
    }
    let mut identifier = String::with_capacity(name.len());
    identifier.push_str(&name[..start]);
    identifier.push_str(&name[start + SERVICE_SUFFIX.len()..]);
    Some(identifier.trim_end_matches('.').to_string())
}

#[derive(Debug, Default)]
struct DiscoverySets {
    discovered: HashSet<String>,
    banned: HashSet<String>,
}

struct Callback(Box<dyn Fn(String) + Send + Sync>);

struct Listener {
    daemon: ServiceDaemon,
    cancel: CancellationToken,
}

struct DiscoveryInner {
    config: DiscoveryConfig,
    sets: Mutex<DiscoverySets>,
    callback: ArcSwapOption<Callback>,
    listener: Mutex<Option<Listener>>,
}

/// Deduplicating device discovery with a permanent ban list.
///
/// Cheaply cloneable; clones share state.
#[derive(Clone)]
pub struct Discovery {
    inner: Arc<DiscoveryInner>,
}

impl fmt::Debug for Discovery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discovery")
            .field("config", &self.inner.config)
            .field("sets", &*self.sets())
            .finish_non_exhaustive()
    }
}

impl Discovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            inner: Arc::new(DiscoveryInner {
                config,
                sets: Mutex::new(DiscoverySets::default()),
                callback: ArcSwapOption::empty(),
                listener: Mutex::new(None),
            }),
        }
    }

    fn sets(&self) -> MutexGuard<'_, DiscoverySets> {
        self.inner.sets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the callback for newly discovered identifiers, replacing
    /// any previous one.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.inner
            .callback
            .store(Some(Arc::new(Callback(Box::new(callback)))));
    }

    /// Feed one service record name through discovery. Returns the
    /// identifier if it was new.
    pub fn observe(&self, record_name: &str) -> Option<String> {
        let identifier = identifier_from_record(record_name)?;
        self.announce(&identifier).then_some(identifier)
    }

    /// Report an identifier directly. Returns `false` if it was already
    /// discovered or is banned.
    pub fn announce(&self, identifier: &str) -> bool {
        {
            let mut sets = self.sets();
            if sets.banned.contains(identifier) || !sets.discovered.insert(identifier.to_string())
            {
                return false;
            }
        }

        debug!(device = %identifier, "discovered");
        if let Some(callback) = self.inner.callback.load_full() {
            (callback.0)(identifier.to_string());
        }
        true
    }

    /// Ban an identifier permanently.
    pub fn ban(&self, identifier: &str) {
        let mut sets = self.sets();
        sets.discovered.remove(identifier);
        if sets.banned.insert(identifier.to_string()) {
            info!(device = %identifier, "device banned");
        }
    }

    /// Drop an identifier from the discovered set so a later announcement
    /// reports it again. Banned identifiers stay banned.
    pub fn forget(&self, identifier: &str) {
        if self.sets().discovered.remove(identifier) {
            debug!(device = %identifier, "forgotten");
        }
    }

    pub fn is_banned(&self, identifier: &str) -> bool {
        self.sets().banned.contains(identifier)
    }

    /// Discovered or banned.
    pub fn is_known(&self, identifier: &str) -> bool {
        let sets = self.sets();
        sets.discovered.contains(identifier) || sets.banned.contains(identifier)
    }

    /// Discovered identifiers, sorted.
    pub fn discovered(&self) -> Vec<String> {
        sorted(&self.sets().discovered)
    }

    /// Banned identifiers, sorted.
    pub fn banned(&self) -> Vec<String> {
        sorted(&self.sets().banned)
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    // ── Listener lifecycle ───────────────────────────────────────────

    /// Start browsing for devices. No-op if already browsing.
    pub fn start(&self) -> Result<(), CoreError> {
        let mut listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if listener.is_some() {
            return Ok(());
        }

        let service_type = &self.inner.config.service_type;
        let daemon = ServiceDaemon::new().map_err(discovery_error)?;
        let receiver = daemon.browse(service_type).map_err(discovery_error)?;
        info!(service = %service_type, "browsing for devices");

        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let discovery = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = task_cancel.cancelled() => break,
                    event = receiver.recv_async() => match event {
                        Ok(ServiceEvent::ServiceFound(_, fullname)) => {
                            discovery.observe(&fullname);
                        }
                        Ok(ServiceEvent::ServiceResolved(info)) => {
                            discovery.observe(info.get_fullname());
                        }
                        Ok(_) => {}
                        Err(_) => break,
                    }
                }
            }
            debug!("discovery listener stopped");
        });

        *listener = Some(Listener { daemon, cancel });
        Ok(())
    }

    /// Stop browsing and apply the reset policy to what was discovered.
    pub fn destroy(&self) {
        let listener = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(listener) = listener {
            listener.cancel.cancel();
            if let Err(e) = listener.daemon.shutdown() {
                warn!(error = %e, "failed to shut down mDNS daemon");
            }
        }

        let mut sets = self.sets();
        match self.inner.config.reset_policy {
            ResetPolicy::BanDiscovered => {
                let discovered: Vec<String> = sets.discovered.drain().collect();
                sets.banned.extend(discovered);
            }
            ResetPolicy::Forget => sets.discovered.clear(),
        }
    }

    /// Stop and restart browsing.
    pub fn reset(&self) -> Result<(), CoreError> {
        self.destroy();
        self.start()
    }
}

fn discovery_error(err: mdns_sd::Error) -> CoreError {
    CoreError::Discovery {
        message: err.to_string(),
    }
}

fn sorted(set: &HashSet<String>) -> Vec<String> {
    let mut items: Vec<String> = set.iter().cloned().collect();
    items.sort();
    items
}
