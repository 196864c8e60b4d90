// ── Fleet facade ──
//
// Wires discovery into the registry: every newly discovered identifier
// becomes a session. Consumers hold one `Fleet` and reach everything else
// through it.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{FleetConfig, ResetPolicy};
use crate::discovery::Discovery;
use crate::error::CoreError;
use crate::registry::{DeviceRegistry, RegistryEvent};
use crate::session::DeviceSession;

/// Discovery plus the registry it feeds.
#[derive(Debug, Clone)]
pub struct Fleet {
    config: Arc<FleetConfig>,
    discovery: Discovery,
    registry: DeviceRegistry,
}

impl Fleet {
    pub fn new(config: FleetConfig) -> Self {
        let config = Arc::new(config);
        let discovery = Discovery::new(config.discovery.clone());
        let registry = DeviceRegistry::new(Arc::clone(&config), discovery.clone());
        Self {
            config,
            discovery,
            registry,
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.registry.subscribe()
    }

    /// Route discoveries into the registry and, if enabled, start
    /// browsing the network.
    pub fn start(&self) -> Result<(), CoreError> {
        let registry = self.registry.clone();
        self.discovery.subscribe(move |identifier| {
            if let Err(e) = registry.add_device(&identifier) {
                warn!(device = %identifier, error = %e, "cannot add discovered device");
            }
        });

        if self.config.discovery.enabled {
            self.discovery.start()?;
        } else {
            debug!("network discovery disabled");
        }
        Ok(())
    }

    /// Add a device by address, bypassing discovery.
    pub fn add_device(&self, identifier: &str) -> Result<Option<DeviceSession>, CoreError> {
        self.registry.add_device(identifier)
    }

    /// Restart discovery.
    ///
    /// Under [`ResetPolicy::BanDiscovered`] the reset bans every discovered
    /// identifier, so their sessions are destroyed first; a banned device
    /// never keeps a live session. Devices added by hand are untouched.
    pub fn reset(&self) -> Result<(), CoreError> {
        info!("resetting discovery");
        if self.config.discovery.reset_policy == ResetPolicy::BanDiscovered {
            for identifier in self.discovery.discovered() {
                if let Some(session) = self.registry.session(&identifier) {
                    session.destroy();
                }
            }
        }

        self.discovery.destroy();
        if self.config.discovery.enabled {
            self.discovery.start()?;
        }
        Ok(())
    }

    /// Stop discovery and destroy every session.
    pub fn shutdown(&self) {
        self.discovery.destroy();
        self.registry.destroy_all();
        info!("fleet shut down");
    }
}
