// ── Runtime fleet configuration ──
//
// These types describe how the core talks to devices and finds them.
// They never touch disk: shellyctl-config (or any other consumer) builds a
// `FleetConfig` and hands it in.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use shellyctl_api::{TransportConfig, UPLOAD_CHUNK_SIZE};

/// mDNS service browsed for devices.
pub const DEFAULT_SERVICE_TYPE: &str = "_shelly._tcp.local.";

/// What `Discovery::destroy` does with identifiers it has seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResetPolicy {
    /// Fold every discovered identifier into the banned set. After a
    /// reset none of them are discovered again, and `Fleet::reset`
    /// destroys their sessions.
    #[default]
    BanDiscovered,
    /// Forget discovered identifiers so a reset rediscovers them.
    Forget,
}

/// Discovery settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryConfig {
    /// Browse the network at `Fleet::start`. Devices can still be added
    /// by hand when disabled.
    pub enabled: bool,
    pub service_type: String,
    pub reset_policy: ResetPolicy,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            service_type: DEFAULT_SERVICE_TYPE.to_string(),
            reset_policy: ResetPolicy::default(),
        }
    }
}

/// Script upload tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadConfig {
    /// Characters per `script.putcode` write.
    pub chunk_size: usize,
    /// How long `save_script` waits for the upload before recreating the
    /// script instead.
    pub save_timeout: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: UPLOAD_CHUNK_SIZE,
            save_timeout: Duration::from_secs(5),
        }
    }
}

/// Everything the core needs to run a fleet of device sessions.
#[derive(Debug, Clone, Default)]
pub struct FleetConfig {
    pub transport: TransportConfig,
    pub discovery: DiscoveryConfig,
    pub upload: UploadConfig,
}
