// shellyctl-core: Device sessions, discovery, and the live device registry
// between shellyctl-api and consumers (CLI, editor integrations).

pub mod config;
pub mod discovery;
pub mod error;
pub mod fleet;
pub mod model;
pub mod registry;
pub mod session;

// ── Primary re-exports ──────────────────────────────────────────────
pub use config::{DiscoveryConfig, FleetConfig, ResetPolicy, UploadConfig};
pub use discovery::Discovery;
pub use error::CoreError;
pub use fleet::Fleet;
pub use registry::{DeviceRegistry, RegistryEvent};
pub use session::{DeviceSession, SaveOutcome, SessionEvent, SessionState};

pub use model::{ActiveSelection, ConsoleFormat, LogEntry, Script};

// Wire-level types consumers commonly need alongside the core.
pub use shellyctl_api::{TransportConfig, UploadReport};
