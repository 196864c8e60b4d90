use serde::{Deserialize, Serialize};

/// The script the user is working on. At most one per registry; its
/// device is the one whose debug log stream is open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveSelection {
    pub device: String,
    pub script_id: u32,
    pub script_name: String,
}

impl ActiveSelection {
    pub fn new(device: impl Into<String>, script_id: u32, script_name: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            script_id,
            script_name: script_name.into(),
        }
    }
}
