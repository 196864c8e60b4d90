use serde::{Deserialize, Serialize};
use shellyctl_api::ScriptInfo;

/// A script as cached by its device session.
///
/// `code` is a snapshot from the last sync and may be stale. It is `None`
/// when fetching the code failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Script {
    pub id: u32,
    pub name: String,
    pub enabled: bool,
    pub running: bool,
    pub code: Option<String>,
}

impl Script {
    pub(crate) fn from_info(info: ScriptInfo, code: Option<String>) -> Self {
        Self {
            id: info.id,
            name: info.name,
            enabled: info.enable,
            running: info.running,
            code,
        }
    }
}
