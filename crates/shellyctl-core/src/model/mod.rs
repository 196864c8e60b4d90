// ── Domain model ──
//
// Canonical shapes the session layer hands to consumers: cached scripts,
// buffered debug log entries, console filtering, and the active selection.

pub mod log;
pub mod script;
pub mod selection;

pub use log::{ConsoleFormat, LogEntry};
pub use script::Script;
pub use selection::ActiveSelection;
