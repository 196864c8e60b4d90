// shellyctl-api: Async Rust client for the Shelly Gen2+ RPC protocol
// (WebSocket control channel, HTTP fallback, debug log stream)

pub mod debug_log;
pub mod error;
pub mod http;
pub mod models;
pub mod rpc;
pub mod transport;
pub mod upload;
pub mod websocket;

pub use debug_log::{DebugLogStream, LogLine, PRINT_LEVEL};
pub use error::Error;
pub use http::HttpTransport;
pub use models::{DeviceInfo, Notification, ScriptInfo};
pub use rpc::{Channel, RpcCall, ScriptApi};
pub use transport::TransportConfig;
pub use upload::{UPLOAD_CHUNK_SIZE, UploadReport, upload_code};
pub use websocket::RpcTransport;
