//! Device debug log stream (`ws://{identifier}/debug/log`).
//!
//! Independent of the control channel. Every text frame carries one or
//! more newline-separated JSON objects `{ts, level, data}`; lines that do
//! not have that shape are dropped. The stream runs on a background task
//! until [`DebugLogStream::close`] is called or the device hangs up.

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::transport::debug_log_url;

/// Level the device uses for `print()` output.
pub const PRINT_LEVEL: i64 = -1;

/// One line of device debug output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogLine {
    /// Device uptime-based timestamp in seconds.
    pub ts: f64,
    /// `-1` for script `print()` output, otherwise a log level.
    pub level: i64,
    pub data: String,
}

/// Parse one line of a debug log frame.
pub fn parse_log_line(line: &str) -> Option<LogLine> {
    serde_json::from_str(line.trim()).ok()
}

/// Handle to a running debug log stream.
#[derive(Debug)]
pub struct DebugLogStream {
    identifier: String,
    cancel: CancellationToken,
}

impl DebugLogStream {
    /// Open the debug log of `identifier`, calling `on_line` for every
    /// well-formed line.
    ///
    /// Returns immediately; the connection is made on the background task
    /// and a failure to connect is logged, not returned.
    pub fn open<F>(identifier: &str, on_line: F) -> Result<Self, Error>
    where
        F: Fn(LogLine) + Send + Sync + 'static,
    {
        let url = debug_log_url(identifier)?;
        Ok(Self::open_url(identifier, url, on_line))
    }

    /// Open a debug log stream at an explicit URL.
    pub fn open_url<F>(identifier: &str, url: Url, on_line: F) -> Self
    where
        F: Fn(LogLine) + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let device = identifier.to_string();

        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = task_cancel.cancelled() => {}
                result = connect_and_read(&url, &device, &on_line) => {
                    if let Err(e) = result {
                        tracing::warn!(device = %device, error = %e, "debug log stream failed");
                    }
                }
            }
            task_cancel.cancel();
            tracing::debug!(device = %device, "debug log stream stopped");
        });

        Self {
            identifier: identifier.to_string(),
            cancel,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Stop the stream. Idempotent.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the stream has stopped, by request or because the
    /// connection ended.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for DebugLogStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn connect_and_read(
    url: &Url,
    device: &str,
    on_line: &(dyn Fn(LogLine) + Send + Sync),
) -> Result<(), Error> {
    let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
        .await
        .map_err(|e| Error::Connect {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

    tracing::info!(device = %device, "debug log stream open");
    let (_write, mut read) = ws_stream.split();

    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                for line in text.lines().filter(|l| !l.trim().is_empty()) {
                    match parse_log_line(line) {
                        Some(entry) => on_line(entry),
                        None => tracing::trace!(device = %device, line, "discarding log line"),
                    }
                }
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(Error::Connect {
                    url: url.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
    Ok(())
}
