//! Persistent JSON-RPC control channel over WebSocket.
//!
//! One [`RpcTransport`] per device. Every call gets the next request id,
//! is registered as pending, and resolves when a reply carrying that id
//! arrives. Replies may come back in any order; correlation is strictly
//! by id. Frames with a `method` and no matching pending id are device
//! notifications and go to the single registered handler.
//!
//! # Example
//!
//! ```rust,ignore
//! use shellyctl_api::{RpcTransport, TransportConfig};
//! use serde_json::json;
//!
//! let rpc = RpcTransport::open("shellyplus1-a8032ab12345.local", &TransportConfig::default()).await?;
//! rpc.on_notification(|n| println!("{}: {}", n.method, n.params));
//!
//! let scripts = rpc.call("script.list", json!({})).await?;
//! rpc.close();
//! ```

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::Error;
use crate::models::{InboundFrame, Notification, RpcRequest};
use crate::transport::{TransportConfig, rpc_url};

const JSONRPC_VERSION: &str = "2.0";

type Reply = oneshot::Sender<Result<Value, Error>>;

struct HandlerSlot(Box<dyn Fn(Notification) + Send + Sync>);

// ── Shared channel state ─────────────────────────────────────────────

struct Shared {
    identifier: String,
    source: String,
    next_id: AtomicU64,
    pending: DashMap<u64, Reply>,
    handler: ArcSwapOption<HandlerSlot>,
    /// Cancelled by [`RpcTransport::close`].
    shutdown: CancellationToken,
    /// Cancelled once the channel is gone, whatever the cause.
    closed: CancellationToken,
    terminated: AtomicBool,
    lost: AtomicBool,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.shutdown.is_cancelled()
    }

    /// Route one inbound text frame.
    fn dispatch(&self, text: &str) {
        let frame: InboundFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(device = %self.identifier, error = %e, "discarding malformed frame");
                return;
            }
        };

        if let Some(id) = frame.request_id() {
            if let Some((_, reply)) = self.pending.remove(&id) {
                tracing::trace!(device = %self.identifier, id, "reply");
                let _ = reply.send(frame.into_outcome(text));
                return;
            }
        }

        if let Some(method) = frame.method {
            let notification = Notification {
                method,
                params: frame.params.unwrap_or(Value::Null),
            };
            match self.handler.load_full() {
                Some(slot) => (slot.0)(notification),
                None => tracing::trace!(
                    device = %self.identifier,
                    method = %notification.method,
                    "notification without handler"
                ),
            }
            return;
        }

        tracing::debug!(device = %self.identifier, "dropping reply with no pending request");
    }

    /// Mark the channel gone and reject every outstanding call.
    ///
    /// `closed` is cancelled before draining so a call registering
    /// concurrently either sees the flag or is drained here.
    fn terminate(&self, lost: bool) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.lost.store(lost, Ordering::SeqCst);
        self.closed.cancel();

        let ids: Vec<u64> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, reply)) = self.pending.remove(&id) {
                let _ = reply.send(Err(Error::ChannelClosed));
            }
        }
        self.handler.store(None);

        if lost {
            tracing::info!(device = %self.identifier, "control channel lost");
        } else {
            tracing::debug!(device = %self.identifier, "control channel closed");
        }
    }
}

// ── RpcTransport ─────────────────────────────────────────────────────

/// Handle to an open control channel. Clones share the channel.
#[derive(Clone)]
pub struct RpcTransport {
    shared: Arc<Shared>,
    outbound: mpsc::UnboundedSender<Message>,
}

impl fmt::Debug for RpcTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcTransport")
            .field("identifier", &self.shared.identifier)
            .field("pending", &self.shared.pending.len())
            .field("closed", &self.shared.is_closed())
            .finish_non_exhaustive()
    }
}

impl RpcTransport {
    /// Open the control channel at `ws://{identifier}/rpc`.
    ///
    /// Resolves once the WebSocket handshake completes. A handshake
    /// rejected with 401 yields [`Error::Unauthorized`]; any other failure
    /// yields [`Error::Connect`].
    pub async fn open(identifier: &str, config: &TransportConfig) -> Result<Self, Error> {
        let url = rpc_url(identifier)?;
        Self::open_url(identifier, &url, config).await
    }

    /// Open the control channel at an explicit URL.
    pub async fn open_url(
        identifier: &str,
        url: &Url,
        config: &TransportConfig,
    ) -> Result<Self, Error> {
        tracing::debug!(device = %identifier, url = %url, "opening control channel");

        let (ws_stream, _response) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| handshake_error(url, e))?;

        tracing::info!(device = %identifier, "control channel open");

        let (sink, stream) = ws_stream.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            identifier: identifier.to_string(),
            source: config.source.clone(),
            next_id: AtomicU64::new(0),
            pending: DashMap::new(),
            handler: ArcSwapOption::empty(),
            shutdown: CancellationToken::new(),
            closed: CancellationToken::new(),
            terminated: AtomicBool::new(false),
            lost: AtomicBool::new(false),
        });

        tokio::spawn(write_loop(sink, outbound_rx, Arc::clone(&shared)));
        tokio::spawn(read_loop(stream, Arc::clone(&shared)));

        Ok(Self { shared, outbound })
    }

    /// The device identifier this channel talks to.
    pub fn identifier(&self) -> &str {
        &self.shared.identifier
    }

    /// Issue one RPC call and wait for its reply.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, Error> {
        if self.shared.is_closed() {
            return Err(Error::ChannelClosed);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let request = RpcRequest {
            jsonrpc: JSONRPC_VERSION,
            id,
            src: &self.shared.source,
            method,
            params: &params,
        };
        let text = serde_json::to_string(&request).map_err(|e| Error::Protocol(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.shared.pending.insert(id, tx);
        if self.shared.is_closed() {
            self.shared.pending.remove(&id);
            return Err(Error::ChannelClosed);
        }

        tracing::trace!(device = %self.shared.identifier, id, method, "call");
        if self.outbound.send(Message::text(text)).is_err() {
            self.shared.pending.remove(&id);
            return Err(Error::ChannelClosed);
        }

        rx.await.unwrap_or(Err(Error::ChannelClosed))
    }

    /// Install the notification handler, replacing any previous one.
    pub fn on_notification<F>(&self, handler: F)
    where
        F: Fn(Notification) + Send + Sync + 'static,
    {
        self.shared
            .handler
            .store(Some(Arc::new(HandlerSlot(Box::new(handler)))));
    }

    /// Close the channel. Outstanding calls are rejected with
    /// [`Error::ChannelClosed`]. Idempotent.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
    }

    /// Whether the channel is closed or closing.
    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Resolves once the channel has terminated.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    /// `true` if the channel ended without [`close`](Self::close) being
    /// called (remote close, stream error, or EOF).
    pub fn was_lost(&self) -> bool {
        self.shared.lost.load(Ordering::SeqCst)
    }

    /// Number of calls still waiting for a reply.
    pub fn pending_calls(&self) -> usize {
        self.shared.pending.len()
    }
}

fn handshake_error(url: &Url, err: tungstenite::Error) -> Error {
    match err {
        tungstenite::Error::Http(response) if response.status().as_u16() == 401 => {
            Error::Unauthorized
        }
        other => Error::Connect {
            url: url.to_string(),
            reason: other.to_string(),
        },
    }
}

// ── Background loops ─────────────────────────────────────────────────

async fn write_loop<S>(mut sink: S, mut outbound: mpsc::UnboundedReceiver<Message>, shared: Arc<Shared>)
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin + Send + 'static,
{
    loop {
        tokio::select! {
            biased;
            () = shared.closed.cancelled() => break,
            message = outbound.recv() => {
                let Some(message) = message else { break };
                if let Err(e) = sink.send(message).await {
                    tracing::warn!(device = %shared.identifier, error = %e, "write failed");
                    shared.terminate(true);
                    break;
                }
            }
        }
    }
    let _ = sink.close().await;
}

async fn read_loop<R>(mut stream: R, shared: Arc<Shared>)
where
    R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin + Send + 'static,
{
    let lost = loop {
        tokio::select! {
            biased;
            () = shared.shutdown.cancelled() => break false,
            () = shared.closed.cancelled() => return,
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => shared.dispatch(&text),
                Some(Ok(Message::Close(frame))) => {
                    if let Some(cf) = frame {
                        tracing::debug!(
                            device = %shared.identifier,
                            code = %cf.code,
                            reason = %cf.reason,
                            "close frame received"
                        );
                    }
                    break true;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(device = %shared.identifier, error = %e, "control channel error");
                    break true;
                }
                None => break true,
            }
        }
    };
    shared.terminate(lost);
}
