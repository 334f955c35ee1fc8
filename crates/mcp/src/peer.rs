//! Bidirectional JSON-RPC session over an [`McpTransport`].
//!
//! Both ends of an MCP connection may send requests, so client and server
//! share this machinery:
//!
//! - outbound requests get a fresh numeric id and park a oneshot in the
//!   pending map until the matching response arrives
//! - a background reader task owns the receive half, resolves responses,
//!   and dispatches inbound traffic to a [`MessageHandler`]
//! - inbound requests run concurrently (one task each); notifications are
//!   handled inline so their order is preserved
//!
//! When the transport ends every pending request fails with
//! [`McpError::ConnectionClosed`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::McpError;
use crate::messages::{empty_result, methods};
use crate::transport::McpTransport;
use crate::types::{
    IncomingMessage, JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse, RpcId,
};

/// Default time to wait for a response before giving up on a request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Handles requests and notifications initiated by the remote side.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let _ = params;
        Err(JsonRpcError::method_not_found(method))
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        let _ = params;
        debug!(method = %method, "unhandled notification");
    }
}

/// Handler that answers every request with "method not found".
pub struct NoopHandler;

impl MessageHandler for NoopHandler {}

/// Tunables for a [`Peer`].
#[derive(Debug, Clone)]
pub struct PeerOptions {
    /// `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

type PendingResponse = oneshot::Sender<Result<Value, JsonRpcError>>;

struct PeerShared {
    label: String,
    transport: Arc<dyn McpTransport>,
    next_id: AtomicI64,
    pending: Mutex<HashMap<RpcId, PendingResponse>>,
    closed: watch::Sender<bool>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    request_timeout: Option<Duration>,
}

/// Cheaply cloneable handle to one JSON-RPC session.
#[derive(Clone)]
pub struct Peer {
    shared: Arc<PeerShared>,
}

impl Peer {
    /// Start the reader task and return the session handle.
    ///
    /// `label` only appears in logs.
    pub fn start(
        label: impl Into<String>,
        transport: Arc<dyn McpTransport>,
        handler: Arc<dyn MessageHandler>,
        options: PeerOptions,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(PeerShared {
            label: label.into(),
            transport,
            next_id: AtomicI64::new(0),
            pending: Mutex::new(HashMap::new()),
            closed,
            reader: std::sync::Mutex::new(None),
            request_timeout: options.request_timeout,
        });

        let reader = tokio::spawn(read_loop(Arc::clone(&shared), handler));
        if let Ok(mut slot) = shared.reader.lock() {
            *slot = Some(reader);
        }

        Self { shared }
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    /// Send a request and wait for its result.
    ///
    /// The request timeout covers delivery as well as the reply, since some
    /// transports (HTTP) only finish sending once the server answers.
    /// A JSON-RPC error from the remote side comes back as
    /// [`McpError::Rpc`]. On timeout the remote side is told to cancel.
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, McpError> {
        let shared = &self.shared;
        let id = RpcId::Number(shared.next_id.fetch_add(1, Ordering::SeqCst));
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = shared.pending.lock().await;
            if self.is_closed() {
                return Err(McpError::ConnectionClosed);
            }
            pending.insert(id.clone(), tx);
        }

        let message = serde_json::to_string(&JsonRpcRequest::new(id.clone(), method, params))?;
        debug!(peer = %shared.label, id = %id, method = %method, "sending request");
        let exchange = async {
            shared.transport.send(&message).await?;
            rx.await.map_err(|_| McpError::ConnectionClosed)
        };

        let outcome = match shared.request_timeout {
            Some(limit) => match tokio::time::timeout(limit, exchange).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    shared.pending.lock().await.remove(&id);
                    warn!(peer = %shared.label, id = %id, method = %method, "request timed out");
                    self.cancel_in_background(&id, limit);
                    return Err(McpError::Timeout(limit));
                }
            },
            None => exchange.await,
        };

        match outcome {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(error)) => Err(McpError::Rpc(error)),
            Err(e) => {
                shared.pending.lock().await.remove(&id);
                Err(e)
            }
        }
    }

    /// Tell the remote side to drop a timed-out request without making the
    /// caller wait on a transport that may itself be stuck.
    fn cancel_in_background(&self, id: &RpcId, limit: Duration) {
        let peer = self.clone();
        let cancel = serde_json::json!({
            "requestId": id,
            "reason": format!("Request timed out after {limit:?}"),
        });
        tokio::spawn(async move {
            if let Err(e) = peer.notify(methods::NOTIFY_CANCELLED, Some(cancel)).await {
                debug!(peer = %peer.shared.label, error = %e, "failed to send cancellation");
            }
        });
    }

    /// Send a notification. No response is expected, but delivery is still
    /// bounded by the request timeout.
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        if self.is_closed() {
            return Err(McpError::ConnectionClosed);
        }
        let message = serde_json::to_string(&JsonRpcNotification::new(method, params))?;
        let delivery = self.shared.transport.send(&message);
        match self.shared.request_timeout {
            Some(limit) => tokio::time::timeout(limit, delivery)
                .await
                .map_err(|_| McpError::Timeout(limit))?,
            None => delivery.await,
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Resolves once the session has ended, from either side.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// End the session: fail pending requests, stop the reader, close the
    /// transport. Calling it again is a no-op.
    pub async fn close(&self) -> Result<(), McpError> {
        if !self.shared.mark_closed().await {
            return Ok(());
        }
        let reader = self.shared.reader.lock().ok().and_then(|mut r| r.take());
        if let Some(reader) = reader {
            reader.abort();
        }
        debug!(peer = %self.shared.label, "closing session");
        self.shared.transport.close().await
    }
}

impl PeerShared {
    /// Flip the closed flag and fail every pending request.
    /// Returns false if the session was already closed.
    async fn mark_closed(&self) -> bool {
        let mut pending = self.pending.lock().await;
        if self.closed.send_replace(true) {
            return false;
        }
        // dropping the senders wakes every waiter with ConnectionClosed
        pending.clear();
        true
    }

    async fn send_response(&self, response: JsonRpcResponse) {
        let message = match serde_json::to_string(&response) {
            Ok(m) => m,
            Err(e) => {
                warn!(peer = %self.label, error = %e, "failed to serialize response");
                return;
            }
        };
        if let Err(e) = self.transport.send(&message).await {
            debug!(peer = %self.label, id = %response.id, error = %e, "failed to send response");
        }
    }

    async fn resolve(&self, response: JsonRpcResponse) {
        let Some(tx) = self.pending.lock().await.remove(&response.id) else {
            debug!(peer = %self.label, id = %response.id, "response for unknown request id");
            return;
        };
        let outcome = match response.error {
            Some(error) => Err(error),
            None => Ok(response.result.unwrap_or(Value::Null)),
        };
        let _ = tx.send(outcome);
    }
}

async fn read_loop(shared: Arc<PeerShared>, handler: Arc<dyn MessageHandler>) {
    loop {
        match shared.transport.receive().await {
            Ok(Some(text)) => dispatch_text(&shared, &handler, &text).await,
            Ok(None) => {
                debug!(peer = %shared.label, "transport closed by remote");
                break;
            }
            Err(e) => {
                warn!(peer = %shared.label, error = %e, "transport receive failed");
                break;
            }
        }
    }
    shared.mark_closed().await;
}

async fn dispatch_text(shared: &Arc<PeerShared>, handler: &Arc<dyn MessageHandler>, text: &str) {
    let value: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(peer = %shared.label, error = %e, "discarding unparseable message");
            return;
        }
    };

    let items = match value {
        Value::Array(batch) => batch,
        single => vec![single],
    };
    for item in items {
        match IncomingMessage::from_value(item) {
            Ok(message) => dispatch(shared, handler, message).await,
            Err(e) => warn!(peer = %shared.label, error = %e, "discarding malformed message"),
        }
    }
}

async fn dispatch(shared: &Arc<PeerShared>, handler: &Arc<dyn MessageHandler>, message: IncomingMessage) {
    match message {
        IncomingMessage::Response(response) => shared.resolve(response).await,
        IncomingMessage::Notification(notification) => {
            handler
                .handle_notification(&notification.method, notification.params)
                .await;
        }
        IncomingMessage::Request(request) => {
            let shared = Arc::clone(shared);
            let handler = Arc::clone(handler);
            tokio::spawn(async move {
                let JsonRpcRequest { id, method, params, .. } = request;
                let outcome = if method == methods::PING {
                    Ok(empty_result())
                } else {
                    handler.handle_request(&method, params).await
                };
                let response = match outcome {
                    Ok(result) => JsonRpcResponse::success(id, result),
                    Err(error) => {
                        debug!(peer = %shared.label, method = %method, error = %error, "request failed");
                        JsonRpcResponse::failure(id, error)
                    }
                };
                shared.send_response(response).await;
            });
        }
    }
}
