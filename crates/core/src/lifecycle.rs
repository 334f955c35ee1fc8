//! Hub lifecycle: deferred upstream connection, readiness, teardown.
//!
//! The downstream session is served from the start, but upstreams are only
//! contacted once the downstream `initialize` arrives (their handshakes
//! mirror the downstream client's capabilities). Anything routed before
//! the hub is ready waits in a [`PendingInitQueue`] and is replayed once,
//! in arrival order.
//!
//! ```text
//! Uninitialized ──initialize──> Connecting ──all attempts settled──> Ready
//!       │                           │                                  │
//!       └───────────────────────────┴──────────close──────────────────┴──> Closed
//! ```

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use toolmux_mcp::{
    initialize_result, methods, ClientCapabilities, Implementation, InitializeParams,
    InitializeResult, JsonRpcError, McpServer, McpTransport, MessageHandler, PeerOptions,
    ProgressParams,
};

use crate::capabilities::aggregate;
use crate::config::HubConfig;
use crate::connection::{CloseRegistry, Connection, ConnectionSet};
use crate::connector::{ConnectContext, Connector, TransportConnector};
use crate::error::HubError;
use crate::relay::{DownstreamLink, UpstreamRelay};
use crate::router::Router;

/// Name the hub reports as server to the downstream and as client upstream.
pub const HUB_NAME: &str = "toolmux";

/// Work deferred until the hub is ready.
pub type PendingInitHook<T> = Box<dyn FnOnce(T) -> BoxFuture<'static, ()> + Send>;

/// FIFO of [`PendingInitHook`]s. Draining consumes the queue, so each hook
/// runs at most once; dropping the queue drops the hooks unrun.
pub struct PendingInitQueue<T> {
    hooks: Vec<PendingInitHook<T>>,
}

impl<T> Default for PendingInitQueue<T> {
    fn default() -> Self {
        Self { hooks: Vec::new() }
    }
}

impl<T: Clone + Send + 'static> PendingInitQueue<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, hook: PendingInitHook<T>) {
        self.hooks.push(hook);
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook sequentially, in insertion order.
    pub async fn drain(self, value: T) {
        for hook in self.hooks {
            hook(value.clone()).await;
        }
    }
}

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    Uninitialized,
    Connecting,
    Ready,
    Closed,
}

type Forward = (Arc<Router>, PendingInitHook<Arc<Router>>);

enum Phase {
    Uninitialized(PendingInitQueue<Arc<Router>>),
    Connecting(PendingInitQueue<Arc<Router>>),
    Ready(Arc<Router>),
    Closed,
}

struct HubInner {
    config: HubConfig,
    connector: Arc<dyn Connector>,
    phase: Mutex<Phase>,
    link: Arc<DownstreamLink>,
    closers: Arc<CloseRegistry>,
    closed: watch::Sender<bool>,
    forwards: mpsc::UnboundedSender<Forward>,
    forward_rx: Mutex<Option<mpsc::UnboundedReceiver<Forward>>>,
    info: Implementation,
}

impl HubInner {
    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> HubState {
        match &*self.phase() {
            Phase::Uninitialized(_) => HubState::Uninitialized,
            Phase::Connecting(_) => HubState::Connecting,
            Phase::Ready(_) => HubState::Ready,
            Phase::Closed => HubState::Closed,
        }
    }

    /// Queue `hook` unless the hub is ready, in which case it is handed
    /// back with the router to run.
    fn defer(&self, what: &str, hook: PendingInitHook<Arc<Router>>) -> Option<Forward> {
        let mut phase = self.phase();
        match &mut *phase {
            Phase::Ready(router) => Some((Arc::clone(router), hook)),
            Phase::Uninitialized(pending) | Phase::Connecting(pending) => {
                tracing::debug!(what, queued = pending.len() + 1, "hub not ready, deferring");
                pending.push(hook);
                None
            }
            Phase::Closed => {
                tracing::debug!(what, "hub closed, dropping");
                None
            }
        }
    }

    /// Run `op` against the router now if ready, otherwise once readiness
    /// is reached. Dropped silently after close.
    async fn on_ready<F, Fut>(&self, what: &str, op: F)
    where
        F: FnOnce(Arc<Router>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: PendingInitHook<Arc<Router>> = Box::new(move |router| op(router).boxed());
        if let Some((router, hook)) = self.defer(what, hook) {
            hook(router).await;
        }
    }

    /// Like [`HubInner::on_ready`], but once ready `op` runs on the
    /// forwarding task, in submission order, so the downstream reader never
    /// waits on an upstream.
    fn forward<F, Fut>(&self, what: &str, op: F)
    where
        F: FnOnce(Arc<Router>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let hook: PendingInitHook<Arc<Router>> = Box::new(move |router| op(router).boxed());
        if let Some(ready) = self.defer(what, hook) {
            if self.forwards.send(ready).is_err() {
                tracing::debug!(what, "forwarding task gone, dropping");
            }
        }
    }

    /// Take the forwarding queue and run it until the hub goes away.
    fn spawn_forwarder(&self) {
        let rx = self
            .forward_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut rx) = rx else {
            return;
        };
        tokio::spawn(async move {
            while let Some((router, hook)) = rx.recv().await {
                hook(router).await;
            }
        });
    }

    /// Like [`HubInner::on_ready`], but hands back the result. A hook that
    /// never runs resolves to `ConnectionClosed`.
    async fn when_ready<F, Fut>(&self, what: &str, op: F) -> Result<Value, HubError>
    where
        F: FnOnce(Arc<Router>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Value, HubError>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.on_ready(what, move |router| async move {
            let _ = tx.send(op(router).await);
        })
        .await;
        rx.await.unwrap_or(Err(HubError::ConnectionClosed))
    }

    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult, HubError> {
        {
            let mut phase = self.phase();
            match &mut *phase {
                Phase::Uninitialized(pending) => {
                    let pending = std::mem::take(pending);
                    *phase = Phase::Connecting(pending);
                }
                Phase::Closed => return Err(HubError::ConnectionClosed),
                Phase::Connecting(_) | Phase::Ready(_) => {
                    return Err(HubError::InvalidRequest(
                        "initialize was already received".to_string(),
                    ))
                }
            }
        }

        tracing::info!(
            client = %params.client_info.name,
            protocol = %params.protocol_version,
            upstreams = self.config.mcp_servers.len(),
            "downstream initializing, connecting upstreams"
        );
        self.link.set_client_capabilities(params.capabilities.clone());
        let connections = self.connect_all(&params.capabilities).await;

        let (capabilities, instructions) = aggregate(&connections);
        let router = Arc::new(Router::new(connections));

        let pending = {
            let mut phase = self.phase();
            match &mut *phase {
                Phase::Connecting(pending) => {
                    let pending = std::mem::take(pending);
                    *phase = Phase::Ready(Arc::clone(&router));
                    pending
                }
                _ => {
                    tracing::info!("hub closed while connecting");
                    return Err(HubError::ConnectionClosed);
                }
            }
        };
        self.link.mark_ready();

        tracing::info!(
            connected = router.connections().len(),
            configured = self.config.mcp_servers.len(),
            "hub ready"
        );
        if !pending.is_empty() {
            tracing::debug!(count = pending.len(), "replaying deferred requests");
            tokio::spawn(pending.drain(router));
        }

        Ok(initialize_result(
            &params,
            self.info.clone(),
            capabilities,
            Some(instructions),
        ))
    }

    /// Attempt every descriptor concurrently. Failures are logged and the
    /// descriptor is left out.
    async fn connect_all(&self, client_capabilities: &ClientCapabilities) -> ConnectionSet {
        let attempts = self.config.mcp_servers.iter().map(|descriptor| {
            let relay = Arc::new(UpstreamRelay::new(
                descriptor.name.clone(),
                Arc::clone(&self.link),
            ));
            let ctx = ConnectContext {
                handler: relay.clone(),
                client_capabilities: client_capabilities.clone(),
                client_info: self.info.clone(),
                peer_options: PeerOptions {
                    request_timeout: Some(self.config.timeouts.request()),
                },
                connect_timeout: self.config.timeouts.connect(),
                closers: Arc::clone(&self.closers),
            };
            async move {
                tracing::info!(server = %descriptor.name, "connecting to upstream");
                let result = self.connector.connect(descriptor, &ctx).await;
                (descriptor, relay, result)
            }
        });

        let mut connections = ConnectionSet::new();
        for (descriptor, relay, result) in join_all(attempts).await {
            match result {
                Ok(client) => {
                    tracing::info!(
                        server = %descriptor.name,
                        upstream = %client.server_info().name,
                        protocol = %client.protocol_version(),
                        "upstream connected"
                    );
                    relay.arm(client.capabilities().clone());
                    connections.insert(
                        descriptor.name.clone(),
                        Arc::new(Connection::new(descriptor.name.clone(), client)),
                    );
                }
                Err(e) => tracing::warn!(
                    server = %descriptor.name,
                    error = %e,
                    "upstream unavailable, continuing without it"
                ),
            }
        }
        connections
    }

    /// Close the downstream session, then every upstream resource.
    async fn close(&self) {
        let previous = std::mem::replace(&mut *self.phase(), Phase::Closed);
        if matches!(previous, Phase::Closed) {
            return;
        }
        // unrun hooks go with the old phase; their waiters see ConnectionClosed
        drop(previous);

        tracing::info!("shutting down");
        self.link.close().await;
        let failures = self.closers.close_all().await;
        if failures > 0 {
            tracing::warn!(failures, "some upstream resources failed to close");
        }
        self.closed.send_replace(true);
        tracing::info!("hub closed");
    }
}

/// A proxy that serves one downstream session and fans it out to every
/// configured upstream server.
#[derive(Clone)]
pub struct Aggregator {
    inner: Arc<HubInner>,
}

impl Aggregator {
    /// Hub that reaches upstreams over their configured transports.
    pub fn new(config: HubConfig) -> Result<Self, HubError> {
        Self::with_connector(config, Arc::new(TransportConnector))
    }

    pub fn with_connector(config: HubConfig, connector: Arc<dyn Connector>) -> Result<Self, HubError> {
        config.validate()?;
        let (closed, _) = watch::channel(false);
        let (forwards, forward_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(HubInner {
                config,
                connector,
                phase: Mutex::new(Phase::Uninitialized(PendingInitQueue::new())),
                link: Arc::new(DownstreamLink::new()),
                closers: Arc::new(CloseRegistry::new()),
                closed,
                forwards,
                forward_rx: Mutex::new(Some(forward_rx)),
                info: Implementation::new(HUB_NAME, env!("CARGO_PKG_VERSION")),
            }),
        })
    }

    /// Start answering the downstream client on `transport`. The hub closes
    /// itself when that session ends.
    pub fn serve(&self, transport: Arc<dyn McpTransport>) -> Result<(), HubError> {
        if self.state() == HubState::Closed {
            return Err(HubError::ConnectionClosed);
        }
        if self.inner.link.is_attached() {
            return Err(HubError::InvalidRequest(
                "already serving a downstream session".to_string(),
            ));
        }

        let handler = Arc::new(HubHandler {
            inner: Arc::clone(&self.inner),
        });
        // downstream requests (sampling) wait on a human, so no timeout
        let server = McpServer::serve(
            "downstream",
            transport,
            handler,
            PeerOptions {
                request_timeout: None,
            },
        );
        if !self.inner.link.attach(server.clone()) {
            tokio::spawn(async move {
                let _ = server.close().await;
            });
            return Err(HubError::InvalidRequest(
                "already serving a downstream session".to_string(),
            ));
        }

        self.inner.spawn_forwarder();
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            server.closed().await;
            tracing::info!("downstream session ended");
            inner.close().await;
        });
        Ok(())
    }

    pub fn state(&self) -> HubState {
        self.inner.state()
    }

    /// The live router, once ready.
    pub fn router(&self) -> Option<Arc<Router>> {
        match &*self.inner.phase() {
            Phase::Ready(router) => Some(Arc::clone(router)),
            _ => None,
        }
    }

    /// Tear everything down. Safe to call repeatedly and from any state.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    /// Resolves once [`Aggregator::close`] has finished, whoever triggered it.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// Downstream-facing handler.
struct HubHandler {
    inner: Arc<HubInner>,
}

impl HubHandler {
    async fn initialize(&self, params: Option<Value>) -> Result<Value, HubError> {
        let params: InitializeParams = serde_json::from_value(params.unwrap_or(Value::Null))
            .map_err(|e| HubError::InvalidParams(format!("Invalid params: {e}")))?;
        let result = self.inner.initialize(params).await?;
        serde_json::to_value(result).map_err(|e| HubError::Internal(e.to_string()))
    }
}

#[async_trait]
impl MessageHandler for HubHandler {
    async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let result = if method == methods::INITIALIZE {
            self.initialize(params).await
        } else if Router::routes(method) {
            let routed = method.to_string();
            self.inner
                .when_ready(method, move |router| async move {
                    router.dispatch(&routed, params).await
                })
                .await
        } else {
            Err(HubError::MethodNotFound(method.to_string()))
        };

        result.map_err(|e| {
            tracing::debug!(method = %method, error = %e, "request failed");
            e.to_rpc_error()
        })
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        match method {
            methods::NOTIFY_INITIALIZED => tracing::info!("downstream client initialized"),
            methods::NOTIFY_PROGRESS => {
                match serde_json::from_value::<ProgressParams>(params.unwrap_or(Value::Null)) {
                    Ok(progress) => self.inner.forward(method, move |router| async move {
                        router.forward_progress(progress).await
                    }),
                    Err(e) => tracing::debug!(error = %e, "malformed progress notification"),
                }
            }
            methods::NOTIFY_ROOTS_LIST_CHANGED => self
                .inner
                .forward(method, |router| async move { router.roots_list_changed().await }),
            methods::NOTIFY_CANCELLED => {
                tracing::debug!("downstream cancellation is not propagated upstream")
            }
            other => tracing::debug!(method = %other, "ignoring notification"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn recorder(log: &Arc<Mutex<Vec<(usize, u32)>>>, n: usize) -> PendingInitHook<u32> {
        let log = Arc::clone(log);
        Box::new(move |value| {
            async move {
                tokio::task::yield_now().await;
                log.lock().unwrap().push((n, value));
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_queue_drains_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut queue = PendingInitQueue::new();
        for n in 0..4 {
            queue.push(recorder(&log, n));
        }
        assert_eq!(queue.len(), 4);

        queue.drain(7).await;
        assert_eq!(*log.lock().unwrap(), vec![(0, 7), (1, 7), (2, 7), (3, 7)]);
    }

    #[tokio::test]
    async fn test_dropped_queue_never_runs_hooks() {
        let runs = Arc::new(AtomicUsize::new(0));
        let mut queue: PendingInitQueue<()> = PendingInitQueue::new();
        let counter = Arc::clone(&runs);
        queue.push(Box::new(move |()| {
            counter.fetch_add(1, Ordering::SeqCst);
            async {}.boxed()
        }));
        drop(queue);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_from_uninitialized() {
        let hub = Aggregator::new(HubConfig::default()).unwrap();
        assert_eq!(hub.state(), HubState::Uninitialized);

        let inner = Arc::clone(&hub.inner);
        let waiting = tokio::spawn(async move {
            inner
                .when_ready("tools/list", |router| async move {
                    router.dispatch(methods::TOOLS_LIST, None).await
                })
                .await
        });
        tokio::task::yield_now().await;

        hub.close().await;
        hub.close().await;
        hub.closed().await;
        assert_eq!(hub.state(), HubState::Closed);
        assert!(matches!(waiting.await.unwrap(), Err(HubError::ConnectionClosed)));
        assert!(hub.router().is_none());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = HubConfig::new(vec![crate::config::UpstreamDescriptor::command(
            "bad-name", "x", vec![],
        )]);
        assert!(matches!(Aggregator::new(config), Err(HubError::Config(_))));
    }
}
