//! In-process upstream servers and a downstream client for hub tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use toolmux_core::{
    Aggregator, ConnectContext, Connector, HubConfig, HubError, UpstreamDescriptor,
};
use toolmux_mcp::{
    initialize_result, methods, ChannelTransport, ClientCapabilities, Implementation,
    InitializeParams, JsonRpcError, LoggingCapability, McpClient, McpError, McpServer,
    McpTransport, MessageHandler, PeerOptions, PromptsCapability, ResourcesCapability,
    ServerCapabilities, ToolsCapability,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Scripted upstream server. Records every request and notification it
/// receives and echoes request params back in its results.
#[derive(Default)]
pub struct FakeUpstream {
    pub capabilities: ServerCapabilities,
    pub instructions: Option<String>,
    pub tools: Vec<String>,
    pub prompts: Vec<String>,
    pub resources: Vec<String>,
    pub fail_lists: bool,
    log: Mutex<Vec<(String, Option<Value>)>>,
}

impl FakeUpstream {
    /// Upstream with tools, prompts, resources and logging.
    pub fn full(tools: &[&str]) -> Self {
        Self {
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability { list_changed: true }),
                prompts: Some(PromptsCapability::default()),
                resources: Some(ResourcesCapability::default()),
                logging: Some(LoggingCapability {}),
                ..Default::default()
            },
            tools: tools.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn tools_only(tools: &[&str]) -> Self {
        Self {
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability::default()),
                ..Default::default()
            },
            tools: tools.iter().map(|t| t.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_prompts(mut self, prompts: &[&str]) -> Self {
        self.prompts = prompts.iter().map(|p| p.to_string()).collect();
        self
    }

    pub fn with_resources(mut self, uris: &[&str]) -> Self {
        self.resources = uris.iter().map(|u| u.to_string()).collect();
        self
    }

    pub fn with_instructions(mut self, instructions: &str) -> Self {
        self.instructions = Some(instructions.to_string());
        self
    }

    pub fn with_subscriptions(mut self) -> Self {
        self.capabilities.resources = Some(ResourcesCapability {
            subscribe: true,
            list_changed: true,
        });
        self
    }

    pub fn failing_lists(mut self) -> Self {
        self.fail_lists = true;
        self
    }

    pub fn received(&self) -> Vec<(String, Option<Value>)> {
        self.log.lock().unwrap().clone()
    }

    pub fn received_methods(&self) -> Vec<String> {
        self.received().into_iter().map(|(m, _)| m).collect()
    }

    /// Wait until `method` has been received and return its params.
    pub async fn wait_for(&self, method: &str) -> Option<Value> {
        let deadline = tokio::time::Instant::now() + TIMEOUT;
        loop {
            if let Some((_, params)) = self.received().into_iter().find(|(m, _)| m == method) {
                return params;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "upstream never received {method}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn record(&self, method: &str, params: &Option<Value>) {
        self.log
            .lock()
            .unwrap()
            .push((method.to_string(), params.clone()));
    }

    fn list(&self, key: &str, items: Vec<Value>) -> Result<Value, JsonRpcError> {
        if self.fail_lists {
            return Err(JsonRpcError::internal("listing is broken"));
        }
        Ok(json!({ key: items }))
    }
}

#[async_trait]
impl MessageHandler for FakeUpstream {
    async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        self.record(method, &params);
        match method {
            methods::INITIALIZE => {
                let params: InitializeParams = serde_json::from_value(params.unwrap_or_default())
                    .map_err(|e| JsonRpcError::invalid_params(e.to_string()))?;
                let result = initialize_result(
                    &params,
                    Implementation::new("fake-upstream", "0.1.0"),
                    self.capabilities.clone(),
                    self.instructions.clone(),
                );
                serde_json::to_value(result).map_err(|e| JsonRpcError::internal(e.to_string()))
            }
            methods::TOOLS_LIST => self.list(
                "tools",
                self.tools
                    .iter()
                    .map(|name| json!({"name": name, "inputSchema": {"type": "object"}}))
                    .collect(),
            ),
            methods::PROMPTS_LIST => self.list(
                "prompts",
                self.prompts.iter().map(|name| json!({"name": name})).collect(),
            ),
            methods::RESOURCES_LIST => self.list(
                "resources",
                self.resources
                    .iter()
                    .map(|uri| json!({"uri": uri, "name": uri}))
                    .collect(),
            ),
            methods::RESOURCE_TEMPLATES_LIST => self.list(
                "resourceTemplates",
                vec![json!({"uriTemplate": "mem://notes/{day}", "name": "notes"})],
            ),
            methods::RESOURCES_READ => {
                let uri = params
                    .as_ref()
                    .and_then(|p| p["uri"].as_str())
                    .unwrap_or_default()
                    .to_string();
                Ok(json!({"contents": [{"uri": uri, "text": "hello"}]}))
            }
            methods::TOOLS_CALL
            | methods::PROMPTS_GET
            | methods::COMPLETION_COMPLETE
            | methods::RESOURCES_SUBSCRIBE
            | methods::RESOURCES_UNSUBSCRIBE
            | methods::LOGGING_SET_LEVEL => Ok(json!({ "received": params })),
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        self.record(method, &params);
    }
}

/// The hub's end of an in-process upstream. Once stalled, writes never
/// complete, like an HTTP upstream that stops answering mid-POST.
pub struct StallableTransport {
    inner: ChannelTransport,
    stalled: Arc<AtomicBool>,
}

#[async_trait]
impl McpTransport for StallableTransport {
    async fn receive(&self) -> Result<Option<String>, McpError> {
        self.inner.receive().await
    }

    async fn send(&self, message: &str) -> Result<(), McpError> {
        if self.stalled.load(Ordering::SeqCst) {
            return std::future::pending().await;
        }
        self.inner.send(message).await
    }

    async fn close(&self) -> Result<(), McpError> {
        self.inner.close().await
    }
}

/// Connects descriptors to in-process [`FakeUpstream`]s by name. Names
/// without a fake fail to connect.
#[derive(Default)]
pub struct InProcessConnector {
    upstreams: HashMap<String, Arc<FakeUpstream>>,
    sessions: Mutex<HashMap<String, McpServer>>,
    stalls: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

impl InProcessConnector {
    pub fn with(mut self, name: &str, upstream: FakeUpstream) -> Self {
        self.upstreams.insert(name.to_string(), Arc::new(upstream));
        self
    }

    pub fn upstream(&self, name: &str) -> Arc<FakeUpstream> {
        Arc::clone(&self.upstreams[name])
    }

    /// The upstream's server-side session, for pushing notifications and
    /// reverse requests at the hub.
    pub fn session(&self, name: &str) -> McpServer {
        self.sessions.lock().unwrap()[name].clone()
    }

    /// From now on, nothing the hub sends to `name` gets through.
    pub fn stall(&self, name: &str) {
        self.stalls.lock().unwrap()[name].store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for InProcessConnector {
    async fn connect(
        &self,
        descriptor: &UpstreamDescriptor,
        ctx: &ConnectContext,
    ) -> Result<McpClient, HubError> {
        let setup_failed = |source: McpError| HubError::ConnectionSetup {
            server: descriptor.name.clone(),
            source,
        };
        let upstream = self
            .upstreams
            .get(&descriptor.name)
            .ok_or_else(|| setup_failed(McpError::ServerUnavailable("not running".into())))?;

        let (hub_side, upstream_side) = ChannelTransport::pair();
        let session = McpServer::serve(
            &descriptor.name,
            Arc::new(upstream_side),
            upstream.clone(),
            PeerOptions::default(),
        );
        self.sessions
            .lock()
            .unwrap()
            .insert(descriptor.name.clone(), session);
        let stalled = Arc::new(AtomicBool::new(false));
        self.stalls
            .lock()
            .unwrap()
            .insert(descriptor.name.clone(), Arc::clone(&stalled));

        let hub_side = StallableTransport {
            inner: hub_side,
            stalled,
        };
        ctx.handshake(&descriptor.name, Arc::new(hub_side))
            .await
            .map_err(setup_failed)
    }
}

/// Downstream handler that records notifications and answers sampling.
pub struct Downstream {
    pub seen: mpsc::UnboundedSender<(String, Option<Value>)>,
}

#[async_trait]
impl MessageHandler for Downstream {
    async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        match method {
            methods::SAMPLING_CREATE_MESSAGE => Ok(json!({
                "role": "assistant",
                "content": {"type": "text", "text": "sampled"},
                "echo": params,
            })),
            methods::ROOTS_LIST => Ok(json!({"roots": [{"uri": "file:///work"}]})),
            other => Err(JsonRpcError::method_not_found(other)),
        }
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        let _ = self.seen.send((method.to_string(), params));
    }
}

pub struct Harness {
    pub hub: Aggregator,
    pub client: McpClient,
    pub connector: Arc<InProcessConnector>,
    pub notifications: mpsc::UnboundedReceiver<(String, Option<Value>)>,
}

impl Harness {
    /// Hub over `names` (each a configured descriptor) with a connected,
    /// initialized downstream client.
    pub async fn start(names: &[&str], connector: InProcessConnector) -> Self {
        Self::start_with(names, connector, ClientCapabilities::default()).await
    }

    pub async fn start_with(
        names: &[&str],
        connector: InProcessConnector,
        capabilities: ClientCapabilities,
    ) -> Self {
        let connector = Arc::new(connector);
        let hub = Aggregator::with_connector(config(names), connector.clone()).unwrap();
        let (client_side, hub_side) = ChannelTransport::pair();
        hub.serve(Arc::new(hub_side)).unwrap();

        let (seen, notifications) = mpsc::unbounded_channel();
        let client = McpClient::connect(
            "hub",
            Arc::new(client_side),
            Arc::new(Downstream { seen }),
            Implementation::new("tests", "0.0.0"),
            capabilities,
            PeerOptions::default(),
        )
        .await
        .unwrap();

        Self {
            hub,
            client,
            connector,
            notifications,
        }
    }

    /// Next downstream notification with the given method.
    pub async fn next_notification(&mut self, method: &str) -> Option<Value> {
        loop {
            let (seen, params) = tokio::time::timeout(TIMEOUT, self.notifications.recv())
                .await
                .expect("timed out waiting for notification")
                .expect("notification channel closed");
            if seen == method {
                return params;
            }
        }
    }
}

pub fn config(names: &[&str]) -> HubConfig {
    HubConfig::new(
        names
            .iter()
            .map(|name| UpstreamDescriptor::command(*name, "unused", vec![]))
            .collect(),
    )
}

/// Code of a remote JSON-RPC error.
pub fn rpc_code(err: McpError) -> i64 {
    match err {
        McpError::Rpc(e) => e.code,
        other => panic!("expected a JSON-RPC error, got {other}"),
    }
}
