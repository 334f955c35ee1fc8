//! Upstream -> downstream traffic: notifications and reverse requests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use toolmux_mcp::{
    methods, ClientCapabilities, JsonRpcError, LoggingMessageParams, McpError, McpServer,
    MessageHandler, ProgressParams, RequestMeta, ResourceUpdatedParams, ServerCapabilities,
};

use crate::codec::{decode_progress_token, encode_progress_token, encode_uri};

/// The hub's side of the downstream session, shared with every relay.
#[derive(Default)]
pub struct DownstreamLink {
    server: OnceLock<McpServer>,
    client_capabilities: OnceLock<ClientCapabilities>,
    ready: AtomicBool,
}

impl DownstreamLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false when a session was already attached.
    pub fn attach(&self, server: McpServer) -> bool {
        self.server.set(server).is_ok()
    }

    pub fn is_attached(&self) -> bool {
        self.server.get().is_some()
    }

    /// Close the downstream session if one was attached.
    pub async fn close(&self) {
        if let Some(server) = self.server.get() {
            if let Err(e) = server.close().await {
                tracing::warn!(error = %e, "closing downstream session failed");
            }
        }
    }

    /// The downstream session, while it is still open.
    pub fn server(&self) -> Option<&McpServer> {
        self.server.get().filter(|s| !s.peer().is_closed())
    }

    pub fn set_client_capabilities(&self, capabilities: ClientCapabilities) {
        if self.client_capabilities.set(capabilities).is_err() {
            tracing::debug!("client capabilities already recorded");
        }
    }

    pub fn client_capabilities(&self) -> Option<&ClientCapabilities> {
        self.client_capabilities.get()
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }
}

/// Message handler installed on one upstream client session.
///
/// Stays inert until [`UpstreamRelay::arm`] hands it the upstream's
/// capabilities; notifications arriving earlier are dropped.
pub struct UpstreamRelay {
    server: String,
    link: Arc<DownstreamLink>,
    capabilities: OnceLock<ServerCapabilities>,
}

impl UpstreamRelay {
    pub fn new(server: impl Into<String>, link: Arc<DownstreamLink>) -> Self {
        Self {
            server: server.into(),
            link,
            capabilities: OnceLock::new(),
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server
    }

    pub fn arm(&self, capabilities: ServerCapabilities) {
        if self.capabilities.set(capabilities).is_err() {
            tracing::debug!(server = %self.server, "relay already armed");
        }
    }

    fn downstream(&self) -> Option<&McpServer> {
        if self.link.is_ready() {
            self.link.server()
        } else {
            None
        }
    }

    async fn relay_notification(
        &self,
        downstream: &McpServer,
        caps: &ServerCapabilities,
        method: &str,
        params: Option<Value>,
    ) -> Result<(), McpError> {
        match method {
            methods::NOTIFY_TOOL_LIST_CHANGED
                if caps.tools.as_ref().is_some_and(|t| t.list_changed) =>
            {
                downstream.notify_tool_list_changed().await
            }
            methods::NOTIFY_PROMPT_LIST_CHANGED
                if caps.prompts.as_ref().is_some_and(|p| p.list_changed) =>
            {
                downstream.notify_prompt_list_changed().await
            }
            methods::NOTIFY_RESOURCE_LIST_CHANGED
                if caps.resources.as_ref().is_some_and(|r| r.list_changed) =>
            {
                downstream.notify_resource_list_changed().await
            }
            methods::NOTIFY_RESOURCE_UPDATED if caps.resources.is_some() => {
                let mut update: ResourceUpdatedParams = parse(params)?;
                update.uri = encode_uri(&self.server, &update.uri);
                downstream.notify_resource_updated(&update).await
            }
            methods::NOTIFY_PROGRESS => {
                let mut progress: ProgressParams = parse(params)?;
                let decoded = decode_progress_token(&progress.progress_token);
                if decoded.server.as_deref() != Some(self.server.as_str()) {
                    tracing::debug!(
                        server = %self.server,
                        token = ?progress.progress_token,
                        "unattributable progress, dropping"
                    );
                    return Ok(());
                }
                progress.progress_token = decoded.local;
                downstream.notify_progress(&progress).await
            }
            methods::NOTIFY_MESSAGE if caps.logging.is_some() => {
                let mut entry: LoggingMessageParams = parse(params)?;
                entry.logger = Some(match entry.logger.take() {
                    Some(logger) => format!("{}-{logger}", self.server),
                    None => self.server.clone(),
                });
                downstream.notify_log_message(&entry).await
            }
            other => {
                tracing::debug!(server = %self.server, method = %other, "not relayed");
                Ok(())
            }
        }
    }
}

#[async_trait]
impl MessageHandler for UpstreamRelay {
    async fn handle_request(&self, method: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let declared = self.link.client_capabilities();
        let allowed = match method {
            methods::SAMPLING_CREATE_MESSAGE => declared.is_some_and(|c| c.sampling.is_some()),
            methods::ROOTS_LIST => declared.is_some_and(|c| c.roots.is_some()),
            _ => false,
        };
        if !allowed {
            return Err(JsonRpcError::method_not_found(method));
        }

        let Some(downstream) = self.link.server() else {
            tracing::debug!(server = %self.server, method = %method, "downstream gone");
            return Err(JsonRpcError::connection_closed());
        };

        tracing::debug!(server = %self.server, method = %method, "forwarding request downstream");
        let params = params.map(|p| encode_request_meta(&self.server, p));
        let result = if method == methods::ROOTS_LIST {
            downstream.list_roots(params).await
        } else {
            downstream.create_message(params).await
        };
        result.map_err(|e| {
            tracing::warn!(server = %self.server, method = %method, error = %e, "downstream request failed");
            e.to_rpc_error()
        })
    }

    async fn handle_notification(&self, method: &str, params: Option<Value>) {
        let Some(caps) = self.capabilities.get() else {
            tracing::debug!(server = %self.server, method = %method, "relay not armed, dropping");
            return;
        };
        let Some(downstream) = self.downstream() else {
            tracing::debug!(server = %self.server, method = %method, "downstream not ready, dropping");
            return;
        };

        if let Err(e) = self.relay_notification(downstream, caps, method, params).await {
            tracing::warn!(server = %self.server, method = %method, error = %e, "relaying notification failed");
        }
    }
}

fn parse<T: DeserializeOwned>(params: Option<Value>) -> Result<T, McpError> {
    serde_json::from_value(params.unwrap_or(Value::Null))
        .map_err(|e| McpError::InvalidParams(e.to_string()))
}

/// Namespace `_meta.progressToken` inside raw request params.
fn encode_request_meta(server: &str, mut params: Value) -> Value {
    let Some(object) = params.as_object_mut() else {
        return params;
    };
    let Some(meta) = object.get_mut("_meta") else {
        return params;
    };

    match serde_json::from_value::<RequestMeta>(meta.clone()) {
        Ok(mut parsed) => {
            if let Some(token) = parsed.progress_token.take() {
                parsed.progress_token = Some(encode_progress_token(server, &token));
                if let Ok(encoded) = serde_json::to_value(parsed) {
                    *meta = encoded;
                }
            }
        }
        Err(e) => tracing::debug!(server = %server, error = %e, "unreadable _meta left as is"),
    }
    params
}
