//! MCP client implementation.
//!
//! Performs the client half of the handshake over any [`McpTransport`] and
//! exposes typed calls for the methods a proxy forwards. Requests the
//! server initiates (sampling, roots) and its notifications go to the
//! [`MessageHandler`] supplied at connect time.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::McpError;
use crate::messages::*;
use crate::peer::{MessageHandler, Peer, PeerOptions};
use crate::transport::McpTransport;
use crate::types::*;

/// A connected, initialized MCP client session.
pub struct McpClient {
    peer: Peer,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
    protocol_version: String,
}

impl McpClient {
    /// Start a session on `transport` and run the initialize handshake.
    ///
    /// Fails if the server errors, answers with a protocol version we don't
    /// speak, or the session ends first. The transport is closed on failure.
    pub async fn connect(
        label: &str,
        transport: Arc<dyn McpTransport>,
        handler: Arc<dyn MessageHandler>,
        client_info: Implementation,
        capabilities: ClientCapabilities,
        options: PeerOptions,
    ) -> Result<Self, McpError> {
        let peer = Peer::start(label, transport, handler, options);

        match Self::initialize(&peer, client_info, capabilities).await {
            Ok(result) => {
                tracing::info!(
                    peer = %label,
                    server = %result.server_info.name,
                    version = %result.server_info.version,
                    protocol = %result.protocol_version,
                    "MCP client initialized"
                );
                Ok(Self {
                    peer,
                    server_info: result.server_info,
                    capabilities: result.capabilities,
                    instructions: result.instructions,
                    protocol_version: result.protocol_version,
                })
            }
            Err(e) => {
                if let Err(close_err) = peer.close().await {
                    tracing::debug!(peer = %label, error = %close_err, "close after failed handshake");
                }
                Err(e)
            }
        }
    }

    async fn initialize(
        peer: &Peer,
        client_info: Implementation,
        capabilities: ClientCapabilities,
    ) -> Result<InitializeResult, McpError> {
        let params = InitializeParams {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities,
            client_info,
        };
        let raw = peer
            .request(methods::INITIALIZE, Some(serde_json::to_value(&params)?))
            .await?;
        let result: InitializeResult = serde_json::from_value(raw)?;

        if !SUPPORTED_PROTOCOL_VERSIONS.contains(&result.protocol_version.as_str()) {
            return Err(McpError::UnsupportedVersion(result.protocol_version));
        }

        peer.notify(methods::NOTIFY_INITIALIZED, None).await?;
        Ok(result)
    }

    pub fn server_info(&self) -> &Implementation {
        &self.server_info
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        &self.capabilities
    }

    pub fn instructions(&self) -> Option<&str> {
        self.instructions.as_deref()
    }

    pub fn protocol_version(&self) -> &str {
        &self.protocol_version
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    async fn call<P, R>(&self, method: &str, params: &P) -> Result<R, McpError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let raw = self
            .peer
            .request(method, Some(serde_json::to_value(params)?))
            .await?;
        Ok(serde_json::from_value(raw)?)
    }

    fn page(cursor: Option<String>) -> PaginatedParams {
        PaginatedParams { cursor, meta: None }
    }

    pub async fn ping(&self) -> Result<(), McpError> {
        self.peer.request(methods::PING, None).await?;
        Ok(())
    }

    pub async fn list_tools(&self, cursor: Option<String>) -> Result<ListToolsResult, McpError> {
        self.call(methods::TOOLS_LIST, &Self::page(cursor)).await
    }

    pub async fn list_prompts(&self, cursor: Option<String>) -> Result<ListPromptsResult, McpError> {
        self.call(methods::PROMPTS_LIST, &Self::page(cursor)).await
    }

    pub async fn list_resources(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourcesResult, McpError> {
        self.call(methods::RESOURCES_LIST, &Self::page(cursor)).await
    }

    pub async fn list_resource_templates(
        &self,
        cursor: Option<String>,
    ) -> Result<ListResourceTemplatesResult, McpError> {
        self.call(methods::RESOURCE_TEMPLATES_LIST, &Self::page(cursor))
            .await
    }

    /// Invoke a tool. The result is returned untouched.
    pub async fn call_tool(&self, params: &CallToolParams) -> Result<Value, McpError> {
        self.call(methods::TOOLS_CALL, params).await
    }

    pub async fn get_prompt(&self, params: &GetPromptParams) -> Result<Value, McpError> {
        self.call(methods::PROMPTS_GET, params).await
    }

    pub async fn read_resource(&self, params: &ResourceParams) -> Result<ReadResourceResult, McpError> {
        self.call(methods::RESOURCES_READ, params).await
    }

    pub async fn subscribe_resource(&self, params: &ResourceParams) -> Result<Value, McpError> {
        self.call(methods::RESOURCES_SUBSCRIBE, params).await
    }

    pub async fn unsubscribe_resource(&self, params: &ResourceParams) -> Result<Value, McpError> {
        self.call(methods::RESOURCES_UNSUBSCRIBE, params).await
    }

    pub async fn complete(&self, params: &CompleteParams) -> Result<Value, McpError> {
        self.call(methods::COMPLETION_COMPLETE, params).await
    }

    pub async fn set_logging_level(&self, level: LoggingLevel) -> Result<(), McpError> {
        self.peer
            .request(
                methods::LOGGING_SET_LEVEL,
                Some(serde_json::to_value(SetLevelParams { level })?),
            )
            .await?;
        Ok(())
    }

    pub async fn notify_progress(&self, params: &ProgressParams) -> Result<(), McpError> {
        self.peer
            .notify(methods::NOTIFY_PROGRESS, Some(serde_json::to_value(params)?))
            .await
    }

    pub async fn notify_roots_list_changed(&self) -> Result<(), McpError> {
        self.peer
            .notify(methods::NOTIFY_ROOTS_LIST_CHANGED, None)
            .await
    }

    /// End the session and release the transport. Idempotent.
    pub async fn close(&self) -> Result<(), McpError> {
        self.peer.close().await
    }

    /// Resolves once the session has ended.
    pub async fn closed(&self) {
        self.peer.closed().await
    }
}
