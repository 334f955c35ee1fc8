//! MCP server implementation.
//!
//! [`McpServer`] is the server role of a [`Peer`]: the [`MessageHandler`]
//! answers client requests (including `initialize`, which the handler owns
//! so it can defer its answer), while the server handle pushes
//! notifications and issues the requests a server may send to its client.

use std::sync::Arc;

use serde_json::Value;

use crate::error::McpError;
use crate::messages::*;
use crate::peer::{MessageHandler, Peer, PeerOptions};
use crate::transport::McpTransport;
use crate::types::*;

/// Build the answer to an `initialize` request, negotiating the version.
pub fn initialize_result(
    params: &InitializeParams,
    server_info: Implementation,
    capabilities: ServerCapabilities,
    instructions: Option<String>,
) -> InitializeResult {
    let protocol_version = negotiate_version(&params.protocol_version);
    if protocol_version != params.protocol_version {
        tracing::info!(
            requested = %params.protocol_version,
            answered = %protocol_version,
            "client requested unsupported protocol version"
        );
    }
    InitializeResult {
        protocol_version: protocol_version.to_string(),
        capabilities,
        server_info,
        instructions,
    }
}

/// Server side of one MCP session.
#[derive(Clone)]
pub struct McpServer {
    peer: Peer,
}

impl McpServer {
    /// Start serving `handler` on `transport`.
    pub fn serve(
        label: &str,
        transport: Arc<dyn McpTransport>,
        handler: Arc<dyn MessageHandler>,
        options: PeerOptions,
    ) -> Self {
        tracing::info!(server = %label, "MCP server starting");
        Self {
            peer: Peer::start(label, transport, handler, options),
        }
    }

    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), McpError> {
        self.peer.notify(method, params).await
    }

    pub async fn notify_tool_list_changed(&self) -> Result<(), McpError> {
        self.notify(methods::NOTIFY_TOOL_LIST_CHANGED, None).await
    }

    pub async fn notify_prompt_list_changed(&self) -> Result<(), McpError> {
        self.notify(methods::NOTIFY_PROMPT_LIST_CHANGED, None).await
    }

    pub async fn notify_resource_list_changed(&self) -> Result<(), McpError> {
        self.notify(methods::NOTIFY_RESOURCE_LIST_CHANGED, None).await
    }

    pub async fn notify_resource_updated(&self, params: &ResourceUpdatedParams) -> Result<(), McpError> {
        self.notify(
            methods::NOTIFY_RESOURCE_UPDATED,
            Some(serde_json::to_value(params)?),
        )
        .await
    }

    pub async fn notify_progress(&self, params: &ProgressParams) -> Result<(), McpError> {
        self.notify(methods::NOTIFY_PROGRESS, Some(serde_json::to_value(params)?))
            .await
    }

    pub async fn notify_log_message(&self, params: &LoggingMessageParams) -> Result<(), McpError> {
        self.notify(methods::NOTIFY_MESSAGE, Some(serde_json::to_value(params)?))
            .await
    }

    /// Ask the client to sample from its model. Params and result are
    /// passed through as-is.
    pub async fn create_message(&self, params: Option<Value>) -> Result<Value, McpError> {
        self.peer
            .request(methods::SAMPLING_CREATE_MESSAGE, params)
            .await
    }

    /// Ask the client for its filesystem roots.
    pub async fn list_roots(&self, params: Option<Value>) -> Result<Value, McpError> {
        self.peer.request(methods::ROOTS_LIST, params).await
    }

    pub async fn close(&self) -> Result<(), McpError> {
        self.peer.close().await
    }

    /// Resolves once the client has gone away or the session was closed.
    pub async fn closed(&self) {
        self.peer.closed().await
    }
}
