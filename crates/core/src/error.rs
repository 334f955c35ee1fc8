use thiserror::Error;
use toolmux_mcp::{JsonRpcError, McpError};

use crate::config::ConfigError;

#[derive(Error, Debug)]
pub enum HubError {
    #[error("failed to connect to upstream {server:?}: {source}")]
    ConnectionSetup {
        server: String,
        #[source]
        source: McpError,
    },

    #[error("{0}")]
    InvalidParams(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("{0}")]
    Internal(String),

    #[error("Connection closed")]
    ConnectionClosed,

    /// A single-target request to an upstream failed.
    #[error("upstream {server:?} failed: {source}")]
    Upstream {
        server: String,
        #[source]
        source: McpError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl HubError {
    pub fn upstream(server: &str, source: McpError) -> Self {
        Self::Upstream {
            server: server.to_string(),
            source,
        }
    }

    /// Convert to the JSON-RPC error sent downstream.
    ///
    /// Upstream JSON-RPC errors are propagated as-is.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        match self {
            HubError::InvalidParams(msg) => JsonRpcError::invalid_params(msg.clone()),
            HubError::InvalidRequest(msg) => JsonRpcError::invalid_request(msg.clone()),
            HubError::MethodNotFound(method) => JsonRpcError::method_not_found(method),
            HubError::ConnectionClosed => JsonRpcError::connection_closed(),
            HubError::Upstream { source, .. } => source.to_rpc_error(),
            HubError::Internal(_) | HubError::ConnectionSetup { .. } | HubError::Config(_) => {
                JsonRpcError::internal(self.to_string())
            }
        }
    }
}
