//! Error types for the MCP crate.

use std::time::Duration;

use crate::types::{error_codes, JsonRpcError};

/// Errors that can occur during MCP operations.
#[derive(Debug, thiserror::Error)]
pub enum McpError {
    /// Failed to parse JSON.
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// Transport I/O error.
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// HTTP client error (connect, TLS, body streaming).
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The remote HTTP endpoint answered with a non-success status.
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// The requested method is not supported.
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Invalid parameters for a method.
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// The remote peer answered a request with a JSON-RPC error.
    #[error("Remote error: {0}")]
    Rpc(JsonRpcError),

    /// Protocol version mismatch.
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(String),

    /// The peer or its transport has been closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No response arrived within the request timeout.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The MCP server process exited or is unavailable.
    #[error("Server unavailable: {0}")]
    ServerUnavailable(String),
}

impl McpError {
    /// Convert to a JSON-RPC error object.
    ///
    /// Errors reported by a remote peer are passed through unchanged.
    pub fn to_rpc_error(&self) -> JsonRpcError {
        let code = match self {
            McpError::Rpc(err) => return err.clone(),
            McpError::JsonParse(_) => error_codes::PARSE_ERROR,
            McpError::MethodNotFound(_) => error_codes::METHOD_NOT_FOUND,
            McpError::InvalidParams(_) => error_codes::INVALID_PARAMS,
            McpError::ConnectionClosed => error_codes::CONNECTION_CLOSED,
            McpError::Timeout(_) => error_codes::REQUEST_TIMEOUT,
            _ => error_codes::INTERNAL_ERROR,
        };
        JsonRpcError::new(code, self.to_string())
    }
}
