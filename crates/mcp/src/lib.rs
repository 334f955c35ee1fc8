//! Model Context Protocol (MCP) plumbing for toolmux.
//!
//! Implements MCP over JSON-RPC 2.0: wire types, transports, and the
//! client and server session roles that the proxy core builds on.
//!
//! # Architecture
//!
//! - **types**: JSON-RPC 2.0 envelopes, error codes, handshake types
//! - **messages**: method names and per-method params/results
//! - **transport**: pluggable transports (stdio, channels, subprocess,
//!   streamable HTTP, legacy SSE)
//! - **peer**: request/response correlation and inbound dispatch
//! - **client** / **server**: the two session roles
//! - **error**: unified error type
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use toolmux_mcp::{ClientCapabilities, Implementation, McpClient, NoopHandler, PeerOptions};
//! use toolmux_mcp::transport::ChildProcessTransport;
//!
//! # async fn example() -> Result<(), toolmux_mcp::McpError> {
//! let transport = ChildProcessTransport::spawn("my-mcp-server", &[], &Default::default())?;
//! let client = McpClient::connect(
//!     "my-server",
//!     Arc::new(transport),
//!     Arc::new(NoopHandler),
//!     Implementation::new("example", "0.1.0"),
//!     ClientCapabilities::default(),
//!     PeerOptions::default(),
//! )
//! .await?;
//! let tools = client.list_tools(None).await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod messages;
pub mod peer;
pub mod server;
pub mod transport;
pub mod types;

pub use client::McpClient;
pub use error::McpError;
pub use messages::*;
pub use peer::{MessageHandler, NoopHandler, Peer, PeerOptions};
pub use server::{initialize_result, McpServer};
pub use transport::{ChannelTransport, McpTransport, StdioTransport};
pub use types::*;
