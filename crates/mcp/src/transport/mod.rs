//! MCP transport layer.
//!
//! Defines the `McpTransport` trait for sending/receiving JSON-RPC messages
//! and the transports built on it:
//!
//! - [`StdioTransport`]: this process's own stdin/stdout (server side)
//! - [`ChannelTransport`]: in-memory pair, for tests and embedding
//! - [`ChildProcessTransport`]: a spawned server subprocess
//! - [`StreamableHttpTransport`]: MCP streamable HTTP
//! - [`SseTransport`]: the legacy HTTP+SSE transport
//!
//! All methods take `&self` so one task can block in `receive` while others
//! `send`; implementations guard their read and write halves separately.

mod child;
mod event_stream;
mod sse;
mod streamable_http;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, Mutex};

use crate::error::McpError;

pub use child::{default_environment, ChildProcessTransport};
pub use event_stream::{EventStreamDecoder, ServerSentEvent};
pub use sse::SseTransport;
pub use streamable_http::StreamableHttpTransport;

/// Trait for MCP message transport.
///
/// Implementations handle the wire format (newline-delimited JSON, HTTP
/// bodies, event streams) over different channels.
#[async_trait]
pub trait McpTransport: Send + Sync {
    /// Read the next JSON-RPC message from the transport.
    /// Returns `None` when the transport is closed.
    async fn receive(&self) -> Result<Option<String>, McpError>;

    /// Write one JSON-RPC message to the transport.
    async fn send(&self, message: &str) -> Result<(), McpError>;

    /// Release the underlying resource. Must be safe to call more than once.
    async fn close(&self) -> Result<(), McpError>;
}

/// Read one newline-delimited message, skipping blank lines.
pub(crate) async fn read_line_message<R>(reader: &mut R) -> Result<Option<String>, McpError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Ok(None); // EOF
        }
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            return Ok(Some(trimmed.to_string()));
        }
    }
}

/// Write one message followed by a newline and flush.
pub(crate) async fn write_line_message<W>(writer: &mut W, message: &str) -> Result<(), McpError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(message.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Stdio-based transport using newline-delimited JSON.
///
/// Reads from stdin, writes to stdout. Each message is a single JSON
/// object terminated by a newline character.
pub struct StdioTransport {
    reader: Mutex<BufReader<tokio::io::Stdin>>,
    writer: Mutex<tokio::io::Stdout>,
}

impl StdioTransport {
    /// Create a new stdio transport.
    pub fn new() -> Self {
        Self {
            reader: Mutex::new(BufReader::new(tokio::io::stdin())),
            writer: Mutex::new(tokio::io::stdout()),
        }
    }
}

impl Default for StdioTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn receive(&self) -> Result<Option<String>, McpError> {
        let mut reader = self.reader.lock().await;
        read_line_message(&mut *reader).await
    }

    async fn send(&self, message: &str) -> Result<(), McpError> {
        let mut writer = self.writer.lock().await;
        write_line_message(&mut *writer, message).await
    }

    async fn close(&self) -> Result<(), McpError> {
        let mut writer = self.writer.lock().await;
        writer.flush().await?;
        Ok(())
    }
}

/// In-memory transport backed by channel pairs.
pub struct ChannelTransport {
    rx: Mutex<mpsc::Receiver<String>>,
    tx: Mutex<Option<mpsc::Sender<String>>>,
}

impl ChannelTransport {
    /// Create a pair of connected transports.
    ///
    /// Messages sent on one transport are received by the other. Closing
    /// either side ends the other side's `receive` stream.
    pub fn pair() -> (Self, Self) {
        let (tx_a, rx_b) = mpsc::channel(32);
        let (tx_b, rx_a) = mpsc::channel(32);
        (
            Self {
                rx: Mutex::new(rx_a),
                tx: Mutex::new(Some(tx_a)),
            },
            Self {
                rx: Mutex::new(rx_b),
                tx: Mutex::new(Some(tx_b)),
            },
        )
    }
}

#[async_trait]
impl McpTransport for ChannelTransport {
    async fn receive(&self) -> Result<Option<String>, McpError> {
        Ok(self.rx.lock().await.recv().await)
    }

    async fn send(&self, message: &str) -> Result<(), McpError> {
        let tx = self
            .tx
            .lock()
            .await
            .clone()
            .ok_or(McpError::ConnectionClosed)?;
        tx.send(message.to_string())
            .await
            .map_err(|_| McpError::ConnectionClosed)
    }

    async fn close(&self) -> Result<(), McpError> {
        self.tx.lock().await.take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_pair() {
        let (a, b) = ChannelTransport::pair();

        a.send("hello from a").await.unwrap();
        let msg = b.receive().await.unwrap();
        assert_eq!(msg, Some("hello from a".to_string()));

        b.send("hello from b").await.unwrap();
        let msg = a.receive().await.unwrap();
        assert_eq!(msg, Some("hello from b".to_string()));
    }

    #[tokio::test]
    async fn test_channel_transport_closed() {
        let (a, b) = ChannelTransport::pair();
        b.close().await.unwrap();
        assert_eq!(a.receive().await.unwrap(), None);
        assert!(matches!(
            b.send("late").await,
            Err(McpError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_line_message_skips_blank_lines() {
        let input: &[u8] = b"\n  \n{\"a\":1}\n\n{\"b\":2}";
        let mut reader = BufReader::new(input);
        assert_eq!(
            read_line_message(&mut reader).await.unwrap().as_deref(),
            Some("{\"a\":1}")
        );
        assert_eq!(
            read_line_message(&mut reader).await.unwrap().as_deref(),
            Some("{\"b\":2}")
        );
        assert_eq!(read_line_message(&mut reader).await.unwrap(), None);
    }
}
