//! Opens upstream connections over the transport each descriptor names.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use toolmux_mcp::transport::{ChildProcessTransport, SseTransport, StreamableHttpTransport};
use toolmux_mcp::{
    ClientCapabilities, Implementation, McpClient, McpError, McpTransport, MessageHandler,
    PeerOptions,
};

use crate::config::{UpstreamDescriptor, UpstreamTarget};
use crate::connection::CloseRegistry;
use crate::error::HubError;

/// Everything an attempt needs besides the descriptor itself.
#[derive(Clone)]
pub struct ConnectContext {
    /// Receives the upstream's notifications and reverse requests.
    pub handler: Arc<dyn MessageHandler>,
    /// Mirrored from the downstream client.
    pub client_capabilities: ClientCapabilities,
    pub client_info: Implementation,
    pub peer_options: PeerOptions,
    pub connect_timeout: Duration,
    pub closers: Arc<CloseRegistry>,
}

impl ConnectContext {
    /// Register `transport` for teardown, then run the client handshake on
    /// it within the connect timeout. A failed attempt is closed right away.
    pub async fn handshake(
        &self,
        server: &str,
        transport: Arc<dyn McpTransport>,
    ) -> Result<McpClient, McpError> {
        let closing = Arc::clone(&transport);
        self.closers
            .register(format!("{server} transport"), move || async move {
                closing.close().await
            });

        let connect = McpClient::connect(
            server,
            Arc::clone(&transport),
            Arc::clone(&self.handler),
            self.client_info.clone(),
            self.client_capabilities.clone(),
            self.peer_options.clone(),
        );
        let outcome = tokio::time::timeout(self.connect_timeout, connect)
            .await
            .map_err(|_| McpError::Timeout(self.connect_timeout))
            .and_then(|result| result);
        let client = match outcome {
            Ok(client) => client,
            Err(e) => {
                if let Err(close_err) = transport.close().await {
                    tracing::debug!(server = %server, error = %close_err, "closing failed attempt");
                }
                return Err(e);
            }
        };

        let peer = client.peer().clone();
        self.closers
            .register(format!("{server} session"), move || async move {
                peer.close().await
            });
        Ok(client)
    }
}

/// Establishes one initialized client session per descriptor.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        descriptor: &UpstreamDescriptor,
        ctx: &ConnectContext,
    ) -> Result<McpClient, HubError>;
}

/// The production connector: subprocesses for `command` descriptors,
/// streamable HTTP with legacy SSE fallback for `url` descriptors.
#[derive(Debug, Default, Clone, Copy)]
pub struct TransportConnector;

impl TransportConnector {
    async fn connect_streamable_http(
        &self,
        server: &str,
        url: &str,
        headers: &std::collections::BTreeMap<String, String>,
        ctx: &ConnectContext,
    ) -> Result<McpClient, McpError> {
        let transport = StreamableHttpTransport::new(url, headers)?;
        ctx.handshake(server, Arc::new(transport)).await
    }

    async fn connect_sse(
        &self,
        server: &str,
        url: &str,
        headers: &std::collections::BTreeMap<String, String>,
        ctx: &ConnectContext,
    ) -> Result<McpClient, McpError> {
        let transport = tokio::time::timeout(ctx.connect_timeout, SseTransport::connect(url, headers))
            .await
            .map_err(|_| McpError::Timeout(ctx.connect_timeout))??;
        ctx.handshake(server, Arc::new(transport)).await
    }
}

#[async_trait]
impl Connector for TransportConnector {
    async fn connect(
        &self,
        descriptor: &UpstreamDescriptor,
        ctx: &ConnectContext,
    ) -> Result<McpClient, HubError> {
        let server = descriptor.name.as_str();
        let setup_failed = |source: McpError| HubError::ConnectionSetup {
            server: server.to_string(),
            source,
        };

        match &descriptor.target {
            UpstreamTarget::Command { command, args, env } => {
                tracing::debug!(server = %server, command = %command, "connecting over stdio");
                let transport = ChildProcessTransport::spawn(command, args, env).map_err(setup_failed)?;
                ctx.handshake(server, Arc::new(transport))
                    .await
                    .map_err(setup_failed)
            }
            UpstreamTarget::Url { url, headers } => {
                tracing::debug!(server = %server, url = %url, "connecting over streamable HTTP");
                match self.connect_streamable_http(server, url, headers, ctx).await {
                    Ok(client) => Ok(client),
                    Err(first) => {
                        tracing::warn!(
                            server = %server,
                            error = %first,
                            "streamable HTTP failed, falling back to SSE"
                        );
                        self.connect_sse(server, url, headers, ctx)
                            .await
                            .map_err(setup_failed)
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use toolmux_mcp::{ChannelTransport, NoopHandler};

    fn context() -> ConnectContext {
        ConnectContext {
            handler: Arc::new(NoopHandler),
            client_capabilities: ClientCapabilities::default(),
            client_info: Implementation::new("toolmux-test", "0.0.0"),
            peer_options: PeerOptions::default(),
            connect_timeout: Duration::from_secs(2),
            closers: Arc::new(CloseRegistry::new()),
        }
    }

    #[tokio::test]
    async fn test_missing_command_is_setup_failure() {
        let descriptor =
            UpstreamDescriptor::command("ghost", "/definitely/not/a/real/mcp-server", vec![]);
        let ctx = context();
        match TransportConnector.connect(&descriptor, &ctx).await {
            Err(HubError::ConnectionSetup { server, .. }) => assert_eq!(server, "ghost"),
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("connect should fail"),
        }
        // nothing was created, so nothing to close
        assert_eq!(ctx.closers.pending(), 0);
    }

    #[tokio::test]
    async fn test_unreachable_url_fails_after_fallback() {
        let descriptor = UpstreamDescriptor::url("nowhere", "http://127.0.0.1:9/mcp");
        let ctx = context();
        let result = TransportConnector.connect(&descriptor, &ctx).await;
        assert!(matches!(result, Err(HubError::ConnectionSetup { .. })));
        // the abandoned streamable HTTP attempt still registered its transport
        assert_eq!(ctx.closers.pending(), 1);
        ctx.closers.close_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_process_times_out() {
        // `cat` echoes our initialize request back, which is not a response
        let descriptor = UpstreamDescriptor::command("echoer", "cat", vec![]);
        let mut ctx = context();
        ctx.connect_timeout = Duration::from_millis(200);
        let result = TransportConnector.connect(&descriptor, &ctx).await;
        assert!(matches!(
            result,
            Err(HubError::ConnectionSetup { source: McpError::Timeout(_) | McpError::Rpc(_), .. })
        ));
        assert_eq!(ctx.closers.close_all().await, 0);
    }

    #[tokio::test]
    async fn test_failed_handshake_closes_the_transport() {
        let (hub_side, upstream_side) = ChannelTransport::pair();
        let mut ctx = context();
        ctx.connect_timeout = Duration::from_millis(200);

        let result = ctx.handshake("mute", Arc::new(hub_side)).await;
        assert!(matches!(result, Err(McpError::Timeout(_))));

        // the initialize request arrived, then the hub hung up
        let first = upstream_side.receive().await.unwrap().unwrap();
        assert!(first.contains("\"initialize\""));
        let next = tokio::time::timeout(Duration::from_secs(5), upstream_side.receive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next, None);
    }

    /// One HTTP/1.1 request as the fake server sees it.
    struct HttpRequest {
        method: String,
        path: String,
        body: String,
    }

    async fn read_request(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Option<HttpRequest> {
        let mut line = String::new();
        reader.read_line(&mut line).await.ok()?;
        let mut parts = line.split_whitespace();
        let method = parts.next()?.to_string();
        let path = parts.next()?.to_string();

        let mut content_length = 0;
        loop {
            let mut header = String::new();
            reader.read_line(&mut header).await.ok()?;
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some((name, value)) = header.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().ok()?;
                }
            }
        }

        let mut body = vec![0; content_length];
        reader.read_exact(&mut body).await.ok()?;
        Some(HttpRequest {
            method,
            path,
            body: String::from_utf8(body).ok()?,
        })
    }

    async fn write_chunk(writer: &mut tokio::net::tcp::OwnedWriteHalf, data: &str) -> std::io::Result<()> {
        writer
            .write_all(format!("{:x}\r\n{data}\r\n", data.len()).as_bytes())
            .await
    }

    /// Server that only speaks the legacy HTTP+SSE protocol: POSTs to the
    /// stream URL are refused, the event stream announces `/messages`, and
    /// replies to POSTed requests come back over the stream.
    async fn serve_legacy_sse(listener: TcpListener) {
        let (events_tx, events_rx) = mpsc::unbounded_channel::<String>();
        let events_rx = Arc::new(tokio::sync::Mutex::new(Some(events_rx)));
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(handle_connection(
                stream,
                events_tx.clone(),
                Arc::clone(&events_rx),
            ));
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        events_tx: mpsc::UnboundedSender<String>,
        events_rx: Arc<tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<String>>>>,
    ) {
        let (read, mut write) = stream.into_split();
        let mut reader = BufReader::new(read);

        while let Some(request) = read_request(&mut reader).await {
            match (request.method.as_str(), request.path.as_str()) {
                ("GET", "/mcp") => {
                    let Some(mut events) = events_rx.lock().await.take() else {
                        let _ = write
                            .write_all(b"HTTP/1.1 409 Conflict\r\ncontent-length: 0\r\n\r\n")
                            .await;
                        continue;
                    };
                    let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\n\r\n";
                    if write.write_all(head.as_bytes()).await.is_err()
                        || write_chunk(&mut write, "event: endpoint\ndata: /messages\n\n").await.is_err()
                    {
                        return;
                    }
                    while let Some(message) = events.recv().await {
                        let event = format!("event: message\ndata: {message}\n\n");
                        if write_chunk(&mut write, &event).await.is_err() {
                            return;
                        }
                    }
                    return;
                }
                ("POST", "/messages") => {
                    let message: Value = serde_json::from_str(&request.body).unwrap_or(Value::Null);
                    if message["method"] == "initialize" {
                        let reply = json!({
                            "jsonrpc": "2.0",
                            "id": message["id"],
                            "result": {
                                "protocolVersion": message["params"]["protocolVersion"],
                                "capabilities": {"tools": {}},
                                "serverInfo": {"name": "legacy", "version": "1.0.0"}
                            }
                        });
                        let _ = events_tx.send(reply.to_string());
                    }
                    let accepted = "HTTP/1.1 202 Accepted\r\ncontent-length: 0\r\n\r\n";
                    if write.write_all(accepted.as_bytes()).await.is_err() {
                        return;
                    }
                }
                _ => {
                    let refused = "HTTP/1.1 405 Method Not Allowed\r\ncontent-length: 0\r\n\r\n";
                    if write.write_all(refused.as_bytes()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn test_url_falls_back_to_legacy_sse() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/mcp", listener.local_addr().unwrap());
        tokio::spawn(serve_legacy_sse(listener));

        let descriptor = UpstreamDescriptor::url("legacy", url);
        let ctx = context();
        let client = TransportConnector.connect(&descriptor, &ctx).await.unwrap();
        assert_eq!(client.server_info().name, "legacy");
        assert!(client.capabilities().tools.is_some());

        // abandoned streamable HTTP transport, SSE transport, SSE session
        assert_eq!(ctx.closers.pending(), 3);
        assert_eq!(ctx.closers.close_all().await, 0);
    }
}
