//! Legacy HTTP+SSE transport (client side).
//!
//! A long-lived GET event stream carries every server-to-client message.
//! Its first `endpoint` event names the URL that client messages are
//! POSTed to.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use url::Url;

use super::event_stream::{pump_messages, EventStreamDecoder};
use super::McpTransport;
use crate::error::McpError;

pub struct SseTransport {
    client: reqwest::Client,
    endpoint: Url,
    headers: BTreeMap<String, String>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    reader: std::sync::Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl SseTransport {
    /// Open the event stream at `url` and wait for the server to announce
    /// its message endpoint.
    ///
    /// Nothing is spawned until the endpoint arrives, so dropping this
    /// future (e.g. on a connect timeout) leaves nothing running.
    pub async fn connect(url: &str, headers: &BTreeMap<String, String>) -> Result<Self, McpError> {
        let base = Url::parse(url)
            .map_err(|e| McpError::InvalidParams(format!("invalid URL {url}: {e}")))?;
        let client = reqwest::Client::new();

        let mut request = client.get(base.clone()).header(ACCEPT, "text/event-stream");
        for (key, value) in headers {
            request = request.header(key.as_str(), value.as_str());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::HttpStatus {
                status: status.as_u16(),
                url: base.to_string(),
            });
        }

        let mut body = Box::pin(response.bytes_stream());
        let mut decoder = EventStreamDecoder::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let endpoint = loop {
            let Some(chunk) = body.next().await else {
                return Err(McpError::ServerUnavailable(format!(
                    "event stream from {base} ended before announcing an endpoint"
                )));
            };
            let chunk = chunk?;

            let mut endpoint = None;
            for event in decoder.feed(&chunk) {
                match event.event.as_str() {
                    "endpoint" if endpoint.is_none() => {
                        endpoint = Some(resolve_endpoint(&base, &event.data)?);
                    }
                    "message" => {
                        let _ = inbound_tx.send(event.data);
                    }
                    other => tracing::debug!(event = %other, "ignoring server event"),
                }
            }
            if let Some(endpoint) = endpoint {
                break endpoint;
            }
        };

        tracing::debug!(url = %base, endpoint = %endpoint, "SSE endpoint announced");
        let reader = tokio::spawn(pump_messages(body, decoder, inbound_tx));

        Ok(Self {
            client,
            endpoint,
            headers: headers.clone(),
            inbound_rx: Mutex::new(inbound_rx),
            reader: std::sync::Mutex::new(Some(reader)),
            closed: AtomicBool::new(false),
        })
    }

    /// URL that client messages are POSTed to.
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

/// Resolve the announced endpoint against the stream URL. The endpoint
/// must stay on the stream's origin.
fn resolve_endpoint(base: &Url, announced: &str) -> Result<Url, McpError> {
    let endpoint = base.join(announced.trim()).map_err(|e| {
        McpError::ServerUnavailable(format!("invalid endpoint {announced:?}: {e}"))
    })?;
    if endpoint.origin() != base.origin() {
        return Err(McpError::ServerUnavailable(format!(
            "endpoint origin {} does not match {}",
            endpoint.origin().ascii_serialization(),
            base.origin().ascii_serialization()
        )));
    }
    Ok(endpoint)
}

#[async_trait]
impl McpTransport for SseTransport {
    async fn receive(&self) -> Result<Option<String>, McpError> {
        Ok(self.inbound_rx.lock().await.recv().await)
    }

    async fn send(&self, message: &str) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::ConnectionClosed);
        }

        let mut request = self
            .client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(message.to_string());
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpError::HttpStatus {
                status: status.as_u16(),
                url: self.endpoint.to_string(),
            });
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        // Aborting the reader drops the last inbound sender, ending receive().
        if let Some(reader) = self.reader.lock().ok().and_then(|mut r| r.take()) {
            reader.abort();
        }
        Ok(())
    }
}
