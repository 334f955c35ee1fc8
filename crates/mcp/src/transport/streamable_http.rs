//! MCP streamable HTTP transport (client side).
//!
//! Every outbound message is a POST to the server URL. The server answers
//! with `202 Accepted`, a JSON body, or an event stream carrying one or more
//! messages. After initialization an optional standalone GET stream carries
//! server-initiated traffic. All inbound messages funnel into one channel
//! that [`McpTransport::receive`] drains.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use super::event_stream::{pump_messages, EventStreamDecoder};
use super::McpTransport;
use crate::error::McpError;
use crate::messages::methods;

const SESSION_HEADER: &str = "mcp-session-id";
const EVENT_STREAM: &str = "text/event-stream";

pub struct StreamableHttpTransport {
    client: reqwest::Client,
    url: url::Url,
    headers: BTreeMap<String, String>,
    session_id: std::sync::Mutex<Option<String>>,
    inbound_tx: std::sync::Mutex<Option<mpsc::UnboundedSender<String>>>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<String>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    standalone_opened: AtomicBool,
    closed: AtomicBool,
}

impl StreamableHttpTransport {
    /// Create a transport for `url`. No request is made until the first send.
    ///
    /// `headers` are added to every request.
    pub fn new(url: &str, headers: &BTreeMap<String, String>) -> Result<Self, McpError> {
        let url = url::Url::parse(url)
            .map_err(|e| McpError::InvalidParams(format!("invalid URL {url}: {e}")))?;
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        Ok(Self {
            client: reqwest::Client::new(),
            url,
            headers: headers.clone(),
            session_id: std::sync::Mutex::new(None),
            inbound_tx: std::sync::Mutex::new(Some(inbound_tx)),
            inbound_rx: Mutex::new(inbound_rx),
            tasks: std::sync::Mutex::new(Vec::new()),
            standalone_opened: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Session id assigned by the server, once one has been.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().ok().and_then(|s| s.clone())
    }

    fn request(&self, method: reqwest::Method) -> reqwest::RequestBuilder {
        let mut request = self.client.request(method, self.url.clone());
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(session_id) = self.session_id() {
            request = request.header(SESSION_HEADER, session_id);
        }
        request
    }

    fn inbound(&self) -> Result<mpsc::UnboundedSender<String>, McpError> {
        self.inbound_tx
            .lock()
            .ok()
            .and_then(|tx| tx.clone())
            .ok_or(McpError::ConnectionClosed)
    }

    fn spawn_task(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }

    fn capture_session(&self, response: &reqwest::Response) {
        let Some(value) = response.headers().get(SESSION_HEADER) else {
            return;
        };
        let Ok(value) = value.to_str() else {
            return;
        };
        if let Ok(mut session) = self.session_id.lock() {
            if session.as_deref() != Some(value) {
                tracing::debug!(url = %self.url, session = %value, "MCP session established");
                *session = Some(value.to_string());
            }
        }
    }

    /// Open the standalone GET stream for server-initiated messages.
    ///
    /// Servers that don't offer one answer 405; that is not an error.
    fn open_standalone_stream(&self) {
        if self.standalone_opened.swap(true, Ordering::SeqCst) {
            return;
        }
        let Ok(inbound) = self.inbound() else {
            return;
        };
        let request = self.request(reqwest::Method::GET).header(ACCEPT, EVENT_STREAM);
        let url = self.url.clone();

        self.spawn_task(tokio::spawn(async move {
            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    tracing::debug!(url = %url, error = %e, "standalone event stream unavailable");
                    return;
                }
            };
            let status = response.status();
            if status == StatusCode::METHOD_NOT_ALLOWED {
                tracing::debug!(url = %url, "server offers no standalone event stream");
                return;
            }
            if !status.is_success() {
                tracing::debug!(url = %url, %status, "standalone event stream refused");
                return;
            }
            pump_messages(
                Box::pin(response.bytes_stream()),
                EventStreamDecoder::new(),
                inbound,
            )
            .await;
        }));
    }
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with(EVENT_STREAM))
}

#[async_trait]
impl McpTransport for StreamableHttpTransport {
    async fn receive(&self) -> Result<Option<String>, McpError> {
        Ok(self.inbound_rx.lock().await.recv().await)
    }

    async fn send(&self, message: &str) -> Result<(), McpError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(McpError::ConnectionClosed);
        }
        let inbound = self.inbound()?;

        let response = self
            .request(reqwest::Method::POST)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, format!("application/json, {EVENT_STREAM}"))
            .body(message.to_string())
            .send()
            .await?;

        self.capture_session(&response);

        let status = response.status();
        if !status.is_success() {
            return Err(McpError::HttpStatus {
                status: status.as_u16(),
                url: self.url.to_string(),
            });
        }

        if status != StatusCode::ACCEPTED {
            if is_event_stream(&response) {
                let body = Box::pin(response.bytes_stream());
                self.spawn_task(tokio::spawn(pump_messages(
                    body,
                    EventStreamDecoder::new(),
                    inbound,
                )));
            } else {
                let body = response.text().await?;
                if !body.trim().is_empty() {
                    match serde_json::from_str::<Value>(&body)? {
                        Value::Array(batch) => {
                            for item in batch {
                                let _ = inbound.send(item.to_string());
                            }
                        }
                        _ => {
                            let _ = inbound.send(body);
                        }
                    }
                }
            }
        }

        let is_initialized = serde_json::from_str::<Value>(message)
            .ok()
            .and_then(|v| v.get("method").and_then(Value::as_str).map(str::to_owned))
            .is_some_and(|m| m == methods::NOTIFY_INITIALIZED);
        if is_initialized {
            self.open_standalone_stream();
        }

        Ok(())
    }

    async fn close(&self) -> Result<(), McpError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        if let Ok(mut tx) = self.inbound_tx.lock() {
            tx.take();
        }

        if self.session_id().is_some() {
            match self.request(reqwest::Method::DELETE).send().await {
                Ok(response) => {
                    tracing::debug!(url = %self.url, status = %response.status(), "MCP session terminated");
                }
                Err(e) => {
                    tracing::debug!(url = %self.url, error = %e, "failed to terminate MCP session");
                }
            }
        }
        Ok(())
    }
}
