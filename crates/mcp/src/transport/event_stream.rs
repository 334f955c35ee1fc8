//! Incremental `text/event-stream` decoding shared by the HTTP transports.

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;

/// One dispatched server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSentEvent {
    /// Event type; `"message"` when the stream did not name one.
    pub event: String,
    /// Data lines joined with `\n`.
    pub data: String,
    pub id: Option<String>,
}

/// Buffers raw body chunks and yields events as blank lines complete them.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: String,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of the response body and return every event it completed.
    ///
    /// Chunks may split lines (or UTF-8 sequences, which decode lossily)
    /// anywhere; partial lines stay buffered until the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<ServerSentEvent> {
        self.buffer.push_str(&String::from_utf8_lossy(chunk));

        let mut events = Vec::new();
        while let Some(newline_pos) = self.buffer.find('\n') {
            let line = self.buffer[..newline_pos]
                .trim_end_matches('\r')
                .to_string();
            self.buffer.drain(..=newline_pos);

            if line.is_empty() {
                if let Some(event) = self.dispatch() {
                    events.push(event);
                }
                continue;
            }
            self.process_line(&line);
        }
        events
    }

    /// Flush a trailing event when the stream ends without a final blank line.
    pub fn finish(&mut self) -> Option<ServerSentEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let rest = rest.trim_end_matches('\r');
        if !rest.is_empty() {
            self.process_line(rest);
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) {
        // comment / keep-alive
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
    }

    fn dispatch(&mut self) -> Option<ServerSentEvent> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        Some(ServerSentEvent {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: std::mem::take(&mut self.data).join("\n"),
            id: self.id.clone(),
        })
    }
}

/// Drive an event-stream body to completion, forwarding the data of every
/// `message` event to `inbound`.
///
/// Returns when the body ends, fails, or the receiving side has gone away.
pub(crate) async fn pump_messages<S>(
    mut body: S,
    mut decoder: EventStreamDecoder,
    inbound: mpsc::UnboundedSender<String>,
) where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
{
    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                tracing::warn!(error = %e, "event stream failed");
                return;
            }
        };
        for event in decoder.feed(&chunk) {
            if !forward_message(&inbound, event) {
                return;
            }
        }
    }
    if let Some(event) = decoder.finish() {
        forward_message(&inbound, event);
    }
}

fn forward_message(inbound: &mpsc::UnboundedSender<String>, event: ServerSentEvent) -> bool {
    if event.event != "message" {
        tracing::debug!(event = %event.event, "ignoring non-message server event");
        return true;
    }
    if event.data.trim().is_empty() {
        return true;
    }
    inbound.send(event.data).is_ok()
}
