//! Live upstream connections and the registry of close actions that tears
//! them down.

use std::future::Future;
use std::sync::{Arc, Mutex};

use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use indexmap::IndexMap;
use toolmux_mcp::{McpClient, McpError, ServerCapabilities};

/// Runtime handle to one initialized upstream server.
pub struct Connection {
    name: String,
    client: McpClient,
}

impl Connection {
    pub fn new(name: impl Into<String>, client: McpClient) -> Self {
        Self {
            name: name.into(),
            client,
        }
    }

    /// Configured server name: the namespace prefix for its identifiers.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn client(&self) -> &McpClient {
        &self.client
    }

    pub fn capabilities(&self) -> &ServerCapabilities {
        self.client.capabilities()
    }

    pub fn instructions(&self) -> Option<&str> {
        self.client.instructions()
    }
}

/// Live connections keyed by server name, in configuration order.
pub type ConnectionSet = IndexMap<String, Arc<Connection>>;

type CloseAction = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), McpError>> + Send>;

#[derive(Default)]
struct CloseState {
    actions: Vec<(String, CloseAction)>,
    closed: bool,
}

/// Shared list of cleanup actions for every resource the hub creates.
///
/// Each action runs exactly once. Actions registered after
/// [`CloseRegistry::close_all`] has run are executed immediately, so a
/// connection attempt that finishes late still cleans up after itself.
#[derive(Default)]
pub struct CloseRegistry {
    state: Mutex<CloseState>,
}

impl CloseRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&self, label: impl Into<String>, action: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), McpError>> + Send + 'static,
    {
        let label = label.into();
        let action: CloseAction = Box::new(move || action().boxed());

        let late = match self.state.lock() {
            Ok(mut state) if !state.closed => {
                state.actions.push((label, action));
                return;
            }
            _ => (label, action),
        };

        tracing::debug!(resource = %late.0, "registered after shutdown, closing now");
        tokio::spawn(run_close_action(late.0, late.1));
    }

    /// Number of actions still waiting to run.
    pub fn pending(&self) -> usize {
        self.state.lock().map(|s| s.actions.len()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Run every registered action concurrently, logging failures.
    /// Returns how many failed. Later calls find nothing left to run.
    pub async fn close_all(&self) -> usize {
        let actions = match self.state.lock() {
            Ok(mut state) => {
                state.closed = true;
                std::mem::take(&mut state.actions)
            }
            Err(_) => return 0,
        };
        if actions.is_empty() {
            return 0;
        }

        tracing::debug!(count = actions.len(), "running close actions");
        let results = join_all(
            actions
                .into_iter()
                .map(|(label, action)| run_close_action(label, action)),
        )
        .await;
        results.into_iter().filter(|ok| !ok).count()
    }
}

async fn run_close_action(label: String, action: CloseAction) -> bool {
    match action().await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(resource = %label, error = %e, "close action failed");
            false
        }
    }
}
