//! Subprocess transport: an MCP server spawned as a child process and
//! spoken to over its stdin/stdout.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;

use super::{read_line_message, write_line_message, McpTransport};
use crate::error::McpError;

/// How long a child gets to exit on its own after stdin is closed.
const EXIT_GRACE: Duration = Duration::from_secs(2);

#[cfg(not(windows))]
const INHERITED_ENV_VARS: &[&str] = &["HOME", "LOGNAME", "PATH", "SHELL", "TERM", "USER"];

#[cfg(windows)]
const INHERITED_ENV_VARS: &[&str] = &[
    "APPDATA",
    "HOMEDRIVE",
    "HOMEPATH",
    "LOCALAPPDATA",
    "PATH",
    "PROCESSOR_ARCHITECTURE",
    "SYSTEMDRIVE",
    "SYSTEMROOT",
    "TEMP",
    "USERNAME",
    "USERPROFILE",
];

/// The environment a spawned server starts from: a small allow-list of
/// variables inherited from this process.
///
/// Values starting with `()` are exported shell functions and are skipped.
pub fn default_environment() -> BTreeMap<String, String> {
    INHERITED_ENV_VARS
        .iter()
        .filter_map(|key| {
            let value = std::env::var(key).ok()?;
            if value.starts_with("()") {
                return None;
            }
            Some((key.to_string(), value))
        })
        .collect()
}

/// Newline-delimited JSON over a child process's standard streams.
///
/// Stderr is inherited so server diagnostics land in our own log stream.
pub struct ChildProcessTransport {
    program: String,
    child: Mutex<Option<Child>>,
    reader: Mutex<BufReader<ChildStdout>>,
    writer: Mutex<Option<ChildStdin>>,
}

impl ChildProcessTransport {
    /// Spawn `program` with `args`.
    ///
    /// The child's environment is [`default_environment`] overlaid with
    /// `env`; nothing else leaks through from this process.
    pub fn spawn(
        program: &str,
        args: &[String],
        env: &BTreeMap<String, String>,
    ) -> Result<Self, McpError> {
        tracing::info!(program = %program, "Spawning MCP server process");

        let mut child = Command::new(program)
            .args(args)
            .env_clear()
            .envs(default_environment())
            .envs(env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child.stdin.take().ok_or_else(|| {
            McpError::ServerUnavailable("Failed to capture server stdin".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            McpError::ServerUnavailable("Failed to capture server stdout".to_string())
        })?;

        Ok(Self {
            program: program.to_string(),
            child: Mutex::new(Some(child)),
            reader: Mutex::new(BufReader::new(stdout)),
            writer: Mutex::new(Some(stdin)),
        })
    }

    /// OS process id, while the child is still owned by this transport.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.as_ref().and_then(Child::id)
    }
}

#[async_trait]
impl McpTransport for ChildProcessTransport {
    async fn receive(&self) -> Result<Option<String>, McpError> {
        let mut reader = self.reader.lock().await;
        read_line_message(&mut *reader).await
    }

    async fn send(&self, message: &str) -> Result<(), McpError> {
        let mut writer = self.writer.lock().await;
        let stdin = writer.as_mut().ok_or(McpError::ConnectionClosed)?;
        write_line_message(stdin, message).await
    }

    async fn close(&self) -> Result<(), McpError> {
        // Closing stdin is the polite shutdown signal for stdio servers.
        drop(self.writer.lock().await.take());

        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };

        match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(program = %self.program, code = ?status.code(), "MCP server exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(program = %self.program, error = %e, "wait on MCP server failed");
            }
            Err(_) => {
                tracing::info!(program = %self.program, "MCP server did not exit, killing");
                child.kill().await?;
            }
        }
        Ok(())
    }
}
