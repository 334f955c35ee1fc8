//! Hub configuration: the upstream servers to aggregate and timeouts.
//!
//! Loaded from TOML, or from JSON when the file name ends in `.json`.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse TOML config: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid server name {0:?}: use only letters, digits and '_'")]
    InvalidName(String),

    #[error("duplicate server name {0:?}")]
    DuplicateName(String),

    #[error("server {server:?}: {reason}")]
    InvalidServer { server: String, reason: String },
}

/// How to reach one upstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum UpstreamTarget {
    /// Spawn a subprocess speaking newline-delimited JSON on stdio.
    Command {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        env: BTreeMap<String, String>,
    },
    /// Connect over HTTP (streamable HTTP, falling back to legacy SSE).
    Url {
        url: String,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        headers: BTreeMap<String, String>,
    },
}

/// One configured upstream server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub target: UpstreamTarget,
}

impl UpstreamDescriptor {
    pub fn command(name: impl Into<String>, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            target: UpstreamTarget::Command {
                command: command.into(),
                args,
                env: BTreeMap::new(),
            },
        }
    }

    pub fn url(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: UpstreamTarget::Url {
                url: url.into(),
                headers: BTreeMap::new(),
            },
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        validate_server_name(&self.name)?;
        let invalid = |reason: String| ConfigError::InvalidServer {
            server: self.name.clone(),
            reason,
        };
        match &self.target {
            UpstreamTarget::Command { command, .. } if command.trim().is_empty() => {
                Err(invalid("command must not be empty".to_string()))
            }
            UpstreamTarget::Url { url, .. } => url::Url::parse(url)
                .map(|_| ())
                .map_err(|e| invalid(format!("invalid url {url:?}: {e}"))),
            UpstreamTarget::Command { .. } => Ok(()),
        }
    }
}

/// Server names become the prefix of every global identifier, so they
/// must not contain the codec separator `-`.
pub fn validate_server_name(name: &str) -> Result<(), ConfigError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(ConfigError::InvalidName(name.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeouts {
    /// Bound on establishing one upstream connection, handshake included.
    #[serde(default = "default_connect_secs")]
    pub connect_secs: u64,
    /// Bound on any single request to an upstream.
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
}

fn default_connect_secs() -> u64 {
    30
}

fn default_request_secs() -> u64 {
    60
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect_secs: default_connect_secs(),
            request_secs: default_request_secs(),
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect_secs)
    }

    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HubConfig {
    /// Listening port for an HTTP front end. Unused when serving over stdio.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, alias = "mcpServers")]
    pub mcp_servers: Vec<UpstreamDescriptor>,
    #[serde(default)]
    pub timeouts: Timeouts,
}

impl HubConfig {
    pub fn new(mcp_servers: Vec<UpstreamDescriptor>) -> Self {
        Self {
            mcp_servers,
            ..Default::default()
        }
    }

    /// Read and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        tracing::debug!(path = %path.display(), "loading config");
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        let config = if is_json {
            Self::from_json(&content)?
        } else {
            Self::from_toml(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Names non-empty, restricted to `[A-Za-z0-9_]` and unique; commands
    /// non-empty; URLs parseable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for server in &self.mcp_servers {
            server.validate()?;
            if !seen.insert(server.name.as_str()) {
                return Err(ConfigError::DuplicateName(server.name.clone()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
port = 3282

[timeouts]
connect_secs = 5

[[mcp_servers]]
name = "files"
kind = "command"
command = "npx"
args = ["-y", "@modelcontextprotocol/server-filesystem", "/tmp"]
env = { DEBUG = "1" }

[[mcp_servers]]
name = "search"
kind = "url"
url = "https://example.com/mcp"
headers = { Authorization = "Bearer token" }
"#;

    #[test]
    fn test_parse_toml() {
        let config = HubConfig::from_toml(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.port, Some(3282));
        assert_eq!(config.timeouts.connect(), Duration::from_secs(5));
        assert_eq!(config.timeouts.request(), Duration::from_secs(60));
        assert_eq!(config.mcp_servers.len(), 2);

        match &config.mcp_servers[0].target {
            UpstreamTarget::Command { command, args, env } => {
                assert_eq!(command, "npx");
                assert_eq!(args.len(), 3);
                assert_eq!(env.get("DEBUG").map(String::as_str), Some("1"));
            }
            other => panic!("expected command, got {other:?}"),
        }
        match &config.mcp_servers[1].target {
            UpstreamTarget::Url { url, headers } => {
                assert_eq!(url, "https://example.com/mcp");
                assert!(headers.contains_key("Authorization"));
            }
            other => panic!("expected url, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_json_with_camel_case_alias() {
        let json = r#"{
            "mcpServers": [
                {"name": "echo", "kind": "command", "command": "echo-server"}
            ]
        }"#;
        let config = HubConfig::from_json(json).unwrap();
        assert_eq!(config.port, None);
        assert_eq!(config.timeouts, Timeouts::default());
        assert_eq!(
            config.mcp_servers,
            vec![UpstreamDescriptor::command("echo", "echo-server", vec![])]
        );
    }

    #[test]
    fn test_empty_config_is_valid() {
        let config = HubConfig::from_toml("").unwrap();
        config.validate().unwrap();
        assert!(config.mcp_servers.is_empty());
    }

    #[test]
    fn test_server_name_charset() {
        validate_server_name("github_2").unwrap();
        for bad in ["", "my-server", "a b", "ü"] {
            assert!(
                matches!(validate_server_name(bad), Err(ConfigError::InvalidName(_))),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let config = HubConfig::new(vec![
            UpstreamDescriptor::command("a", "x", vec![]),
            UpstreamDescriptor::url("a", "http://localhost/mcp"),
        ]);
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateName(n)) if n == "a"));
    }

    #[test]
    fn test_invalid_targets_rejected() {
        let empty_command = HubConfig::new(vec![UpstreamDescriptor::command("a", " ", vec![])]);
        assert!(matches!(
            empty_command.validate(),
            Err(ConfigError::InvalidServer { .. })
        ));

        let bad_url = HubConfig::new(vec![UpstreamDescriptor::url("b", "not a url")]);
        assert!(matches!(
            bad_url.validate(),
            Err(ConfigError::InvalidServer { .. })
        ));
    }

    #[test]
    fn test_load_picks_format_by_extension() {
        let dir = tempfile::tempdir().unwrap();

        let toml_path = dir.path().join("config.toml");
        std::fs::File::create(&toml_path)
            .unwrap()
            .write_all(SAMPLE.as_bytes())
            .unwrap();
        assert_eq!(HubConfig::load(&toml_path).unwrap().mcp_servers.len(), 2);

        let json_path = dir.path().join("config.json");
        std::fs::write(
            &json_path,
            r#"{"mcp_servers": [{"name": "bad-name", "kind": "url", "url": "http://x"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            HubConfig::load(&json_path),
            Err(ConfigError::InvalidName(_))
        ));

        assert!(matches!(
            HubConfig::load(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }
}
