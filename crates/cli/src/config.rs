use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use toolmux_core::{HubConfig, UpstreamTarget};

/// Return the default config directory path: ~/.config/toolmux/
pub fn default_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("could not determine user config directory")?
        .join("toolmux");
    Ok(config_dir)
}

/// Return the default config file path.
pub fn default_config_path() -> Result<PathBuf> {
    Ok(default_config_dir()?.join("config.toml"))
}

/// Load and validate the hub config.
///
/// An explicit path must exist. A missing file at the default path yields
/// an empty config, so the hub starts with no upstreams.
pub fn load(path: Option<&str>) -> Result<HubConfig> {
    let config = match path {
        Some(p) => read(Path::new(p))?,
        None => {
            let default_path = default_config_path()?;
            if default_path.exists() {
                read(&default_path)?
            } else {
                warn!(path = %default_path.display(), "config file not found, starting with no upstreams");
                HubConfig::default()
            }
        }
    };
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn read(path: &Path) -> Result<HubConfig> {
    debug!(path = %path.display(), "loading config");
    HubConfig::load(path).with_context(|| format!("failed to load config: {}", path.display()))
}

/// One line per upstream, for `--check`.
pub fn summary(config: &HubConfig) -> Vec<String> {
    config
        .mcp_servers
        .iter()
        .map(|server| match &server.target {
            UpstreamTarget::Command { command, args, .. } if args.is_empty() => {
                format!("{}: command `{command}`", server.name)
            }
            UpstreamTarget::Command { command, args, .. } => {
                format!("{}: command `{command} {}`", server.name, args.join(" "))
            }
            UpstreamTarget::Url { url, .. } => format!("{}: url {url}", server.name),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_explicit_toml() {
        let file = write_config(
            ".toml",
            r#"
[[mcp_servers]]
name = "files"
kind = "command"
command = "npx"
args = ["-y", "server-filesystem"]

[[mcp_servers]]
name = "search"
kind = "url"
url = "https://example.com/mcp"
"#,
        );
        let config = load(file.path().to_str()).unwrap();
        assert_eq!(
            summary(&config),
            vec![
                "files: command `npx -y server-filesystem`".to_string(),
                "search: url https://example.com/mcp".to_string(),
            ]
        );
    }

    #[test]
    fn test_load_rejects_invalid_names() {
        let file = write_config(
            ".json",
            r#"{"mcpServers": [{"name": "bad-name", "kind": "command", "command": "x"}]}"#,
        );
        assert!(load(file.path().to_str()).is_err());
    }

    #[test]
    fn test_missing_explicit_path_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(load(missing.to_str()).is_err());
    }
}
