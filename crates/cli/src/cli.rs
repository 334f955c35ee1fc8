use clap::Parser;

/// Aggregating MCP proxy.
///
/// Connects to every upstream server in the config file and serves them
/// as a single MCP server over stdin/stdout.
#[derive(Parser, Debug)]
#[command(name = "toolmux", about = "Aggregate many MCP servers behind one")]
pub struct CliArgs {
    /// Path to config file (default: ~/.config/toolmux/config.toml)
    #[arg(long, env = "TOOLMUX_CONFIG")]
    pub config: Option<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Validate the config, print the configured upstreams and exit
    #[arg(long)]
    pub check: bool,
}
