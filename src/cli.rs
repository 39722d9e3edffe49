// Command Line
// Flags for the dbtools-mcp binary

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Parser)]
#[command(name = "dbtools-mcp", version, about = "PostgreSQL, MySQL and Oracle tools over MCP stdio")]
pub struct Cli {
    /// Path to tools.yaml. Searched for in the usual locations when omitted.
    #[arg(short, long, env = "DBTOOLS_CONFIG")]
    pub config: Option<PathBuf>,

    /// Validate the configuration, print a summary and exit
    #[arg(long)]
    pub validate_config: bool,

    /// Seconds between idle-connection sweeps
    #[arg(long, default_value_t = 3600)]
    pub sweep_interval_secs: u64,

    /// Connections unused for this many hours are closed by the sweeper
    #[arg(long, default_value_t = 24)]
    pub max_idle_hours: u64,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// Sweep interval, never shorter than one second
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}
