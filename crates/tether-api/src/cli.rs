//! Command-line flags for the `tether` binary.

use std::path::PathBuf;

use clap::Parser;
use tether_types::config::TetherConfig;

/// Correlate external webhooks and timers with suspended workflow steps.
#[derive(Debug, Parser)]
#[command(name = "tether", version, about, long_about = None)]
pub struct Cli {
    /// Path to config.toml (default: `{data_dir}/config.toml`).
    #[arg(long, env = "TETHER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Interface to bind to; overrides `[server] host`.
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on; overrides `[server] port`.
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Log more (-v for debug, -vv for trace). `RUST_LOG` still wins.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

impl Cli {
    /// Apply flag overrides on top of the loaded file.
    pub fn apply(&self, config: &mut TetherConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        match self.verbose {
            0 => {}
            1 => config.logging.filter = "info,tether=debug,tether_core=debug,tether_infra=debug".to_string(),
            _ => config.logging.filter = "trace".to_string(),
        }
    }
}
