//! CLI definition using clap derive.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pingwatch_runtime::persist::DEFAULT_CONSOLIDATED_NAME;

#[derive(Parser)]
#[command(
    name = "pingwatch",
    about = "Network latency monitor with anomaly episode detection"
)]
pub struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/pingwatch/config.toml)
    #[arg(long, short = 'c', global = true, env = "PINGWATCH_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Probe one or more targets until interrupted
    Run(RunOpts),
    /// Merge the daily probe logs into one file
    Consolidate(ConsolidateOpts),
    /// Show the effective configuration
    Config(ConfigOpts),
}

#[derive(clap::Args)]
pub struct RunOpts {
    /// Host to probe; repeat for several concurrent monitors
    #[arg(long = "target", short = 't')]
    pub targets: Vec<String>,

    /// Directory for probe and episode logs
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    /// Probe interval in seconds (overrides the config file)
    #[arg(long)]
    pub interval: Option<f64>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    pub duration: Option<f64>,

    /// Episode-log tag (default: current Wi-Fi network, else the target)
    #[arg(long)]
    pub tag: Option<String>,

    /// Emit one JSON object per tick instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(clap::Args)]
pub struct ConsolidateOpts {
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    /// Output file name inside the log directory
    #[arg(long, short = 'o', default_value = DEFAULT_CONSOLIDATED_NAME)]
    pub output: String,
}

#[derive(clap::Args)]
pub struct ConfigOpts {
    /// Write a default config file if none exists
    #[arg(long)]
    pub init: bool,
}

/// Default config path, following XDG conventions.
pub fn default_config_path() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME") {
        if !dir.is_empty() {
            return PathBuf::from(dir).join("pingwatch/config.toml");
        }
    }
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".config/pingwatch/config.toml");
    }
    PathBuf::from("pingwatch.toml")
}
