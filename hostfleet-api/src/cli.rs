//! Command-line argument parsing.

use clap::Parser;
use hostfleet_common::LogFormat;
use std::path::PathBuf;

/// hostfleet daemon - manage a fleet of hypervisor hosts
#[derive(Parser, Debug)]
#[command(name = "hostfleetd")]
#[command(about = "hostfleet daemon - REST API over a pool of hypervisor host connections")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long, env = "HOSTFLEET_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "HOSTFLEET_LOG_LEVEL")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, env = "HOSTFLEET_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Listen address for the REST API
    #[arg(long, env = "HOSTFLEET_LISTEN")]
    pub listen: Option<String>,

    /// Host registry file
    #[arg(long, env = "HOSTFLEET_REGISTRY")]
    pub registry_path: Option<PathBuf>,

    /// Hypervisor URI seeded into an empty registry
    #[arg(long)]
    pub libvirt_uri: Option<String>,

    /// Enable development mode (mock hypervisor)
    #[arg(long)]
    pub dev: bool,
}
