use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

use hostfleet_api::cli::Args;
use hostfleet_api::config::{Config, ConfigSource};
use hostfleet_api::server;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // The config file may choose the log format, so read it first and
    // report the outcome once logging is up.
    let resolved = Config::resolve(&args);
    let log_format = match &resolved {
        Ok((config, _)) => config.logging.format,
        Err(_) => args.log_format.unwrap_or_default(),
    };
    hostfleet_common::init_logging(&args.log_level, log_format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting hostfleet daemon"
    );

    let config = match resolved {
        Ok((config, ConfigSource::File(config_path))) => {
            info!(config_path = %config_path, "Configuration loaded");
            config
        }
        Ok((config, ConfigSource::Defaults)) => {
            info!("No config file found, using CLI arguments and defaults");
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            return Err(e);
        }
    };

    info!(
        listen = %config.server.listen_address,
        hypervisor = ?config.hypervisor.backend,
        log_format = ?config.logging.format,
        registry = %config.registry.resolved_path().display(),
        "Daemon configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Server failed");
        return Err(e);
    }

    Ok(())
}
