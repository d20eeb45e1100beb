//! Daemon wiring: backend, pool, registry, HTTP server and shutdown.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use hostfleet_hypervisor::{Connector, MockConnector};
use hostfleet_pool::ConnectionPool;

use crate::config::{Config, HypervisorBackend};
use crate::http_server::{connect_and_record, run_http_server, AppState};
use crate::registry::HostRegistry;

/// Run the daemon until Ctrl-C.
pub async fn run(config: Config) -> Result<()> {
    let connector = build_connector(&config);

    let pool = Arc::new(ConnectionPool::new(config.pool.to_pool_config(), Arc::clone(&connector)));

    let registry_path = config.registry.resolved_path();
    let registry = Arc::new(
        HostRegistry::open(&registry_path)
            .await
            .with_context(|| format!("Failed to open host registry {}", registry_path.display()))?,
    );

    let state = Arc::new(AppState::new(Arc::clone(&pool), registry, connector));

    initialize_hosts(&state, &config).await;

    let addr: std::net::SocketAddr = config
        .server
        .listen_address
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid listen address: {}", e))?;

    let served = run_http_server(addr, state, shutdown_signal()).await;

    info!("Shutting down connection pool");
    pool.close_all().await;

    served
}

fn build_connector(config: &Config) -> Arc<dyn Connector> {
    match config.hypervisor.backend {
        HypervisorBackend::Mock => {
            info!("Using mock hypervisor backend");
            Arc::new(MockConnector::new())
        }
        HypervisorBackend::Libvirt => {
            #[cfg(feature = "libvirt")]
            {
                info!("Using libvirt hypervisor backend");
                Arc::new(hostfleet_hypervisor::LibvirtConnector::new())
            }
            #[cfg(not(feature = "libvirt"))]
            {
                warn!("Libvirt backend requested but not compiled in, falling back to mock");
                Arc::new(MockConnector::new())
            }
        }
    }
}

/// Seed an empty registry from config, then connect to the default host.
pub async fn initialize_hosts(state: &AppState, config: &Config) {
    let existing = state.registry.host_count().await;
    if existing > 0 {
        info!(host_count = existing, "Host registry already initialized");
    } else {
        let hv = &config.hypervisor;
        match state
            .registry
            .migrate_from_config(&hv.default_uri, &hv.iso_pool, &hv.template_pool, &hv.image_pool_path)
            .await
        {
            Ok(Some(host)) => info!(host_id = %host.id, uri = %host.uri, "Seeded registry from configuration"),
            Ok(None) => {}
            Err(e) => {
                warn!(error = %e, "Failed to seed host registry from configuration");
                return;
            }
        }
    }

    let default = match state.registry.default_host().await {
        Ok(host) => host,
        Err(e) => {
            warn!(error = %e, "No default host to connect to");
            return;
        }
    };

    connect_and_record(state, &default).await;
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
