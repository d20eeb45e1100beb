//! Libvirt backend implementation.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, instrument, warn};
use virt::connect::Connect;
use virt::storage_pool::StoragePool;
use virt::sys;

use crate::error::{HypervisorError, Result};
use crate::traits::{Connector, HypervisorClient};
use crate::types::*;

/// Opens libvirt connections.
///
/// libvirt calls block, so every call runs on the blocking thread pool.
/// Common URIs:
/// - `qemu:///system` - System-wide QEMU/KVM
/// - `qemu:///session` - User session QEMU
/// - `qemu+ssh://user@host/system` - Remote via SSH
#[derive(Debug, Default)]
pub struct LibvirtConnector;

impl LibvirtConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connector for LibvirtConnector {
    fn name(&self) -> &'static str {
        "libvirt"
    }

    #[instrument(skip(self, options), fields(uri = %options.uri))]
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn HypervisorClient>> {
        info!("Connecting to libvirt");

        let uri = options.uri.clone();
        let open = tokio::task::spawn_blocking(move || Connect::open(Some(&uri)));

        // A timed-out open keeps running on its blocking thread; the handle it
        // eventually produces is dropped, which releases the connection.
        let connection = match tokio::time::timeout(options.timeout, open).await {
            Err(_) => return Err(HypervisorError::Timeout(options.timeout.as_secs())),
            Ok(Err(e)) => return Err(HypervisorError::Internal(e.to_string())),
            Ok(Ok(Err(e))) => return Err(HypervisorError::ConnectionFailed(e.to_string())),
            Ok(Ok(Ok(connection))) => connection,
        };

        info!("Connected to libvirt");

        Ok(Arc::new(LibvirtClient {
            uri: options.uri.clone(),
            iso_pool: options.iso_pool.clone(),
            template_pool: options.template_pool.clone(),
            connection: Arc::new(Mutex::new(Some(connection))),
        }))
    }
}

/// A libvirt connection to one host.
pub struct LibvirtClient {
    uri: String,
    iso_pool: String,
    template_pool: String,
    connection: Arc<Mutex<Option<Connect>>>,
}

impl LibvirtClient {
    /// Run `f` against the open connection on the blocking pool.
    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connect) -> Result<T> + Send + 'static,
    {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let guard = connection
                .lock()
                .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
            let conn = guard
                .as_ref()
                .ok_or_else(|| HypervisorError::QueryFailed("connection is closed".to_string()))?;
            f(conn)
        })
        .await
        .map_err(|e| HypervisorError::Internal(e.to_string()))?
    }

    /// Convert the packed libvirt version number to `major.minor.micro`.
    fn format_version(version: u32) -> String {
        let major = version / 1_000_000;
        let minor = (version / 1000) % 1000;
        let micro = version % 1000;
        format!("{}.{}.{}", major, minor, micro)
    }

    fn pool_check(conn: &Connect, label: &str, pool_name: &str) -> HostHealthCheck {
        let check_name = format!("{}_pool", label);
        if pool_name.is_empty() {
            return HostHealthCheck::new(check_name, CheckStatus::Warning, "No pool configured");
        }
        match StoragePool::lookup_by_name(conn, pool_name) {
            Ok(pool) => match pool.is_active() {
                Ok(true) => HostHealthCheck::new(check_name, CheckStatus::Ok, format!("Pool '{}' is active", pool_name)),
                Ok(false) => HostHealthCheck::new(check_name, CheckStatus::Warning, format!("Pool '{}' is inactive", pool_name)),
                Err(e) => HostHealthCheck::new(check_name, CheckStatus::Error, e.to_string()),
            },
            Err(_) => HostHealthCheck::new(check_name, CheckStatus::Error, format!("Pool '{}' not found", pool_name)),
        }
    }
}

#[async_trait]
impl HypervisorClient for LibvirtClient {
    fn uri(&self) -> &str {
        &self.uri
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn host_status(&self) -> Result<HostStatus> {
        let iso_pool = self.iso_pool.clone();
        let template_pool = self.template_pool.clone();

        self.with_connection(move |conn| {
            if !conn.is_alive().unwrap_or(false) {
                return Err(HypervisorError::HealthCheckFailed("connection is not alive".to_string()));
            }

            let hostname = conn.get_hostname()
                .map_err(|e| HypervisorError::HealthCheckFailed(e.to_string()))?;
            let version = conn.get_hyp_version()
                .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;

            let flags = sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE |
                        sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
            let domains = conn.list_all_domains(flags)
                .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;

            let mut status = HostStatus {
                hostname,
                hypervisor_version: Self::format_version(version),
                total_vms: domains.len() as u32,
                checked_at: chrono::Utc::now(),
                ..Default::default()
            };

            for domain in &domains {
                match domain.get_state() {
                    Ok((sys::VIR_DOMAIN_RUNNING, _)) => status.running_vms += 1,
                    Ok((sys::VIR_DOMAIN_PAUSED, _)) => status.paused_vms += 1,
                    Ok((sys::VIR_DOMAIN_SHUTOFF, _)) => status.shut_off_vms += 1,
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Failed to read domain state"),
                }
            }

            status.health_checks = vec![
                HostHealthCheck::new("libvirt", CheckStatus::Ok, "Connection alive"),
                Self::pool_check(conn, "iso", &iso_pool),
                Self::pool_check(conn, "template", &template_pool),
            ];

            debug!(total_vms = status.total_vms, "Host status collected");
            Ok(status)
        })
        .await
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn host_resources(&self) -> Result<HostResources> {
        self.with_connection(|conn| {
            let info = conn.get_node_info()
                .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;
            let free = conn.get_free_memory()
                .map_err(|e| HypervisorError::QueryFailed(e.to_string()))?;

            Ok(HostResources {
                cpu_model: info.model,
                cpu_cores: info.cpus,
                cpu_mhz: info.mhz,
                memory_total_bytes: info.memory * 1024, // KiB to bytes
                memory_free_bytes: free,
            })
        })
        .await
    }

    #[instrument(skip(self), fields(uri = %self.uri))]
    async fn close(&self) -> Result<()> {
        let connection = Arc::clone(&self.connection);
        tokio::task::spawn_blocking(move || {
            let mut guard = connection
                .lock()
                .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
            let mut conn = guard
                .take()
                .ok_or_else(|| HypervisorError::CloseFailed("connection already closed".to_string()))?;
            conn.close()
                .map_err(|e| HypervisorError::CloseFailed(e.to_string()))?;
            Ok(())
        })
        .await
        .map_err(|e| HypervisorError::Internal(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_version() {
        assert_eq!(LibvirtClient::format_version(8_000_000), "8.0.0");
        assert_eq!(LibvirtClient::format_version(9_005_001), "9.5.1");
    }
}
