//! Mock hypervisor backend for testing and development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::traits::{Connector, HypervisorClient};
use crate::types::*;

/// Mock connector for testing.
///
/// Hosts are simulated in memory and keyed by URI. Useful for:
/// - Unit and integration testing of the connection pool
/// - Development without libvirt installed (`--dev`)
///
/// Unknown URIs are accepted and become healthy hosts on first connect,
/// unless the connector was built with [`MockConnector::strict`].
pub struct MockConnector {
    hosts: RwLock<HashMap<String, Arc<MockHost>>>,
    connect_count: AtomicUsize,
    connect_delay: Duration,
    status_delay: Duration,
    accept_unknown: bool,
}

/// Simulated host state shared by every client connected to it.
#[derive(Debug)]
struct MockHost {
    hostname: String,
    reachable: AtomicBool,
    healthy: AtomicBool,
    connects: AtomicUsize,
    closes: AtomicUsize,
}

impl MockHost {
    fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            reachable: AtomicBool::new(true),
            healthy: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
        }
    }
}

impl MockConnector {
    /// Create a connector that accepts any non-empty URI.
    pub fn new() -> Self {
        info!("Creating mock hypervisor connector");
        Self {
            hosts: RwLock::new(HashMap::new()),
            connect_count: AtomicUsize::new(0),
            connect_delay: Duration::ZERO,
            status_delay: Duration::ZERO,
            accept_unknown: true,
        }
    }

    /// Create a connector that only accepts URIs registered with [`add_host`](Self::add_host).
    pub fn strict() -> Self {
        Self {
            accept_unknown: false,
            ..Self::new()
        }
    }

    /// Simulate connection latency.
    pub fn with_connect_delay(mut self, delay: Duration) -> Self {
        self.connect_delay = delay;
        self
    }

    /// Simulate a slow `host_status` answer on every client from this connector.
    pub fn with_status_delay(mut self, delay: Duration) -> Self {
        self.status_delay = delay;
        self
    }

    /// Register a reachable, healthy host.
    pub fn add_host(&self, uri: &str, hostname: &str) {
        if let Ok(mut hosts) = self.hosts.write() {
            hosts.insert(uri.to_string(), Arc::new(MockHost::new(hostname)));
        }
    }

    /// Control whether new connections to `uri` succeed.
    pub fn set_reachable(&self, uri: &str, reachable: bool) {
        self.host_entry(uri).reachable.store(reachable, Ordering::SeqCst);
    }

    /// Control whether status calls on existing connections to `uri` succeed.
    pub fn set_healthy(&self, uri: &str, healthy: bool) {
        self.host_entry(uri).healthy.store(healthy, Ordering::SeqCst);
    }

    /// Total connect attempts across all hosts.
    pub fn connect_count(&self) -> usize {
        self.connect_count.load(Ordering::SeqCst)
    }

    /// Connect attempts made against `uri`.
    pub fn connects_to(&self, uri: &str) -> usize {
        self.lookup(uri)
            .map(|h| h.connects.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Clients closed for `uri`.
    pub fn closes_of(&self, uri: &str) -> usize {
        self.lookup(uri)
            .map(|h| h.closes.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    fn lookup(&self, uri: &str) -> Option<Arc<MockHost>> {
        self.hosts.read().ok()?.get(uri).cloned()
    }

    fn host_entry(&self, uri: &str) -> Arc<MockHost> {
        if let Some(host) = self.lookup(uri) {
            return host;
        }
        let host = Arc::new(MockHost::new(hostname_from_uri(uri)));
        if let Ok(mut hosts) = self.hosts.write() {
            return hosts.entry(uri.to_string()).or_insert(host).clone();
        }
        host
    }
}

impl Default for MockConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MockConnector {
    fn name(&self) -> &'static str {
        "mock"
    }

    #[instrument(skip(self, options), fields(uri = %options.uri))]
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn HypervisorClient>> {
        self.connect_count.fetch_add(1, Ordering::SeqCst);

        if options.uri.trim().is_empty() {
            return Err(HypervisorError::InvalidConfig("connection URI is empty".to_string()));
        }

        let host = if self.accept_unknown {
            self.host_entry(&options.uri)
        } else {
            self.lookup(&options.uri).ok_or_else(|| {
                HypervisorError::ConnectionFailed(format!("no route to {}", options.uri))
            })?
        };
        host.connects.fetch_add(1, Ordering::SeqCst);

        if !self.connect_delay.is_zero() {
            if self.connect_delay > options.timeout {
                tokio::time::sleep(options.timeout).await;
                return Err(HypervisorError::Timeout(options.timeout.as_secs()));
            }
            tokio::time::sleep(self.connect_delay).await;
        }

        if !host.reachable.load(Ordering::SeqCst) {
            return Err(HypervisorError::ConnectionFailed(format!(
                "host {} is unreachable",
                options.uri
            )));
        }

        debug!(hostname = %host.hostname, "Mock connection opened");
        Ok(Arc::new(MockClient {
            uri: options.uri.clone(),
            host,
            status_delay: self.status_delay,
            closed: AtomicBool::new(false),
        }))
    }
}

/// A connection handed out by [`MockConnector`].
pub struct MockClient {
    uri: String,
    host: Arc<MockHost>,
    status_delay: Duration,
    closed: AtomicBool,
}

impl MockClient {
    fn ensure_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(HypervisorError::QueryFailed("connection is closed".to_string()));
        }
        if !self.host.healthy.load(Ordering::SeqCst) {
            return Err(HypervisorError::HealthCheckFailed(format!(
                "{} is not responding",
                self.host.hostname
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl HypervisorClient for MockClient {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn host_status(&self) -> Result<HostStatus> {
        if !self.status_delay.is_zero() {
            tokio::time::sleep(self.status_delay).await;
        }
        self.ensure_usable()?;

        Ok(HostStatus {
            hostname: self.host.hostname.clone(),
            hypervisor_version: "mock-1.0.0".to_string(),
            total_vms: 3,
            running_vms: 2,
            paused_vms: 0,
            shut_off_vms: 1,
            health_checks: vec![HostHealthCheck::new("hypervisor", CheckStatus::Ok, "Mock hypervisor responding")],
            checked_at: chrono::Utc::now(),
        })
    }

    async fn host_resources(&self) -> Result<HostResources> {
        self.ensure_usable()?;

        Ok(HostResources {
            cpu_model: "Mock CPU".to_string(),
            cpu_cores: 16,
            cpu_mhz: 2400,
            memory_total_bytes: 64 * 1024 * 1024 * 1024,
            memory_free_bytes: 48 * 1024 * 1024 * 1024,
        })
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(HypervisorError::CloseFailed("connection already closed".to_string()));
        }
        self.host.closes.fetch_add(1, Ordering::SeqCst);
        debug!(uri = %self.uri, "Mock connection closed");
        Ok(())
    }
}

/// Derive a display hostname from a connection URI.
fn hostname_from_uri(uri: &str) -> String {
    let rest = uri.split_once("://").map(|(_, r)| r).unwrap_or(uri);
    let authority = rest.split('/').next().unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    if host.is_empty() {
        "localhost".to_string()
    } else {
        host.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_and_status() {
        let connector = MockConnector::new();
        let client = connector
            .connect(&ConnectOptions::new("qemu+ssh://root@kvm-01/system"))
            .await
            .unwrap();

        let status = client.host_status().await.unwrap();
        assert_eq!(status.hostname, "kvm-01");
        assert_eq!(status.total_vms, 3);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_empty_uri_is_rejected() {
        let connector = MockConnector::new();
        let err = connector.connect(&ConnectOptions::new("")).await.err().unwrap();
        assert!(matches!(err, HypervisorError::InvalidConfig(_)));
    }

    #[tokio::test]
    async fn test_strict_rejects_unknown_hosts() {
        let connector = MockConnector::strict();
        connector.add_host("qemu+tcp://known/system", "known");

        assert!(connector.connect(&ConnectOptions::new("qemu+tcp://known/system")).await.is_ok());
        assert!(connector.connect(&ConnectOptions::new("qemu+tcp://other/system")).await.is_err());
    }

    #[tokio::test]
    async fn test_unhealthy_host_fails_probe() {
        let connector = MockConnector::new();
        let client = connector.connect(&ConnectOptions::new("qemu:///system")).await.unwrap();

        connector.set_healthy("qemu:///system", false);
        let err = client.host_status().await.unwrap_err();
        assert!(matches!(err, HypervisorError::HealthCheckFailed(_)));

        connector.set_healthy("qemu:///system", true);
        assert!(client.host_status().await.is_ok());
    }

    #[tokio::test]
    async fn test_closed_client_rejects_calls() {
        let connector = MockConnector::new();
        let client = connector.connect(&ConnectOptions::new("qemu:///system")).await.unwrap();

        client.close().await.unwrap();
        assert!(client.host_status().await.is_err());
        assert!(client.close().await.is_err());
        assert_eq!(connector.closes_of("qemu:///system"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_honors_timeout() {
        let connector = MockConnector::new().with_connect_delay(Duration::from_secs(60));
        let options = ConnectOptions::new("qemu:///system").with_timeout(Duration::from_secs(5));

        let err = connector.connect(&options).await.err().unwrap();
        assert_eq!(err, HypervisorError::Timeout(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_delay_answers_late() {
        let connector = MockConnector::new().with_status_delay(Duration::from_secs(3));
        let client = connector.connect(&ConnectOptions::new("mock://slow")).await.unwrap();

        let started = tokio::time::Instant::now();
        client.host_status().await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(3));
    }

    #[test]
    fn test_hostname_from_uri() {
        assert_eq!(hostname_from_uri("qemu:///system"), "localhost");
        assert_eq!(hostname_from_uri("qemu+ssh://admin@node7:22/system"), "node7");
        assert_eq!(hostname_from_uri("mock://lab-3"), "lab-3");
    }
}
