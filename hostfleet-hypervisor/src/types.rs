//! Type definitions for host connections and host status.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default connect timeout when a host does not specify one.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// =============================================================================
// CONNECTION
// =============================================================================

/// Parameters for opening a connection to a hypervisor host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Connection URI (e.g. `qemu:///system`, `qemu+ssh://root@host/system`)
    pub uri: String,
    /// Storage pool holding installation ISOs
    pub iso_pool: String,
    /// Storage pool holding VM templates
    pub template_pool: String,
    /// Upper bound for establishing the connection
    pub timeout: Duration,
}

impl ConnectOptions {
    /// Create options for a URI with default pools and timeout.
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            iso_pool: String::new(),
            template_pool: String::new(),
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Set the ISO and template pool names.
    pub fn with_pools(mut self, iso_pool: impl Into<String>, template_pool: impl Into<String>) -> Self {
        self.iso_pool = iso_pool.into();
        self.template_pool = template_pool.into();
        self
    }

    /// Set the connect timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

// =============================================================================
// HOST STATUS
// =============================================================================

/// Summary of a hypervisor host, used both for display and as a liveness probe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostStatus {
    pub hostname: String,
    pub hypervisor_version: String,
    pub total_vms: u32,
    pub running_vms: u32,
    pub paused_vms: u32,
    pub shut_off_vms: u32,
    pub health_checks: Vec<HostHealthCheck>,
    pub checked_at: DateTime<Utc>,
}

/// Result of a single host-side check (libvirtd reachable, pools present, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostHealthCheck {
    pub name: String,
    pub status: CheckStatus,
    pub message: String,
}

impl HostHealthCheck {
    pub fn new(name: impl Into<String>, status: CheckStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status,
            message: message.into(),
        }
    }
}

/// Outcome of a host-side check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Ok,
    Warning,
    Error,
}

/// Physical resources of a hypervisor host.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResources {
    /// CPU model string
    pub cpu_model: String,
    /// Logical CPUs
    pub cpu_cores: u32,
    /// CPU frequency in MHz
    pub cpu_mhz: u32,
    /// Total memory in bytes
    pub memory_total_bytes: u64,
    /// Free memory in bytes
    pub memory_free_bytes: u64,
}
