//! Host configuration consumed by the pool.

use std::time::Duration;

use hostfleet_hypervisor::{ConnectOptions, DEFAULT_CONNECT_TIMEOUT};
use serde::{Deserialize, Serialize};

/// Connection-relevant view of a registered host.
///
/// The pool copies this into each entry and never mutates it; a changed
/// configuration is applied through `refresh_connection`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    /// Stable identifier, key of the pool map
    pub id: String,
    /// Display name used in errors and logs
    pub name: String,
    /// Hypervisor connection URI
    pub uri: String,
    /// ISO storage pool name
    #[serde(default)]
    pub iso_pool: String,
    /// Template storage pool name
    #[serde(default)]
    pub template_pool: String,
    /// Connect timeout in seconds (0 = backend default)
    #[serde(default)]
    pub timeout_secs: u64,
}

impl HostConfig {
    pub fn new(id: impl Into<String>, name: impl Into<String>, uri: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            uri: uri.into(),
            iso_pool: String::new(),
            template_pool: String::new(),
            timeout_secs: 0,
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }

    pub fn with_pools(mut self, iso_pool: impl Into<String>, template_pool: impl Into<String>) -> Self {
        self.iso_pool = iso_pool.into();
        self.template_pool = template_pool.into();
        self
    }

    /// Options handed to the connector.
    pub fn connect_options(&self) -> ConnectOptions {
        let timeout = if self.timeout_secs == 0 {
            DEFAULT_CONNECT_TIMEOUT
        } else {
            Duration::from_secs(self.timeout_secs)
        };

        ConnectOptions::new(self.uri.clone())
            .with_pools(self.iso_pool.clone(), self.template_pool.clone())
            .with_timeout(timeout)
    }
}
