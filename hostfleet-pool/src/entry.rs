//! Per-host connection state and the read-only snapshots handed to callers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hostfleet_hypervisor::HypervisorClient;
use serde::Serialize;
use tokio::time::Instant;

use crate::host::HostConfig;

/// Monotonic pool clock.
///
/// Timestamps are stored as nanoseconds since the pool was created so they
/// fit in an atomic and can be bumped under a shared lock. The wall-clock
/// anchor turns them back into `DateTime<Utc>` for snapshots.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    epoch: Instant,
    epoch_wall: DateTime<Utc>,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
            epoch_wall: Utc::now(),
        }
    }

    pub(crate) fn now_nanos(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    pub(crate) fn to_wall(self, nanos: u64) -> DateTime<Utc> {
        self.epoch_wall + chrono::Duration::nanoseconds(nanos as i64)
    }
}

/// Connection state for one host. Owned exclusively by the pool map.
pub(crate) struct ConnectionEntry {
    pub(crate) host_id: String,
    /// `Some` whenever `connected` is true
    pub(crate) client: Option<Arc<dyn HypervisorClient>>,
    pub(crate) connected: bool,
    pub(crate) last_error: Option<String>,
    pub(crate) host: HostConfig,
    last_used: AtomicU64,
}

impl ConnectionEntry {
    pub(crate) fn connected(host: &HostConfig, client: Arc<dyn HypervisorClient>, now: u64) -> Self {
        Self {
            host_id: host.id.clone(),
            client: Some(client),
            connected: true,
            last_error: None,
            host: host.clone(),
            last_used: AtomicU64::new(now),
        }
    }

    pub(crate) fn failed(host: &HostConfig, reason: String, now: u64) -> Self {
        Self {
            host_id: host.id.clone(),
            client: None,
            connected: false,
            last_error: Some(reason),
            host: host.clone(),
            last_used: AtomicU64::new(now),
        }
    }

    /// Record a use. Never moves the timestamp backwards.
    pub(crate) fn touch(&self, now: u64) {
        self.last_used.fetch_max(now, Ordering::AcqRel);
    }

    pub(crate) fn last_used(&self) -> u64 {
        self.last_used.load(Ordering::Acquire)
    }

    pub(crate) fn idle_for(&self, now: u64) -> Duration {
        Duration::from_nanos(now.saturating_sub(self.last_used()))
    }

    /// The live client, if this entry currently holds `client`.
    pub(crate) fn holds(&self, client: &Arc<dyn HypervisorClient>) -> bool {
        self.client
            .as_ref()
            .map(|current| Arc::ptr_eq(current, client))
            .unwrap_or(false)
    }

    /// Mark the entry dead and hand back its client for closing.
    pub(crate) fn mark_failed(&mut self, reason: String) -> Option<Arc<dyn HypervisorClient>> {
        self.connected = false;
        self.last_error = Some(reason);
        self.client.take()
    }

    pub(crate) fn snapshot(&self, clock: Clock) -> ConnectionSnapshot {
        let now = clock.now_nanos();
        ConnectionSnapshot {
            host_id: self.host_id.clone(),
            host: self.host.clone(),
            connected: self.connected,
            last_used: clock.to_wall(self.last_used()),
            idle_secs: self.idle_for(now).as_secs(),
            last_error: self.last_error.clone(),
            client: self.client.clone(),
        }
    }
}

/// Point-in-time copy of a pool entry.
///
/// Changing a snapshot has no effect on the pool. The client handle, when
/// present, is the same live connection the pool hands out.
#[derive(Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub host_id: String,
    pub host: HostConfig,
    pub connected: bool,
    pub last_used: DateTime<Utc>,
    pub idle_secs: u64,
    pub last_error: Option<String>,
    #[serde(skip)]
    pub client: Option<Arc<dyn HypervisorClient>>,
}

impl fmt::Debug for ConnectionSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSnapshot")
            .field("host_id", &self.host_id)
            .field("uri", &self.host.uri)
            .field("connected", &self.connected)
            .field("last_used", &self.last_used)
            .field("idle_secs", &self.idle_secs)
            .field("last_error", &self.last_error)
            .field("has_client", &self.client.is_some())
            .finish()
    }
}
