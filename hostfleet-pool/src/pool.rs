//! The multi-host connection pool.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::join_all;
use hostfleet_hypervisor::{Connector, HypervisorClient};
use serde::Serialize;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, instrument, warn};

use crate::config::PoolConfig;
use crate::entry::{Clock, ConnectionEntry, ConnectionSnapshot};
use crate::error::{PoolError, Result};
use crate::gate::{CreationGate, GateGuard};
use crate::host::HostConfig;

/// Outcome of one health-check pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HealthCheckSummary {
    /// Connected entries probed
    pub checked: usize,
    /// Probes that succeeded and were applied
    pub healthy: usize,
    /// Entries downgraded to disconnected
    pub failed: usize,
    /// Results dropped because the entry was closed or replaced meanwhile
    pub skipped: usize,
}

/// Owns live connections to every hypervisor host in the fleet.
///
/// Hands out shared client handles, creates connections lazily, evicts idle
/// ones and probes active ones from a background maintenance task. The task
/// starts in [`ConnectionPool::new`] and stops in [`close_all`](Self::close_all)
/// (or when the pool is dropped, since dropping closes the shutdown channel).
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
    shutdown_tx: broadcast::Sender<()>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

struct PoolInner {
    connector: Arc<dyn Connector>,
    config: PoolConfig,
    connections: RwLock<HashMap<String, ConnectionEntry>>,
    gates: Mutex<HashMap<String, Arc<CreationGate>>>,
    clock: Clock,
    closed: AtomicBool,
}

/// A connected entry captured for probing outside the lock.
struct ProbeTarget {
    host_id: String,
    host_name: String,
    client: Arc<dyn HypervisorClient>,
}

impl ConnectionPool {
    /// Create a pool and start its maintenance task.
    ///
    /// # Panics
    /// Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Self {
        let config = config.normalized();

        let inner = Arc::new(PoolInner {
            connector,
            config,
            connections: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            clock: Clock::new(),
            closed: AtomicBool::new(false),
        });

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(maintenance_loop(Arc::clone(&inner), shutdown_rx));

        info!(
            backend = inner.connector.name(),
            max_idle_secs = config.max_idle.as_secs(),
            health_check_interval_secs = config.health_check_interval.as_secs(),
            cleanup_interval_secs = config.cleanup_interval.as_secs(),
            "Connection pool started"
        );

        Self {
            inner,
            shutdown_tx,
            maintenance: Mutex::new(Some(handle)),
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Get a live client for `host`, connecting if needed.
    ///
    /// A cached connected entry is returned without any connection attempt.
    /// A missing or disconnected entry is (re)created, so a host that failed
    /// its last health check reconnects on the next call.
    #[instrument(skip(self, host), fields(host_id = %host.id))]
    pub async fn get_connection(&self, host: &HostConfig) -> Result<Arc<dyn HypervisorClient>> {
        self.ensure_open()?;
        validate_host(host)?;

        if let Some(client) = self.inner.live_client(&host.id).await {
            return Ok(client);
        }

        self.create_connection(host).await
    }

    /// Connect to `host` and install the resulting entry.
    ///
    /// At most one attempt per host-id is in flight. Callers queued behind a
    /// successful attempt with the same configuration get its client; callers
    /// queued behind a failed one get its error. An entry connected with a
    /// different configuration is replaced. A failure still installs an entry
    /// carrying the error.
    #[instrument(skip(self, host), fields(host_id = %host.id))]
    pub async fn create_connection(&self, host: &HostConfig) -> Result<Arc<dyn HypervisorClient>> {
        self.ensure_open()?;
        validate_host(host)?;

        let gate = self.inner.gate_for(&host.id);
        let ticket = gate.ticket();
        let attempt = gate.enter(ticket).await;

        if let Some(err) = attempt.failure_while_waiting(host) {
            debug!(error = %err, "Concurrent connection attempt failed");
            return Err(err);
        }

        // Double-check: the attempt we queued behind may have succeeded.
        if let Some(client) = self.inner.live_client_for(host).await {
            return Ok(client);
        }

        self.connect_holding_gate(host, attempt).await
    }

    /// Connect with `host` and install the outcome. The caller holds the gate
    /// for `host.id`; it is released when the outcome is published.
    async fn connect_holding_gate(
        &self,
        host: &HostConfig,
        attempt: GateGuard<'_>,
    ) -> Result<Arc<dyn HypervisorClient>> {
        if let Err(e) = self.ensure_open() {
            attempt.finish(host, Some(e.clone()));
            return Err(e);
        }

        info!(host_name = %host.name, uri = %host.uri, "Creating new connection to host");

        let outcome = self.inner.connector.connect(&host.connect_options()).await;
        let now = self.inner.clock.now_nanos();

        match outcome {
            Ok(client) => {
                let replaced = {
                    let mut connections = self.inner.connections.write().await;
                    if self.is_closed() {
                        drop(connections);
                        close_client(&host.id, client, "pool closed during connect").await;
                        attempt.finish(host, Some(PoolError::Closed));
                        return Err(PoolError::Closed);
                    }
                    connections.insert(
                        host.id.clone(),
                        ConnectionEntry::connected(host, Arc::clone(&client), now),
                    )
                };
                self.inner.release_replaced(replaced, &client).await;
                attempt.finish(host, None);

                info!(host_name = %host.name, "Successfully connected to host");
                Ok(client)
            }
            Err(e) => {
                let reason = e.to_string();
                error!(
                    host_name = %host.name,
                    uri = %host.uri,
                    error = %reason,
                    "Failed to create hypervisor connection"
                );

                let replaced = {
                    let mut connections = self.inner.connections.write().await;
                    if self.is_closed() {
                        None
                    } else {
                        connections.insert(host.id.clone(), ConnectionEntry::failed(host, reason.clone(), now))
                    }
                };
                if let Some(entry) = replaced {
                    if let Some(client) = entry.client {
                        close_client(&host.id, client, "replaced by failed attempt").await;
                    }
                }

                let err = PoolError::ConnectionFailed {
                    host: display_name(host),
                    reason,
                };
                attempt.finish(host, Some(err.clone()));
                Err(err)
            }
        }
    }

    /// Close and forget the connection for `host_id`.
    ///
    /// Waits for an in-flight connect to the same host to finish first, so
    /// the entry it installs is the one removed. Close failures are logged;
    /// the entry is removed regardless.
    #[instrument(skip(self))]
    pub async fn close_connection(&self, host_id: &str) -> Result<()> {
        self.ensure_open()?;

        let removed = {
            let gate = self.inner.gate_for(host_id);
            let _held = gate.enter(gate.ticket()).await;
            self.inner.connections.write().await.remove(host_id)
        };
        self.inner.prune_gate(host_id);

        let entry = removed.ok_or_else(|| PoolError::ConnectionNotFound(host_id.to_string()))?;
        if let Some(client) = entry.client {
            close_client(host_id, client, "explicit close").await;
        }

        info!("Closed connection to host");
        Ok(())
    }

    /// Drop any existing connection for `host_id` and connect again with `host`.
    ///
    /// Used when a host's configuration changes or to retry after a failure.
    /// The close and the new connect happen under the host's gate, so an
    /// attempt already in flight finishes first and is then replaced.
    #[instrument(skip(self, host))]
    pub async fn refresh_connection(&self, host_id: &str, host: &HostConfig) -> Result<()> {
        if host.id != host_id {
            return Err(PoolError::InvalidHost(format!(
                "host id mismatch: {} vs {}",
                host_id, host.id
            )));
        }
        self.ensure_open()?;
        validate_host(host)?;

        let gate = self.inner.gate_for(host_id);
        let attempt = gate.enter(gate.ticket()).await;

        let previous = self.inner.connections.write().await.remove(host_id);
        if let Some(client) = previous.and_then(|entry| entry.client) {
            close_client(host_id, client, "refresh").await;
        }

        self.connect_holding_gate(host, attempt).await.map(|_| ())
    }

    /// Shut the pool down: stop maintenance, close every connection, clear
    /// the map. Later calls on the pool fail with [`PoolError::Closed`].
    ///
    /// Calling this more than once is harmless; repeat calls only log.
    pub async fn close_all(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            warn!("Connection pool already closed");
            return;
        }

        // Ignore the error: no receiver means the loop already exited.
        let _ = self.shutdown_tx.send(());

        let handle = self
            .maintenance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Maintenance task ended abnormally");
            }
        }

        let drained: Vec<ConnectionEntry> = {
            let mut connections = self.inner.connections.write().await;
            info!(connection_count = connections.len(), "Closing all connections in pool");
            connections.drain().map(|(_, entry)| entry).collect()
        };

        self.inner
            .gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        join_all(drained.into_iter().filter_map(|entry| {
            let host_id = entry.host_id;
            entry
                .client
                .map(|client| async move { close_client(&host_id, client, "shutdown").await })
        }))
        .await;

        info!("All connections closed");
    }

    /// Snapshot of every entry, keyed by host-id.
    pub async fn connection_status(&self) -> HashMap<String, ConnectionSnapshot> {
        let clock = self.inner.clock;
        self.inner
            .connections
            .read()
            .await
            .iter()
            .map(|(id, entry)| (id.clone(), entry.snapshot(clock)))
            .collect()
    }

    /// Snapshot of one entry.
    pub async fn connection_info(&self, host_id: &str) -> Option<ConnectionSnapshot> {
        let clock = self.inner.clock;
        self.inner
            .connections
            .read()
            .await
            .get(host_id)
            .map(|entry| entry.snapshot(clock))
    }

    /// Run one idle-cleanup pass now. Returns the number of evicted entries.
    pub async fn evict_idle(&self) -> usize {
        self.inner.cleanup_idle_connections().await
    }

    /// Run one health-check pass now.
    pub async fn check_health(&self) -> HealthCheckSummary {
        self.inner.perform_health_checks().await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(PoolError::Closed);
        }
        Ok(())
    }
}

impl PoolInner {
    /// Fast path: the client of a connected entry, with `last_used` bumped.
    async fn live_client(&self, host_id: &str) -> Option<Arc<dyn HypervisorClient>> {
        let connections = self.connections.read().await;
        let entry = connections.get(host_id).filter(|entry| entry.connected)?;
        let client = entry.client.clone()?;
        entry.touch(self.clock.now_nanos());
        Some(client)
    }

    /// Like [`live_client`](Self::live_client), but only for an entry
    /// connected with exactly this configuration.
    async fn live_client_for(&self, host: &HostConfig) -> Option<Arc<dyn HypervisorClient>> {
        let connections = self.connections.read().await;
        let entry = connections
            .get(&host.id)
            .filter(|entry| entry.connected && entry.host == *host)?;
        let client = entry.client.clone()?;
        entry.touch(self.clock.now_nanos());
        Some(client)
    }

    fn gate_for(&self, host_id: &str) -> Arc<CreationGate> {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(gates.entry(host_id.to_string()).or_default())
    }

    /// Forget the gate of `host_id` when nobody holds or waits on it.
    fn prune_gate(&self, host_id: &str) {
        let mut gates = self.gates.lock().unwrap_or_else(PoisonError::into_inner);
        if gates.get(host_id).is_some_and(|gate| Arc::strong_count(gate) == 1) {
            gates.remove(host_id);
        }
    }

    async fn release_replaced(&self, replaced: Option<ConnectionEntry>, current: &Arc<dyn HypervisorClient>) {
        let Some(entry) = replaced else {
            return;
        };
        if let Some(old) = entry.client {
            if !Arc::ptr_eq(&old, current) {
                close_client(&entry.host_id, old, "replaced").await;
            }
        }
    }

    /// Remove connected entries idle longer than `max_idle`.
    ///
    /// Selection and removal share one write-lock critical section so an
    /// entry touched in between cannot be evicted. Clients are closed after
    /// the lock is released.
    async fn cleanup_idle_connections(&self) -> usize {
        let now = self.clock.now_nanos();
        let max_idle = self.config.max_idle;

        let evicted: Vec<(ConnectionEntry, Duration)> = {
            let mut connections = self.connections.write().await;
            let idle: Vec<String> = connections
                .iter()
                .filter(|(_, entry)| entry.connected && entry.idle_for(now) > max_idle)
                .map(|(id, _)| id.clone())
                .collect();

            idle.into_iter()
                .filter_map(|id| connections.remove(&id))
                .map(|entry| {
                    let idle_time = entry.idle_for(now);
                    (entry, idle_time)
                })
                .collect()
        };

        let count = evicted.len();
        for (entry, idle_time) in evicted {
            self.prune_gate(&entry.host_id);
            if let Some(client) = entry.client {
                close_client(&entry.host_id, client, "idle").await;
            }
            info!(
                host_id = %entry.host_id,
                idle_secs = idle_time.as_secs(),
                "Closed idle connection"
            );
        }

        if count > 0 {
            debug!(evicted = count, "Idle cleanup finished");
        }
        count
    }

    /// Probe every connected entry.
    ///
    /// 1. Copy the connected entries under the read lock.
    /// 2. Probe them with no lock held.
    /// 3. Apply each result under the write lock to the entry as it is now,
    ///    skipping entries that were closed or now hold a different client.
    async fn perform_health_checks(&self) -> HealthCheckSummary {
        let targets: Vec<ProbeTarget> = {
            let connections = self.connections.read().await;
            connections
                .values()
                .filter(|entry| entry.connected)
                .filter_map(|entry| {
                    entry.client.as_ref().map(|client| ProbeTarget {
                        host_id: entry.host_id.clone(),
                        host_name: entry.host.name.clone(),
                        client: Arc::clone(client),
                    })
                })
                .collect()
        };

        let mut summary = HealthCheckSummary {
            checked: targets.len(),
            ..Default::default()
        };
        if targets.is_empty() {
            return summary;
        }

        let results = join_all(targets.into_iter().map(|target| async move {
            let outcome = target.client.host_status().await;
            (target, outcome)
        }))
        .await;

        for (target, outcome) in results {
            if self.closed.load(Ordering::Acquire) {
                debug!("Pool closed, dropping remaining health check results");
                break;
            }

            let dead_client = {
                let mut connections = self.connections.write().await;
                let entry = match connections.get_mut(&target.host_id) {
                    Some(entry) if entry.holds(&target.client) => entry,
                    _ => {
                        debug!(host_id = %target.host_id, "Entry changed during health check, skipping");
                        summary.skipped += 1;
                        continue;
                    }
                };

                match outcome {
                    Ok(_) => {
                        entry.connected = true;
                        entry.last_error = None;
                        summary.healthy += 1;
                        None
                    }
                    Err(e) => {
                        warn!(
                            host_id = %target.host_id,
                            host_name = %target.host_name,
                            error = %e,
                            "Health check failed for connection"
                        );
                        summary.failed += 1;
                        entry.mark_failed(e.to_string())
                    }
                }
            };

            if let Some(client) = dead_client {
                close_client(&target.host_id, client, "failed health check").await;
            }
        }

        debug!(
            checked = summary.checked,
            healthy = summary.healthy,
            failed = summary.failed,
            skipped = summary.skipped,
            "Health check pass finished"
        );
        summary
    }
}

/// Background loop: idle cleanup and health checks on independent timers.
async fn maintenance_loop(inner: Arc<PoolInner>, mut shutdown: broadcast::Receiver<()>) {
    let cleanup_every = inner.config.cleanup_interval;
    let health_every = inner.config.health_check_interval;

    let mut cleanup = interval_at(Instant::now() + cleanup_every, cleanup_every);
    let mut health = interval_at(Instant::now() + health_every, health_every);
    cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
    health.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break,
            _ = cleanup.tick() => {
                inner.cleanup_idle_connections().await;
            }
            _ = health.tick() => {
                tokio::select! {
                    biased;

                    _ = shutdown.recv() => break,
                    _ = inner.perform_health_checks() => {}
                }
            }
        }
    }

    info!("Stopping connection pool maintenance loop");
}

async fn close_client(host_id: &str, client: Arc<dyn HypervisorClient>, reason: &str) {
    if let Err(e) = client.close().await {
        error!(host_id = %host_id, reason = reason, error = %e, "Error closing connection");
    }
}

fn validate_host(host: &HostConfig) -> Result<()> {
    if host.id.trim().is_empty() {
        return Err(PoolError::InvalidHost("host id must not be empty".to_string()));
    }
    Ok(())
}

fn display_name(host: &HostConfig) -> String {
    if host.name.is_empty() {
        host.id.clone()
    } else {
        host.name.clone()
    }
}
