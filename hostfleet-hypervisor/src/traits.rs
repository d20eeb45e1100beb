//! Core hypervisor client traits.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::types::*;

/// Opens connections to hypervisor hosts.
///
/// One connector serves every host in the fleet; each successful call yields
/// an independent [`HypervisorClient`]. Implementations must honor
/// [`ConnectOptions::timeout`], callers add no timeout of their own.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Name of the backend (e.g. "libvirt", "mock").
    fn name(&self) -> &'static str;

    /// Open a connection to the host described by `options`.
    async fn connect(&self, options: &ConnectOptions) -> Result<Arc<dyn HypervisorClient>>;
}

/// A live connection to a single hypervisor host.
///
/// Handles are shared between request handlers and the connection pool, so
/// every method takes `&self`. After [`close`](Self::close) returns, all
/// other calls fail.
#[async_trait]
pub trait HypervisorClient: Send + Sync {
    /// URI this client is connected to.
    fn uri(&self) -> &str;

    /// Lightweight host summary. Doubles as the pool's health probe.
    async fn host_status(&self) -> Result<HostStatus>;

    /// Physical resources of the host.
    async fn host_resources(&self) -> Result<HostResources>;

    /// Release the connection.
    async fn close(&self) -> Result<()>;
}
