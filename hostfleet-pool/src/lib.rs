//! # hostfleet Pool
//!
//! Concurrent connection pool for a fleet of hypervisor hosts.
//!
//! The pool keeps at most one live connection per host-id, creates
//! connections on demand, closes connections that sit idle too long and
//! periodically probes active ones so dead hosts are noticed before a
//! caller trips over them.
//!
//! ## Concurrency
//!
//! - The entry map sits behind a tokio `RwLock`. Lookups on the hot path take
//!   the read lock only; `last_used` is an atomic so it can be bumped there.
//! - Connection creation is single-flight per host-id: concurrent callers
//!   for the same host share one connect attempt and its result.
//! - No lock is held across a network call. Health probes run on a snapshot
//!   and their results are applied to the live entry only if it still holds
//!   the probed client.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use hostfleet_hypervisor::MockConnector;
//! use hostfleet_pool::{ConnectionPool, HostConfig, PoolConfig};
//!
//! let pool = ConnectionPool::new(PoolConfig::default(), Arc::new(MockConnector::new()));
//! let host = HostConfig::new("kvm-01", "Rack 1 / KVM 01", "qemu+ssh://root@kvm-01/system");
//!
//! let client = pool.get_connection(&host).await?;
//! let status = client.host_status().await?;
//!
//! pool.close_all().await;
//! ```

mod config;
mod entry;
mod error;
mod gate;
mod host;
mod pool;

pub use config::{PoolConfig, DEFAULT_CLEANUP_INTERVAL, DEFAULT_HEALTH_CHECK_INTERVAL, DEFAULT_MAX_IDLE};
pub use entry::ConnectionSnapshot;
pub use error::{PoolError, Result};
pub use host::HostConfig;
pub use pool::{ConnectionPool, HealthCheckSummary};
