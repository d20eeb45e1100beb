//! # hostfleet Hypervisor
//!
//! Client abstraction for the hypervisor hosts managed by hostfleet.
//!
//! The connection pool only needs three things from a host: open a
//! connection, ask it for a status summary, and close it. This crate
//! defines those capabilities and ships two backends:
//! - **Libvirt/QEMU** (feature `libvirt`) - production backend
//! - **Mock** - in-memory hosts for tests and `--dev` mode
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐
//! │      Connector trait         │  connect(options) -> client
//! └──────────────┬───────────────┘
//!                │
//!        ┌───────┴────────┐
//!        ▼                ▼
//! ┌──────────────┐  ┌──────────────┐
//! │   Libvirt    │  │     Mock     │
//! │  Connector   │  │  Connector   │
//! └──────────────┘  └──────────────┘
//!        │                │
//!        ▼                ▼
//!   HypervisorClient (host_status, host_resources, close)
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hostfleet_hypervisor::{ConnectOptions, Connector, MockConnector};
//!
//! let connector = MockConnector::new();
//! let client = connector.connect(&ConnectOptions::new("qemu:///system")).await?;
//! let status = client.host_status().await?;
//! client.close().await?;
//! ```

pub mod error;
pub mod traits;
pub mod types;
pub mod mock;
pub mod libvirt;

pub use error::{HypervisorError, Result};
pub use traits::{Connector, HypervisorClient};
pub use types::*;
pub use mock::{MockClient, MockConnector};

// Re-export libvirt backend when available
#[cfg(feature = "libvirt")]
pub use libvirt::{LibvirtClient, LibvirtConnector};
