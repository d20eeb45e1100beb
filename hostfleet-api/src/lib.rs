//! # hostfleet Daemon
//!
//! REST front end for a fleet of hypervisor hosts. Hosts are kept in a
//! persistent registry; live connections to them are owned by a
//! [`hostfleet_pool::ConnectionPool`] shared by every request handler.
//!
//! ## Usage
//! ```bash
//! hostfleetd --config /etc/hostfleet/hostfleet.yaml
//! hostfleetd --dev --registry-path ./servers.json
//! ```

pub mod cli;
pub mod config;
pub mod http_server;
pub mod registry;
pub mod server;
