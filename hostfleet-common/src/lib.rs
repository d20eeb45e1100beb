//! # hostfleet Common
//!
//! Shared utilities for the hostfleet binaries.
//!
//! ## Logging
//!
//! ```rust,ignore
//! use hostfleet_common::{init_logging, LogFormat};
//!
//! init_logging("info", LogFormat::Pretty).unwrap();
//! tracing::info!(host_id = "h1", "Connected to host");
//! ```

pub mod logging;

pub use logging::{init_logging, LogFormat};
