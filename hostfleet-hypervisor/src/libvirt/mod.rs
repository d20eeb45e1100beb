//! Libvirt hypervisor backend.
//!
//! This module provides the production connector using libvirt/QEMU.
//! It requires the `libvirt` feature to be enabled and the system to have
//! libvirt installed.

#[cfg(feature = "libvirt")]
mod backend;

#[cfg(feature = "libvirt")]
pub use backend::{LibvirtClient, LibvirtConnector};

