//! Host port allocation.
//!
//! Ports are found by binding an ephemeral socket and releasing it
//! immediately; the real bind happens later inside the daemon, so another
//! process may claim the port in between. Callers that hit
//! [`ContainerError::PortConflict`] are expected to allocate again.

use crate::container::{ContainerError, Result};
use std::net::{Ipv4Addr, TcpListener};
use tracing::debug;

/// Source of free host-side TCP ports.
pub trait PortAllocator: Send + Sync {
    /// Find a port that is free right now.
    fn allocate(&self) -> Result<u16>;
}

/// Allocator asking the operating system for an ephemeral loopback port.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalPortAllocator;

impl PortAllocator for LocalPortAllocator {
    fn allocate(&self) -> Result<u16> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).map_err(|e| {
            ContainerError::ResourceAllocation(format!("failed to get a free port: {}", e))
        })?;
        let port = listener
            .local_addr()
            .map_err(|e| {
                ContainerError::ResourceAllocation(format!("failed to get a free port: {}", e))
            })?
            .port();
        debug!(port, "allocated free host port");
        Ok(port)
    }
}

/// Allocate a free port with the default allocator.
pub fn free_port() -> Result<u16> {
    LocalPortAllocator.allocate()
}
