//! Development environment container lifecycle.
//!
//! This module assembles creation specs, talks to the container host through
//! the [`LifecycleClient`] capability trait, waits for containers to become
//! ready and interprets host failures for the idempotent operations.
//!
//! ## Architecture
//!
//! - [`port`]: free host port allocation
//! - [`spec`]: environment request and creation spec assembly
//! - [`client`]: capability surface over the container host
//! - [`classify`]: host error text to outcome mapping
//! - [`readiness`]: polling wait until a container is running
//! - [`lifecycle`]: start, destroy, pause and resume orchestration
//! - `docker`: bollard adapter for a real daemon
//! - [`fake`]: deterministic in-memory host
//!
//! ## Usage
//!
//! ```rust,no_run
//! use envd::config::EnvdConfig;
//! use envd::container::{DockerClient, EnvdRequest, LifecycleManager, free_port};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let client = DockerClient::new().await?;
//!     let manager = LifecycleManager::new(Arc::new(client), EnvdConfig::default());
//!
//!     let request = EnvdRequest::builder()
//!         .tag("my-env:dev")
//!         .name("my-env")
//!         .build_context("/home/me/project")
//!         .ssh_host_port(free_port()?)
//!         .jupyter(true)
//!         .build()?;
//!
//!     let env = manager.start_envd(&request, None).await?;
//!     println!("{} at {:?}", env.name, env.address);
//!
//!     manager.destroy(&env.name).await?;
//!     Ok(())
//! }
//! ```

pub mod classify;
pub mod client;
#[cfg(feature = "docker")]
mod docker;
pub mod fake;
pub mod lifecycle;
pub mod port;
pub mod readiness;
pub mod spec;

pub use classify::{HostErrorKind, classify};
pub use client::{
    ContainerDetails, ContainerSummary, CreatedContainer, DaemonInfo, HostError, HostResult,
    ImageInfo, LifecycleClient, ListFilter,
};
#[cfg(feature = "docker")]
pub use docker::DockerClient;
pub use fake::{FakeHost, HostOp};
pub use lifecycle::{EnvdIdentity, LifecycleManager};
pub use port::{LocalPortAllocator, PortAllocator, free_port};
pub use readiness::{ReadinessWaiter, WaitState};
pub use spec::{
    ContainerSpec, EnvdRequest, EnvdRequestBuilder, GpuDeviceRequest, MountKind, MountSpec,
    PortBinding, ServiceFlags, SpecBuilder,
};

use std::time::Duration;

/// Container lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    /// Malformed request, e.g. a bad mount option
    #[error("Validation error: {0}")]
    Validation(String),

    /// No usable free host port
    #[error("Resource allocation error: {0}")]
    ResourceAllocation(String),

    /// The daemon cannot be reached
    #[error("Cannot reach the container host: {0}")]
    HostUnreachable(String),

    /// Container not found
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Image not found
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// A requested host port is already bound
    #[error("Port conflict: {0}")]
    PortConflict(String),

    /// Readiness wait exceeded its deadline
    #[error("timeout after {elapsed:?}: container {name} did not start")]
    Timeout { name: String, elapsed: Duration },

    /// Readiness wait cancelled by the caller
    #[error("waiting for container {0} was cancelled")]
    Cancelled(String),

    /// Unclassified host failure
    #[error("{context}: {source}")]
    Host {
        context: String,
        #[source]
        source: HostError,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl ContainerError {
    /// Wrap a raw host failure with operation context.
    pub fn host<S: Into<String>>(context: S, source: HostError) -> Self {
        Self::Host {
            context: context.into(),
            source,
        }
    }
}

/// Result type for container operations.
pub type Result<T> = std::result::Result<T, ContainerError>;
