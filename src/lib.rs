//! # envd
//!
//! Lifecycle management for development environment containers and the
//! build daemon container that produces their images.
//!
//! ## Architecture Overview
//!
//! - **[`container`]**: spec assembly, port allocation, host adapters,
//!   readiness waits and the idempotent destroy/pause/resume operations
//! - **[`config`]**: configuration file discovery and loading
//! - **[`env`]**: fixed names, label keys and default values
//! - **[`cli`]**: command line argument parsing
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use envd::config::EnvdConfig;
//! use envd::container::{EnvdRequest, FakeHost, LifecycleManager};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = LifecycleManager::new(Arc::new(FakeHost::new()), EnvdConfig::default());
//!
//!     let request = EnvdRequest::builder()
//!         .tag("img")
//!         .name("c1")
//!         .build_context("/proj")
//!         .ssh_host_port(2222)
//!         .mount("/host/data:/data")
//!         .build()?;
//!
//!     let spec = manager.build_spec(&request)?;
//!     assert_eq!(spec.working_dir.as_deref(), Some("/home/envd/proj"));
//!     Ok(())
//! }
//! ```

/// Command line argument parsing.
pub mod cli;

/// Configuration discovery and loading.
pub mod config;

/// Container lifecycle: specs, host adapters, readiness and error handling.
pub mod container;

/// Constants and path utilities.
pub mod env;

pub use config::{ConfigDiscovery, ConfigError, EnvdConfig};
pub use container::{ContainerError, EnvdIdentity, EnvdRequest, LifecycleManager};
