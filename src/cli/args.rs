//! Command line argument parsing
//!
//! Subcommands:
//! - `up`: Start a development environment from a built image
//! - `buildkitd`: Start the build daemon
//! - `destroy`, `pause`, `resume`: Lifecycle of an existing environment
//! - `ls`, `images`: List managed containers and images
//! - `info`, `gpu`: Query the container host
//! - `exec`: Run a detached command in an environment
//! - `load`: Load an image archive
//! - `show-config`: Show configuration discovery information

use crate::container::{ContainerError, EnvdRequest, ServiceFlags};
use crate::env;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "envd")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Manage development environment containers and their build daemon")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Enable debug logging
    #[arg(long, global = true)]
    pub debug: bool,

    /// Configuration file path
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start a development environment
    Up(UpArgs),
    /// Start the build daemon
    Buildkitd {
        /// Container name
        #[arg(long, default_value = "envd_buildkitd")]
        name: String,
        /// Image to run, defaults to the configured buildkitd image
        #[arg(long)]
        image: Option<String>,
        /// Registry mirror for docker.io
        #[arg(long)]
        mirror: Option<String>,
    },
    /// Kill and remove an environment
    Destroy {
        /// Environment name
        name: String,
    },
    /// Pause an environment
    Pause {
        /// Environment name
        name: String,
    },
    /// Resume a paused environment
    Resume {
        /// Environment name
        name: String,
    },
    /// List managed containers
    Ls,
    /// List managed images
    Images,
    /// Show container host information
    Info,
    /// Check whether the host has the nvidia runtime
    Gpu,
    /// Run a detached command inside an environment
    Exec {
        /// Environment name
        name: String,
        /// Command and arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Load an image archive into the host
    Load {
        /// Path to the tar archive
        path: PathBuf,
        /// Suppress progress output
        #[arg(short, long)]
        quiet: bool,
    },
    /// Show configuration discovery information
    ShowConfig {
        /// Write a default user configuration file
        #[arg(long)]
        init: bool,
    },
}

#[derive(Debug, clap::Args)]
pub struct UpArgs {
    /// Image tag to run
    #[arg(short, long)]
    pub tag: String,
    /// Environment name, defaults to the build context directory name
    #[arg(short, long)]
    pub name: Option<String>,
    /// Build context mounted as the working directory
    #[arg(short = 'p', long, default_value = ".")]
    pub path: PathBuf,
    /// Number of GPUs to request; enables GPU support when greater than zero
    #[arg(long, default_value_t = 0)]
    pub gpus: u32,
    /// Host port for sshd, allocated when omitted
    #[arg(long)]
    pub ssh_port: Option<u16>,
    /// Publish the jupyter service
    #[arg(long)]
    pub jupyter: bool,
    /// Publish the rstudio server
    #[arg(long)]
    pub rstudio: bool,
    /// Extra bind mount as host_path:container_path (repeatable)
    #[arg(short = 'v', long = "volume", value_name = "HOST:CONTAINER")]
    pub volumes: Vec<String>,
    /// Environment variable as KEY=VALUE (repeatable)
    #[arg(short, long = "env", value_name = "KEY=VALUE")]
    pub env: Vec<String>,
    /// Readiness timeout in seconds, defaults to the configured timeout
    #[arg(long)]
    pub timeout: Option<u64>,
}

impl UpArgs {
    /// Environment name: explicit, or the build context's directory name.
    pub fn env_name(&self) -> Result<String, ContainerError> {
        if let Some(name) = &self.name {
            return Ok(name.clone());
        }
        let dir = crate::container::spec::working_dir_for(env::container::HOME_PREFIX, &self.path)?;
        Ok(dir
            .rsplit('/')
            .next()
            .unwrap_or(dir.as_str())
            .to_string())
    }

    /// Build the environment request with an already allocated ssh port.
    pub fn to_request(&self, ssh_host_port: u16) -> Result<EnvdRequest, ContainerError> {
        let mut builder = EnvdRequest::builder()
            .tag(&self.tag)
            .name(self.env_name()?)
            .build_context(&self.path)
            .gpus(self.gpus > 0, self.gpus)
            .ssh_host_port(ssh_host_port)
            .services(ServiceFlags {
                jupyter: self.jupyter,
                rstudio: self.rstudio,
            })
            .mounts(self.volumes.iter().cloned());

        for pair in &self.env {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                ContainerError::Validation(format!(
                    "invalid env {:?}, expected KEY=VALUE",
                    pair
                ))
            })?;
            builder = builder.env(key, value);
        }
        builder.build()
    }
}
