//! Container creation specifications.
//!
//! [`EnvdRequest`] is the logical request for a development environment.
//! [`SpecBuilder`] turns it into a concrete [`ContainerSpec`]: bind mounts,
//! loopback port bindings, labels recording the assigned host ports and an
//! optional GPU device request.

use crate::config::EnvdConfig;
use crate::container::{ContainerError, PortAllocator, Result};
use crate::env;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::IpAddr;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Kind of a container mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Bind,
}

/// A host directory made visible inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    /// Host-absolute source path
    pub source: String,
    /// Container-absolute target path
    pub target: String,
    pub kind: MountKind,
}

impl MountSpec {
    pub fn bind<S: Into<String>, T: Into<String>>(source: S, target: T) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            kind: MountKind::Bind,
        }
    }

    /// Parse a `hostPath:containerPath` mount option.
    pub fn parse(option: &str) -> Result<Self> {
        let parts: Vec<&str> = option.split(':').collect();
        match parts.as_slice() {
            [source, target] if !source.is_empty() && !target.is_empty() => {
                Ok(Self::bind(*source, *target))
            }
            _ => Err(ContainerError::Validation(format!(
                "invalid mount option {:?}: expected hostPath:containerPath",
                option
            ))),
        }
    }
}

/// Host-side binding of a container port.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PortBinding {
    pub container_port: u16,
    pub host_ip: String,
    pub host_port: u16,
}

/// Request for accelerator devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GpuDeviceRequest {
    pub driver: String,
    pub capabilities: Vec<String>,
    pub count: u32,
}

impl GpuDeviceRequest {
    /// NVIDIA request with the full capability set.
    pub fn nvidia(count: u32) -> Self {
        Self {
            driver: env::gpu::DRIVER.to_string(),
            capabilities: env::gpu::CAPABILITIES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            count,
        }
    }
}

/// Optional services declared by the environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServiceFlags {
    pub jupyter: bool,
    pub rstudio: bool,
}

/// Concrete container creation specification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Image tag
    pub image: String,
    /// Container name, unique on the host
    pub name: String,
    pub user: Option<String>,
    /// Container-absolute working directory
    pub working_dir: Option<String>,
    pub entrypoint: Option<Vec<String>>,
    /// `KEY=value` entries
    pub env: Vec<String>,
    pub mounts: Vec<MountSpec>,
    pub port_bindings: Vec<PortBinding>,
    /// Container ports marked as exposed
    pub exposed_ports: BTreeSet<u16>,
    pub labels: BTreeMap<String, String>,
    pub device_request: Option<GpuDeviceRequest>,
    pub privileged: bool,
}

impl ContainerSpec {
    /// Bare spec for `image` named `name`.
    pub fn new<I: Into<String>, N: Into<String>>(image: I, name: N) -> Self {
        Self {
            image: image.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    /// Host port bound to `container_port`, if any.
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.port_bindings
            .iter()
            .find(|b| b.container_port == container_port)
            .map(|b| b.host_port)
    }
}

/// Logical request for a development environment container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvdRequest {
    pub tag: String,
    pub name: String,
    pub build_context: PathBuf,
    pub gpu_enabled: bool,
    pub num_gpus: u32,
    pub ssh_host_port: u16,
    pub services: ServiceFlags,
    /// Raw `hostPath:containerPath` strings
    pub mount_options: Vec<String>,
    pub env: Vec<String>,
}

impl EnvdRequest {
    /// Create a new request builder.
    pub fn builder() -> EnvdRequestBuilder {
        EnvdRequestBuilder::default()
    }
}

/// Fluent builder for [`EnvdRequest`].
#[derive(Debug, Default)]
pub struct EnvdRequestBuilder {
    tag: Option<String>,
    name: Option<String>,
    build_context: Option<PathBuf>,
    gpu_enabled: bool,
    num_gpus: u32,
    ssh_host_port: Option<u16>,
    services: ServiceFlags,
    mount_options: Vec<String>,
    env: Vec<String>,
}

impl EnvdRequestBuilder {
    /// Set the image tag.
    pub fn tag<S: Into<String>>(mut self, tag: S) -> Self {
        self.tag = Some(tag.into());
        self
    }

    /// Set the container name.
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the host build context mounted as the working directory.
    pub fn build_context<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.build_context = Some(path.into());
        self
    }

    /// Request `count` GPUs when `enabled`.
    pub fn gpus(mut self, enabled: bool, count: u32) -> Self {
        self.gpu_enabled = enabled;
        self.num_gpus = count;
        self
    }

    /// Host port for sshd, allocated by the caller.
    pub fn ssh_host_port(mut self, port: u16) -> Self {
        self.ssh_host_port = Some(port);
        self
    }

    pub fn jupyter(mut self, enable: bool) -> Self {
        self.services.jupyter = enable;
        self
    }

    pub fn rstudio(mut self, enable: bool) -> Self {
        self.services.rstudio = enable;
        self
    }

    pub fn services(mut self, services: ServiceFlags) -> Self {
        self.services = services;
        self
    }

    /// Add a `hostPath:containerPath` mount option.
    pub fn mount<S: Into<String>>(mut self, option: S) -> Self {
        self.mount_options.push(option.into());
        self
    }

    /// Add multiple mount options.
    pub fn mounts<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.mount_options
            .extend(options.into_iter().map(|s| s.into()));
        self
    }

    /// Add an environment variable.
    pub fn env<K: Into<String>, V: Into<String>>(mut self, key: K, value: V) -> Self {
        self.env.push(format!("{}={}", key.into(), value.into()));
        self
    }

    /// Build the request.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::Validation`] if a required field is missing.
    pub fn build(self) -> Result<EnvdRequest> {
        let missing = |field: &str| ContainerError::Validation(format!("{} is required", field));
        Ok(EnvdRequest {
            tag: self.tag.ok_or_else(|| missing("image tag"))?,
            name: self.name.ok_or_else(|| missing("container name"))?,
            build_context: self.build_context.ok_or_else(|| missing("build context"))?,
            gpu_enabled: self.gpu_enabled,
            num_gpus: self.num_gpus,
            ssh_host_port: self.ssh_host_port.ok_or_else(|| missing("ssh host port"))?,
            services: self.services,
            mount_options: self.mount_options,
            env: self.env,
        })
    }
}

/// Assembles [`ContainerSpec`]s for environment containers.
pub struct SpecBuilder<'a> {
    config: &'a EnvdConfig,
    ports: &'a dyn PortAllocator,
}

impl<'a> SpecBuilder<'a> {
    pub fn new(config: &'a EnvdConfig, ports: &'a dyn PortAllocator) -> Self {
        Self { config, ports }
    }

    /// Build the creation spec for `request`.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::Validation`] for malformed or colliding mounts
    /// or a non-loopback host IP, and [`ContainerError::ResourceAllocation`] if
    /// no distinct free port could be found for a declared service.
    pub fn build(&self, request: &EnvdRequest) -> Result<ContainerSpec> {
        let host_ip = loopback_ip(&self.config.host_ip)?;
        let working_dir = working_dir_for(&self.config.home_prefix, &request.build_context)?;
        let mut spec = ContainerSpec::new(&request.tag, &request.name);
        spec.user = Some(self.config.user.clone());
        spec.working_dir = Some(working_dir.clone());
        spec.env = request.env.clone();

        spec.mounts = self.mounts(request, &working_dir)?;
        debug!(
            container = %request.name,
            mount_path = %request.build_context.display(),
            working_dir = %working_dir,
            "setting up container working directory"
        );

        let ports = &self.config.ports;
        let mut used = HashSet::new();
        used.insert(request.ssh_host_port);
        self.bind(&mut spec, host_ip, ports.ssh, request.ssh_host_port);
        spec.labels.insert(
            env::labels::SSH_PORT.to_string(),
            request.ssh_host_port.to_string(),
        );

        if request.services.jupyter {
            let host_port = self.allocate_distinct(&mut used, "jupyter")?;
            self.bind(&mut spec, host_ip, ports.jupyter, host_port);
            spec.exposed_ports.insert(ports.jupyter);
            spec.labels
                .insert(env::labels::JUPYTER_PORT.to_string(), host_port.to_string());
        }
        if request.services.rstudio {
            let host_port = self.allocate_distinct(&mut used, "rstudio")?;
            self.bind(&mut spec, host_ip, ports.rstudio, host_port);
            spec.exposed_ports.insert(ports.rstudio);
            spec.labels
                .insert(env::labels::RSTUDIO_PORT.to_string(), host_port.to_string());
        }

        if request.gpu_enabled {
            debug!(container = %request.name, count = request.num_gpus, "GPU is enabled");
            spec.device_request = Some(GpuDeviceRequest::nvidia(request.num_gpus));
        }

        spec.labels
            .insert(env::labels::MANAGED.to_string(), "true".to_string());
        spec.labels
            .insert(env::labels::NAME.to_string(), request.name.clone());
        spec.labels.insert(
            env::labels::GPU.to_string(),
            request.gpu_enabled.to_string(),
        );

        Ok(spec)
    }

    fn mounts(&self, request: &EnvdRequest, working_dir: &str) -> Result<Vec<MountSpec>> {
        let mut targets = HashSet::new();
        targets.insert(working_dir.to_string());

        let mut mounts = Vec::with_capacity(request.mount_options.len() + 1);
        for option in &request.mount_options {
            let mount = MountSpec::parse(option)?;
            if !targets.insert(mount.target.clone()) {
                return Err(ContainerError::Validation(format!(
                    "mount option {:?} targets {} which is already mounted",
                    option, mount.target
                )));
            }
            debug!(
                container = %request.name,
                mount_path = %mount.source,
                container_path = %mount.target,
                "adding bind mount"
            );
            mounts.push(mount);
        }

        let source = clean_path(&std::path::absolute(&request.build_context)?);
        mounts.push(MountSpec::bind(
            source.to_string_lossy().into_owned(),
            working_dir,
        ));
        Ok(mounts)
    }

    fn bind(
        &self,
        spec: &mut ContainerSpec,
        host_ip: IpAddr,
        container_port: u16,
        host_port: u16,
    ) {
        spec.port_bindings.push(PortBinding {
            container_port,
            host_ip: host_ip.to_string(),
            host_port,
        });
    }

    fn allocate_distinct(&self, used: &mut HashSet<u16>, service: &str) -> Result<u16> {
        let port = self.ports.allocate()?;
        if !used.insert(port) {
            return Err(ContainerError::ResourceAllocation(format!(
                "host port {} for {} is already bound in this spec",
                port, service
            )));
        }
        debug!(service, port, "allocated service port");
        Ok(port)
    }
}

/// Host bindings never leave the loopback interface.
fn loopback_ip(host_ip: &str) -> Result<IpAddr> {
    match host_ip.parse::<IpAddr>() {
        Ok(ip) if ip.is_loopback() => Ok(ip),
        _ => Err(ContainerError::Validation(format!(
            "host ip {:?} is not a loopback address",
            host_ip
        ))),
    }
}

/// Lexically resolve `.` and `..` components.
fn clean_path(path: &Path) -> PathBuf {
    let mut cleaned = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !cleaned.pop() {
                    cleaned.push(component);
                }
            }
            other => cleaned.push(other),
        }
    }
    cleaned
}

/// Working directory for a build context: its base name under `home_prefix`.
pub fn working_dir_for(home_prefix: &str, build_context: &Path) -> Result<String> {
    let base = clean_path(&std::path::absolute(build_context)?)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| {
            ContainerError::Validation(format!(
                "build context {:?} has no base name",
                build_context
            ))
        })?;
    Ok(format!("{}/{}", home_prefix.trim_end_matches('/'), base))
}
