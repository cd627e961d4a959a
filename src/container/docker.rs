//! Docker/Podman host adapter.
//!
//! Implements [`LifecycleClient`] over the bollard Docker API. Connection
//! handling follows the usual fallback order: local defaults, then rootless
//! and system Podman sockets.

use crate::container::classify::{HostErrorKind, classify};
use crate::container::client::normalize_name;
use crate::container::{
    ContainerDetails, ContainerError, ContainerSpec, ContainerSummary, CreatedContainer,
    DaemonInfo, HostError, HostResult, ImageInfo, LifecycleClient, ListFilter, Result,
};
use async_trait::async_trait;
use bollard::Docker;
use bollard::exec::{CreateExecOptions, StartExecOptions};
use bollard::models::{
    ContainerCreateBody, DeviceRequest, HostConfig, Mount, MountTypeEnum, PortBinding,
};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, ImportImageOptionsBuilder,
    InspectContainerOptions, KillContainerOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions,
};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

const PERMISSION_HINT: &str = "It seems that current user have no access to docker daemon, \
please visit https://docs.docker.com/engine/install/linux-postinstall/ for more info.";

impl From<bollard::errors::Error> for HostError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code,
                message,
            } => HostError::response(status_code, message),
            other => HostError::transport(other.to_string()),
        }
    }
}

fn unreachable(err: HostError) -> ContainerError {
    if classify(&err) == HostErrorKind::PermissionDenied {
        ContainerError::HostUnreachable(PERMISSION_HINT.to_string())
    } else {
        ContainerError::HostUnreachable(err.message)
    }
}

/// Docker/Podman API client.
#[derive(Clone)]
pub struct DockerClient {
    docker: Arc<Docker>,
}

impl DockerClient {
    /// Connect to the local daemon and verify it answers.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::HostUnreachable`] if no daemon can be reached;
    /// a permission failure is reported with a remediation hint.
    pub async fn new() -> Result<Self> {
        let client = Self {
            docker: Arc::new(Self::connect()?),
        };
        client.ping().await?;
        Ok(client)
    }

    fn connect() -> Result<Docker> {
        debug!("Attempting to connect to container runtime...");

        match Docker::connect_with_local_defaults() {
            Ok(docker) => {
                info!("Connected to container runtime via local defaults");
                return Ok(docker);
            }
            Err(e) => debug!("Local defaults failed: {}", e),
        }

        #[cfg(unix)]
        {
            let mut sockets = Vec::new();
            if let Ok(home) = std::env::var("HOME") {
                sockets.push(format!("unix://{}/run/podman/podman.sock", home));
            }
            sockets.push("unix:///run/podman/podman.sock".to_string());

            for socket in sockets {
                debug!("Trying Podman socket: {}", socket);
                match Docker::connect_with_socket(&socket, 120, bollard::API_DEFAULT_VERSION) {
                    Ok(docker) => {
                        info!("Connected to Podman via {}", socket);
                        return Ok(docker);
                    }
                    Err(e) => debug!("Podman socket {} failed: {}", socket, e),
                }
            }
        }

        Err(ContainerError::HostUnreachable(
            "Failed to connect to Docker or Podman. Please ensure Docker or Podman is installed and running.".to_string(),
        ))
    }

    /// Ping the container runtime to verify connectivity.
    ///
    /// # Errors
    ///
    /// Returns error if ping fails.
    pub async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map_err(|e| unreachable(HostError::from(e)))?;
        debug!("Container runtime ping successful");
        Ok(())
    }
}

fn create_body(spec: &ContainerSpec) -> ContainerCreateBody {
    let mounts: Vec<Mount> = spec
        .mounts
        .iter()
        .map(|m| Mount {
            source: Some(m.source.clone()),
            target: Some(m.target.clone()),
            typ: Some(MountTypeEnum::BIND),
            ..Default::default()
        })
        .collect();

    let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
        .port_bindings
        .iter()
        .map(|b| {
            (
                format!("{}/tcp", b.container_port),
                Some(vec![PortBinding {
                    host_ip: Some(b.host_ip.clone()),
                    host_port: Some(b.host_port.to_string()),
                }]),
            )
        })
        .collect();

    let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
        .exposed_ports
        .iter()
        .map(|p| (format!("{}/tcp", p), HashMap::new()))
        .collect();

    let device_requests = spec.device_request.as_ref().map(|d| {
        vec![DeviceRequest {
            driver: Some(d.driver.clone()),
            count: Some(i64::from(d.count)),
            capabilities: Some(d.capabilities.iter().map(|c| vec![c.clone()]).collect()),
            ..Default::default()
        }]
    });

    let host_config = HostConfig {
        mounts: if mounts.is_empty() { None } else { Some(mounts) },
        port_bindings: if port_bindings.is_empty() {
            None
        } else {
            Some(port_bindings)
        },
        device_requests,
        privileged: Some(spec.privileged),
        ..Default::default()
    };

    ContainerCreateBody {
        image: Some(spec.image.clone()),
        user: spec.user.clone(),
        working_dir: spec.working_dir.clone(),
        entrypoint: spec.entrypoint.clone(),
        env: if spec.env.is_empty() {
            None
        } else {
            Some(spec.env.clone())
        },
        labels: Some(spec.labels.clone().into_iter().collect()),
        exposed_ports: if exposed_ports.is_empty() {
            None
        } else {
            Some(exposed_ports)
        },
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[async_trait]
impl LifecycleClient for DockerClient {
    async fn load_image(
        &self,
        archive: BoxStream<'static, Bytes>,
        quiet: bool,
    ) -> HostResult<()> {
        let options = ImportImageOptionsBuilder::new().quiet(quiet).build();
        let progress = self.docker.import_image_stream(options, archive, None);
        futures::pin_mut!(progress);

        while let Some(result) = progress.next().await {
            let info = result?;
            debug!("Load: {:?}", info);
        }
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> HostResult<()> {
        let options = CreateImageOptionsBuilder::new().from_image(reference).build();
        let mut progress = self.docker.create_image(Some(options), None, None);

        while let Some(result) = progress.next().await {
            let info = result?;
            if let Some(error) = info.error {
                return Err(HostError::transport(format!("Pull failed: {}", error)));
            }
            if let Some(status) = info.status {
                debug!("Pull: {}", status);
            }
        }

        info!("Successfully pulled image: {}", reference);
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> HostResult<ImageInfo> {
        let image = self.docker.inspect_image(reference).await?;
        Ok(ImageInfo {
            id: image.id.unwrap_or_default(),
            repo_tags: image.repo_tags.unwrap_or_default(),
            size: image.size.unwrap_or(0),
            // Inspection reports the creation time as text; only summaries carry the timestamp.
            created: 0,
            labels: image
                .config
                .and_then(|c| c.labels)
                .unwrap_or_default()
                .into_iter()
                .collect(),
        })
    }

    async fn create_container(&self, spec: &ContainerSpec) -> HostResult<CreatedContainer> {
        let options = CreateContainerOptionsBuilder::new().name(&spec.name).build();
        debug!("Creating container: {}", spec.name);

        let response = self
            .docker
            .create_container(Some(options), create_body(spec))
            .await?;

        info!("Created container: {} ({})", spec.name, response.id);
        Ok(CreatedContainer {
            id: response.id,
            warnings: response.warnings,
        })
    }

    async fn start_container(&self, id: &str) -> HostResult<()> {
        debug!("Starting container: {}", id);
        self.docker
            .start_container(id, None::<StartContainerOptions>)
            .await?;
        info!("Started container: {}", id);
        Ok(())
    }

    async fn inspect_container(&self, name: &str) -> HostResult<ContainerDetails> {
        let inspect = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await?;

        let state = inspect.state.unwrap_or_default();
        let config = inspect.config.unwrap_or_default();
        let networks = inspect
            .network_settings
            .and_then(|n| n.networks)
            .unwrap_or_default();
        let ip_address = networks
            .get("bridge")
            .and_then(|e| e.ip_address.clone())
            .filter(|ip| !ip.is_empty())
            .or_else(|| {
                networks
                    .values()
                    .filter_map(|e| e.ip_address.clone())
                    .find(|ip| !ip.is_empty())
            });

        Ok(ContainerDetails {
            id: inspect.id.unwrap_or_default(),
            name: normalize_name(&inspect.name.unwrap_or_default()),
            image: config.image.unwrap_or_default(),
            status: state.status.map(|s| s.to_string()).unwrap_or_default(),
            running: state.running.unwrap_or(false),
            paused: state.paused.unwrap_or(false),
            ip_address,
            labels: config.labels.unwrap_or_default().into_iter().collect(),
        })
    }

    async fn kill_container(&self, name: &str, signal: &str) -> HostResult<()> {
        let options = KillContainerOptionsBuilder::new().signal(signal).build();
        self.docker.kill_container(name, Some(options)).await?;
        Ok(())
    }

    async fn remove_container(&self, name: &str) -> HostResult<()> {
        let options = RemoveContainerOptionsBuilder::new().build();
        self.docker.remove_container(name, Some(options)).await?;
        info!("Removed container: {}", name);
        Ok(())
    }

    async fn pause_container(&self, name: &str) -> HostResult<()> {
        self.docker.pause_container(name).await?;
        Ok(())
    }

    async fn unpause_container(&self, name: &str) -> HostResult<()> {
        self.docker.unpause_container(name).await?;
        Ok(())
    }

    async fn list_containers(&self, filter: &ListFilter) -> HostResult<Vec<ContainerSummary>> {
        let containers = self
            .docker
            .list_containers(Some(bollard::container::ListContainersOptions {
                all: true,
                filters: filter.to_filters(),
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                names: c.names.unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.map(|s| s.to_string()).unwrap_or_default(),
                status: c.status.unwrap_or_default(),
                labels: c.labels.unwrap_or_default().into_iter().collect(),
            })
            .collect())
    }

    async fn list_images(&self, filter: &ListFilter) -> HostResult<Vec<ImageInfo>> {
        let images = self
            .docker
            .list_images(Some(bollard::image::ListImagesOptions::<String> {
                filters: filter.to_filters(),
                ..Default::default()
            }))
            .await?;

        Ok(images
            .into_iter()
            .map(|img| ImageInfo {
                id: img.id,
                repo_tags: img.repo_tags,
                size: img.size,
                created: img.created,
                labels: img.labels.into_iter().collect(),
            })
            .collect())
    }

    async fn daemon_info(&self) -> HostResult<DaemonInfo> {
        let info = self.docker.info().await?;
        Ok(DaemonInfo {
            id: info.id.unwrap_or_default(),
            name: info.name.unwrap_or_default(),
            server_version: info.server_version.unwrap_or_default(),
            default_runtime: info.default_runtime,
            runtimes: info
                .runtimes
                .unwrap_or_default()
                .into_iter()
                .map(|(name, runtime)| (name, runtime.path))
                .collect(),
        })
    }

    async fn exec(&self, name: &str, cmd: &[String]) -> HostResult<()> {
        debug!("Executing detached command in container {}: {:?}", name, cmd);
        let exec = self
            .docker
            .create_exec(
                name,
                CreateExecOptions {
                    cmd: Some(cmd.to_vec()),
                    attach_stdout: Some(false),
                    attach_stderr: Some(false),
                    ..Default::default()
                },
            )
            .await?;

        self.docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    detach: true,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }
}
