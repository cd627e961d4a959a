//! Environment and build daemon lifecycle.
//!
//! [`LifecycleManager`] drives the host through a [`LifecycleClient`]: it
//! builds specs, creates and starts containers, waits for them and interprets
//! host failures so that destroy, pause and resume are idempotent.

use crate::config::EnvdConfig;
use crate::container::classify::{
    HostErrorKind, KillOutcome, ToggleOutcome, classify, kill_outcome, pause_outcome,
    unpause_outcome,
};
use crate::container::{
    ContainerDetails, ContainerError, ContainerSpec, ContainerSummary, DaemonInfo, EnvdRequest,
    ImageInfo, LifecycleClient, ListFilter, LocalPortAllocator, PortAllocator, ReadinessWaiter,
    Result, SpecBuilder,
};
use crate::env;
use futures::StreamExt;
use futures::future;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const KILL_SIGNAL: &str = "KILL";
const ARCHIVE_CHUNK: usize = 64 * 1024;

/// Whether `name` exists on the host. Absence is not an error.
pub async fn exists(client: &dyn LifecycleClient, name: &str) -> Result<bool> {
    match client.inspect_container(name).await {
        Ok(_) => Ok(true),
        Err(e) if classify(&e) == HostErrorKind::NotFound => Ok(false),
        Err(e) => Err(ContainerError::host("failed to inspect container", e)),
    }
}

/// Whether `name` is running. Absence is not an error.
pub async fn is_running(client: &dyn LifecycleClient, name: &str) -> Result<bool> {
    match client.inspect_container(name).await {
        Ok(details) => Ok(details.running),
        Err(e) if classify(&e) == HostErrorKind::NotFound => Ok(false),
        Err(e) => Err(ContainerError::host("failed to inspect container", e)),
    }
}

/// Name, address and published ports of a started environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvdIdentity {
    pub name: String,
    /// Container IP on the host network, if it has one
    pub address: Option<String>,
    pub ssh_port: Option<u16>,
    pub jupyter_port: Option<u16>,
    pub rstudio_port: Option<u16>,
}

impl EnvdIdentity {
    /// Recover the identity from an inspection alone.
    pub fn from_details(details: &ContainerDetails) -> Self {
        let port = |key: &str| details.labels.get(key).and_then(|v| v.parse().ok());
        Self {
            name: details.name.clone(),
            address: details.ip_address.clone(),
            ssh_port: port(env::labels::SSH_PORT),
            jupyter_port: port(env::labels::JUPYTER_PORT),
            rstudio_port: port(env::labels::RSTUDIO_PORT),
        }
    }
}

/// Drives environment containers on one host.
pub struct LifecycleManager {
    client: Arc<dyn LifecycleClient>,
    config: EnvdConfig,
    ports: Arc<dyn PortAllocator>,
}

impl LifecycleManager {
    pub fn new(client: Arc<dyn LifecycleClient>, config: EnvdConfig) -> Self {
        Self {
            client,
            config,
            ports: Arc::new(LocalPortAllocator),
        }
    }

    /// Use `ports` for service port allocation instead of the OS allocator.
    pub fn with_port_allocator(mut self, ports: Arc<dyn PortAllocator>) -> Self {
        self.ports = ports;
        self
    }

    pub fn client(&self) -> &dyn LifecycleClient {
        self.client.as_ref()
    }

    pub fn config(&self) -> &EnvdConfig {
        &self.config
    }

    /// Assemble the creation spec for `request` without touching the host.
    pub fn build_spec(&self, request: &EnvdRequest) -> Result<ContainerSpec> {
        SpecBuilder::new(&self.config, self.ports.as_ref()).build(request)
    }

    /// Create and start an environment container, then wait until it runs.
    ///
    /// `timeout` defaults to the configured readiness timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::PortConflict`] when the host reports a
    /// requested host port as taken. The created container is left in place.
    pub async fn start_envd(
        &self,
        request: &EnvdRequest,
        timeout: Option<Duration>,
    ) -> Result<EnvdIdentity> {
        let spec = self.build_spec(request)?;
        info!(container = %spec.name, tag = %spec.image, "starting environment");

        let created = self
            .client
            .create_container(&spec)
            .await
            .map_err(|e| ContainerError::host("failed to create the container", e))?;
        for warning in &created.warnings {
            warn!(container = %spec.name, %warning, "container created with warning");
        }

        self.client
            .start_container(&created.id)
            .await
            .map_err(|e| match classify(&e) {
                HostErrorKind::PortAllocated => ContainerError::PortConflict(e.message),
                _ => ContainerError::host("failed to start the container", e),
            })?;

        let timeout = timeout.unwrap_or_else(|| self.config.ready_timeout());
        self.wait_until_running(&spec.name, timeout).await?;

        let details = self
            .client
            .inspect_container(&created.id)
            .await
            .map_err(|e| ContainerError::host("failed to inspect the container", e))?;
        let identity = EnvdIdentity::from_details(&details);
        info!(
            container = %identity.name,
            address = ?identity.address,
            ssh_port = ?identity.ssh_port,
            "environment is running"
        );
        Ok(identity)
    }

    /// Start the build daemon from `tag`, pulling the image if it is missing.
    ///
    /// With a registry `mirror`, the daemon is configured to use it for
    /// docker.io before it starts.
    pub async fn start_buildkitd(
        &self,
        tag: &str,
        name: &str,
        mirror: Option<&str>,
    ) -> Result<String> {
        debug!(tag, container = name, "starting buildkitd");

        if let Err(e) = self.client.inspect_image(tag).await {
            if classify(&e) != HostErrorKind::NotFound {
                return Err(ContainerError::host("failed to inspect image", e));
            }
            debug!(tag, "pulling image");
            self.client
                .pull_image(tag)
                .await
                .map_err(|e| ContainerError::host("failed to pull image", e))?;
            debug!(tag, "image pulled");
        }

        let mut spec = ContainerSpec::new(tag, name);
        spec.privileged = true;
        spec.labels
            .insert(env::labels::MANAGED.to_string(), "true".to_string());
        spec.labels
            .insert(env::labels::NAME.to_string(), name.to_string());
        if let Some(mirror) = mirror.filter(|m| !m.is_empty()) {
            debug!(container = name, mirror, "using registry mirror");
            spec.entrypoint = Some(buildkitd_mirror_entrypoint(mirror));
        }

        let created = self
            .client
            .create_container(&spec)
            .await
            .map_err(|e| ContainerError::host("failed to create buildkitd container", e))?;
        for warning in &created.warnings {
            warn!(container = name, %warning, "container created with warning");
        }
        self.client
            .start_container(&created.id)
            .await
            .map_err(|e| ContainerError::host("failed to start buildkitd container", e))?;

        let details = self
            .client
            .inspect_container(&created.id)
            .await
            .map_err(|e| ContainerError::host("failed to inspect buildkitd container", e))?;
        info!(container = %details.name, "buildkitd started");
        Ok(details.name)
    }

    /// Kill and remove `name`.
    ///
    /// Returns `Some(name)` once removed and `None` if there was nothing to
    /// remove. A stopped container is still removed.
    pub async fn destroy(&self, name: &str) -> Result<Option<String>> {
        debug!(container = name, "destroying container");

        if let Err(e) = self.client.kill_container(name, KILL_SIGNAL).await {
            match kill_outcome(&e) {
                KillOutcome::ProceedToRemove => {
                    debug!(container = name, error = %e, "container is not running");
                }
                KillOutcome::AlreadyRemoved => {
                    debug!(container = name, "container does not exist");
                    return Ok(None);
                }
                KillOutcome::Fatal => {
                    return Err(ContainerError::host("failed to kill the container", e));
                }
            }
        }

        self.client
            .remove_container(name)
            .await
            .map_err(|e| ContainerError::host("failed to remove container", e))?;
        info!(container = name, "container destroyed");
        Ok(Some(name.to_string()))
    }

    /// Pause `name`. Pausing a paused container is a no-op returning `None`.
    pub async fn pause(&self, name: &str) -> Result<Option<String>> {
        debug!(container = name, "pausing container");
        match self.client.pause_container(name).await {
            Ok(()) => Ok(Some(name.to_string())),
            Err(e) => match pause_outcome(&e) {
                ToggleOutcome::AlreadyDone => {
                    debug!(container = name, "container is already paused");
                    Ok(None)
                }
                ToggleOutcome::NotFound => Err(ContainerError::ContainerNotFound(name.to_string())),
                ToggleOutcome::Fatal => {
                    Err(ContainerError::host("failed to pause container", e))
                }
            },
        }
    }

    /// Resume `name`. Resuming a container that is not paused is a no-op
    /// returning `None`.
    pub async fn resume(&self, name: &str) -> Result<Option<String>> {
        debug!(container = name, "resuming container");
        match self.client.unpause_container(name).await {
            Ok(()) => Ok(Some(name.to_string())),
            Err(e) => match unpause_outcome(&e) {
                ToggleOutcome::AlreadyDone => {
                    debug!(container = name, "container is not paused");
                    Ok(None)
                }
                ToggleOutcome::NotFound => Err(ContainerError::ContainerNotFound(name.to_string())),
                ToggleOutcome::Fatal => {
                    Err(ContainerError::host("failed to resume container", e))
                }
            },
        }
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        exists(self.client.as_ref(), name).await
    }

    pub async fn is_running(&self, name: &str) -> Result<bool> {
        is_running(self.client.as_ref(), name).await
    }

    /// Wait until `name` runs, polling at the configured interval.
    pub async fn wait_until_running(&self, name: &str, timeout: Duration) -> Result<()> {
        ReadinessWaiter::new(self.client.as_ref(), self.config.poll_interval())
            .wait_until_running(name, timeout)
            .await
    }

    pub async fn wait_until_running_with_cancel(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        ReadinessWaiter::new(self.client.as_ref(), self.config.poll_interval())
            .wait_until_running_with_cancel(name, timeout, cancel)
            .await
    }

    /// Containers carrying the managed label.
    pub async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        self.client
            .list_containers(&ListFilter::label(env::labels::MANAGED))
            .await
            .map_err(|e| ContainerError::host("failed to list containers", e))
    }

    pub async fn get_container(&self, name: &str) -> Result<ContainerDetails> {
        self.client
            .inspect_container(name)
            .await
            .map_err(|e| match classify(&e) {
                HostErrorKind::NotFound => ContainerError::ContainerNotFound(name.to_string()),
                _ => ContainerError::host("failed to inspect container", e),
            })
    }

    /// Images carrying the managed label.
    pub async fn list_images(&self) -> Result<Vec<ImageInfo>> {
        self.client
            .list_images(&ListFilter::label(env::labels::MANAGED))
            .await
            .map_err(|e| ContainerError::host("failed to list images", e))
    }

    pub async fn get_image(&self, reference: &str) -> Result<ImageInfo> {
        let images = self
            .client
            .list_images(&ListFilter::reference(reference))
            .await
            .map_err(|e| ContainerError::host("failed to list images", e))?;
        images
            .into_iter()
            .next()
            .ok_or_else(|| ContainerError::ImageNotFound(reference.to_string()))
    }

    pub async fn info(&self) -> Result<DaemonInfo> {
        self.client
            .daemon_info()
            .await
            .map_err(|e| ContainerError::host("failed to get daemon info", e))
    }

    /// Whether the host has an nvidia runtime with an executable path.
    ///
    /// # Errors
    ///
    /// A failed daemon query is reported, not folded into `false`.
    pub async fn gpu_enabled(&self) -> Result<bool> {
        let info = self.info().await?;
        let enabled = info
            .runtimes
            .get(env::gpu::RUNTIME)
            .and_then(|path| path.as_deref())
            .is_some_and(|path| !path.is_empty());
        debug!(enabled, "checked GPU runtime");
        Ok(enabled)
    }

    /// Run `cmd` detached inside `name`.
    pub async fn exec(&self, name: &str, cmd: &[String]) -> Result<()> {
        debug!(container = name, ?cmd, "executing command");
        self.client
            .exec(name, cmd)
            .await
            .map_err(|e| match classify(&e) {
                HostErrorKind::NotFound => ContainerError::ContainerNotFound(name.to_string()),
                _ => ContainerError::host("failed to exec in container", e),
            })
    }

    /// Stream an image archive into the host.
    ///
    /// The archive is read in chunks as the host consumes it. A read error
    /// ends the upload and is returned in place of whatever the host
    /// reports about the truncated archive.
    pub async fn load_image<R>(&self, reader: R, quiet: bool) -> Result<()>
    where
        R: AsyncRead + Send + 'static,
    {
        let read_error: Arc<Mutex<Option<io::Error>>> = Arc::default();
        let slot = read_error.clone();
        let archive = ReaderStream::with_capacity(reader, ARCHIVE_CHUNK)
            .scan((), move |_, chunk| {
                future::ready(match chunk {
                    Ok(bytes) => Some(bytes),
                    Err(e) => {
                        if let Ok(mut slot) = slot.lock() {
                            *slot = Some(e);
                        }
                        None
                    }
                })
            })
            .boxed();

        debug!("loading image archive");
        let loaded = self.client.load_image(archive, quiet).await;
        if let Some(e) = read_error.lock().ok().and_then(|mut slot| slot.take()) {
            return Err(ContainerError::IoError(e));
        }
        loaded.map_err(|e| ContainerError::host("failed to load image", e))?;
        info!("image loaded");
        Ok(())
    }
}

fn buildkitd_mirror_entrypoint(mirror: &str) -> Vec<String> {
    let config = format!("\n[registry.\"docker.io\"]\n\tmirrors = [\"{}\"]", mirror);
    vec![
        "/bin/sh".to_string(),
        "-c".to_string(),
        format!(
            "mkdir /etc/buildkit && echo '{}' > /etc/buildkit/buildkitd.toml && buildkitd",
            config
        ),
    ]
}
