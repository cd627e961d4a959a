//! Deterministic in-memory container host.
//!
//! [`FakeHost`] answers every [`LifecycleClient`] call from memory and fails
//! with the same status codes and texts a Docker daemon uses, so the lifecycle
//! and classification code can be exercised without a daemon. Failures can be
//! injected per operation and every call is counted.

use crate::container::client::normalize_name;
use crate::container::{
    ContainerDetails, ContainerSpec, ContainerSummary, CreatedContainer, DaemonInfo, HostError,
    HostResult, ImageInfo, LifecycleClient, ListFilter,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// Host operation, used to count calls and inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOp {
    LoadImage,
    PullImage,
    InspectImage,
    CreateContainer,
    StartContainer,
    InspectContainer,
    KillContainer,
    RemoveContainer,
    PauseContainer,
    UnpauseContainer,
    ListContainers,
    ListImages,
    DaemonInfo,
    Exec,
}

/// State of a fake container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FakeState {
    Created,
    Running,
    Paused,
    Exited,
}

impl FakeState {
    fn as_str(self) -> &'static str {
        match self {
            FakeState::Created => "created",
            FakeState::Running => "running",
            FakeState::Paused => "paused",
            FakeState::Exited => "exited",
        }
    }
}

/// A container held by the fake host.
#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub state: FakeState,
    pub ip_address: Option<String>,
    /// Commands passed to exec, in order
    pub execs: Vec<Vec<String>>,
    /// Inspections left before a started container reports running
    pending_inspections: usize,
}

#[derive(Debug, Default)]
struct World {
    containers: Vec<FakeContainer>,
    images: Vec<ImageInfo>,
    runtimes: BTreeMap<String, Option<String>>,
    loaded_archives: Vec<usize>,
    archive_chunks: Vec<usize>,
    next_id: usize,
}

impl World {
    fn find(&mut self, key: &str) -> Option<&mut FakeContainer> {
        let key = normalize_name(key);
        if key.is_empty() {
            return None;
        }
        self.containers
            .iter_mut()
            .find(|c| c.spec.name == key || c.id == key || c.id.starts_with(&key))
    }

    fn bound_ports(&self, except: &str) -> HashSet<u16> {
        self.containers
            .iter()
            .filter(|c| c.id != except)
            .filter(|c| matches!(c.state, FakeState::Running | FakeState::Paused))
            .flat_map(|c| c.spec.port_bindings.iter().map(|b| b.host_port))
            .collect()
    }
}

fn no_such_container(key: &str) -> HostError {
    HostError::response(404, format!("No such container: {}", key))
}

fn not_running(id: &str) -> String {
    format!("Container {} is not running", id)
}

/// In-memory implementation of [`LifecycleClient`].
#[derive(Debug, Default)]
pub struct FakeHost {
    world: Mutex<World>,
    failures: DashMap<HostOp, VecDeque<HostError>>,
    calls: DashMap<HostOp, usize>,
    start_delay: AtomicUsize,
    hold_in_created: AtomicBool,
    inspect_delay_ms: AtomicU64,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `err`. Failures queue up.
    pub fn fail_next(&self, op: HostOp, err: HostError) {
        self.failures.entry(op).or_default().push_back(err);
    }

    /// Number of times `op` was called, failed calls included.
    pub fn call_count(&self, op: HostOp) -> usize {
        self.calls.get(&op).map(|c| *c).unwrap_or(0)
    }

    /// Number of inspections a started container reports not running.
    pub fn set_start_delay(&self, inspections: usize) {
        self.start_delay.store(inspections, Ordering::SeqCst);
    }

    /// Keep started containers in the created state.
    pub fn hold_in_created(&self, hold: bool) {
        self.hold_in_created.store(hold, Ordering::SeqCst);
    }

    /// Make every container inspection take `delay` before answering.
    pub fn set_inspect_delay(&self, delay: Duration) {
        self.inspect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Register an OCI runtime in the daemon info.
    pub fn set_runtime(&self, name: &str, path: Option<&str>) {
        self.world()
            .runtimes
            .insert(name.to_string(), path.map(String::from));
    }

    /// Make an image available locally.
    pub fn add_image(&self, reference: &str, labels: &[(&str, &str)]) {
        let mut world = self.world();
        world.next_id += 1;
        let id = format!("sha256:{:064x}", world.next_id);
        world.images.push(ImageInfo {
            id,
            repo_tags: vec![reference.to_string()],
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        });
    }

    /// Snapshot of a container by name or ID.
    pub fn container(&self, key: &str) -> Option<FakeContainer> {
        self.world().find(key).cloned()
    }

    /// Current state of a container by name or ID.
    pub fn state_of(&self, key: &str) -> Option<FakeState> {
        self.container(key).map(|c| c.state)
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.world()
            .images
            .iter()
            .any(|i| i.repo_tags.iter().any(|t| t == reference))
    }

    /// Sizes of the archives passed to `load_image`.
    pub fn loaded_archives(&self) -> Vec<usize> {
        self.world().loaded_archives.clone()
    }

    /// Number of chunks each loaded archive arrived in.
    pub fn archive_chunks(&self) -> Vec<usize> {
        self.world().archive_chunks.clone()
    }

    fn world(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enter(&self, op: HostOp) -> HostResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.failures.get_mut(&op).and_then(|mut q| q.pop_front()) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl LifecycleClient for FakeHost {
    async fn load_image(
        &self,
        mut archive: BoxStream<'static, Bytes>,
        _quiet: bool,
    ) -> HostResult<()> {
        self.enter(HostOp::LoadImage)?;
        let (mut bytes, mut chunks) = (0, 0);
        while let Some(chunk) = archive.next().await {
            bytes += chunk.len();
            chunks += 1;
        }
        let mut world = self.world();
        world.loaded_archives.push(bytes);
        world.archive_chunks.push(chunks);
        Ok(())
    }

    async fn pull_image(&self, reference: &str) -> HostResult<()> {
        self.enter(HostOp::PullImage)?;
        if !self.has_image(reference) {
            self.add_image(reference, &[]);
        }
        Ok(())
    }

    async fn inspect_image(&self, reference: &str) -> HostResult<ImageInfo> {
        self.enter(HostOp::InspectImage)?;
        self.world()
            .images
            .iter()
            .find(|i| i.id == reference || i.repo_tags.iter().any(|t| t == reference))
            .cloned()
            .ok_or_else(|| HostError::response(404, format!("No such image: {}", reference)))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> HostResult<CreatedContainer> {
        self.enter(HostOp::CreateContainer)?;
        let mut world = self.world();
        if let Some(existing) = world.containers.iter().find(|c| c.spec.name == spec.name) {
            return Err(HostError::response(
                409,
                format!(
                    "Conflict. The container name \"/{}\" is already in use by container \"{}\". \
                     You have to remove (or rename) that container to be able to reuse that name.",
                    spec.name, existing.id
                ),
            ));
        }

        world.next_id += 1;
        let id = format!("{:064x}", world.next_id);
        world.containers.push(FakeContainer {
            id: id.clone(),
            spec: spec.clone(),
            state: FakeState::Created,
            ip_address: None,
            execs: Vec::new(),
            pending_inspections: 0,
        });
        Ok(CreatedContainer {
            id,
            warnings: Vec::new(),
        })
    }

    async fn start_container(&self, id: &str) -> HostResult<()> {
        self.enter(HostOp::StartContainer)?;
        let hold = self.hold_in_created.load(Ordering::SeqCst);
        let delay = self.start_delay.load(Ordering::SeqCst);

        let mut world = self.world();
        let (container_id, bindings) = match world.find(id) {
            Some(c) => (c.id.clone(), c.spec.port_bindings.clone()),
            None => return Err(no_such_container(id)),
        };
        let bound = world.bound_ports(&container_id);
        if let Some(binding) = bindings.iter().find(|b| bound.contains(&b.host_port)) {
            return Err(HostError::response(
                500,
                format!(
                    "driver failed programming external connectivity on endpoint {} ({}): \
                     Bind for {}:{} failed: port is already allocated",
                    id, container_id, binding.host_ip, binding.host_port
                ),
            ));
        }

        let octet = world.next_id % 250 + 2;
        world.next_id += 1;
        let Some(container) = world.find(&container_id) else {
            return Err(no_such_container(id));
        };
        if matches!(container.state, FakeState::Running | FakeState::Paused) {
            return Ok(());
        }
        if !hold {
            container.state = FakeState::Running;
            container.pending_inspections = delay;
            container.ip_address = Some(format!("172.17.0.{}", octet));
        }
        Ok(())
    }

    async fn inspect_container(&self, name: &str) -> HostResult<ContainerDetails> {
        self.enter(HostOp::InspectContainer)?;
        let delay = self.inspect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let mut world = self.world();
        let container = world.find(name).ok_or_else(|| no_such_container(name))?;

        let mut status = container.state.as_str();
        if container.state == FakeState::Running && container.pending_inspections > 0 {
            container.pending_inspections -= 1;
            status = FakeState::Created.as_str();
        }
        Ok(ContainerDetails {
            id: container.id.clone(),
            name: container.spec.name.clone(),
            image: container.spec.image.clone(),
            status: status.to_string(),
            running: status == "running" || status == "paused",
            paused: status == "paused",
            ip_address: container.ip_address.clone(),
            labels: container.spec.labels.clone(),
        })
    }

    async fn kill_container(&self, name: &str, _signal: &str) -> HostResult<()> {
        self.enter(HostOp::KillContainer)?;
        let mut world = self.world();
        let container = world.find(name).ok_or_else(|| no_such_container(name))?;
        match container.state {
            FakeState::Running | FakeState::Paused => {
                container.state = FakeState::Exited;
                container.ip_address = None;
                Ok(())
            }
            FakeState::Created | FakeState::Exited => Err(HostError::response(
                409,
                format!(
                    "Cannot kill container: {}: {}",
                    name,
                    not_running(&container.id)
                ),
            )),
        }
    }

    async fn remove_container(&self, name: &str) -> HostResult<()> {
        self.enter(HostOp::RemoveContainer)?;
        let mut world = self.world();
        let container = world.find(name).ok_or_else(|| no_such_container(name))?;
        if matches!(container.state, FakeState::Running | FakeState::Paused) {
            return Err(HostError::response(
                409,
                format!(
                    "You cannot remove a {} container {}. Stop the container before attempting removal or force remove",
                    container.state.as_str(),
                    container.id
                ),
            ));
        }
        let id = container.id.clone();
        world.containers.retain(|c| c.id != id);
        Ok(())
    }

    async fn pause_container(&self, name: &str) -> HostResult<()> {
        self.enter(HostOp::PauseContainer)?;
        let mut world = self.world();
        let container = world.find(name).ok_or_else(|| no_such_container(name))?;
        match container.state {
            FakeState::Running => {
                container.state = FakeState::Paused;
                Ok(())
            }
            FakeState::Paused => Err(HostError::response(
                409,
                format!("Container {} is already paused", container.id),
            )),
            FakeState::Created | FakeState::Exited => {
                Err(HostError::response(409, not_running(&container.id)))
            }
        }
    }

    async fn unpause_container(&self, name: &str) -> HostResult<()> {
        self.enter(HostOp::UnpauseContainer)?;
        let mut world = self.world();
        let container = world.find(name).ok_or_else(|| no_such_container(name))?;
        if container.state != FakeState::Paused {
            return Err(HostError::response(
                409,
                format!("Container {} is not paused", container.id),
            ));
        }
        container.state = FakeState::Running;
        Ok(())
    }

    async fn list_containers(&self, filter: &ListFilter) -> HostResult<Vec<ContainerSummary>> {
        self.enter(HostOp::ListContainers)?;
        Ok(self
            .world()
            .containers
            .iter()
            .filter(|c| filter.matches(&c.spec.labels, std::slice::from_ref(&c.spec.image)))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                names: vec![format!("/{}", c.spec.name)],
                image: c.spec.image.clone(),
                state: c.state.as_str().to_string(),
                status: c.state.as_str().to_string(),
                labels: c.spec.labels.clone(),
            })
            .collect())
    }

    async fn list_images(&self, filter: &ListFilter) -> HostResult<Vec<ImageInfo>> {
        self.enter(HostOp::ListImages)?;
        Ok(self
            .world()
            .images
            .iter()
            .filter(|i| filter.matches(&i.labels, &i.repo_tags))
            .cloned()
            .collect())
    }

    async fn daemon_info(&self) -> HostResult<DaemonInfo> {
        self.enter(HostOp::DaemonInfo)?;
        Ok(DaemonInfo {
            id: "fake".to_string(),
            name: "fake-host".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            default_runtime: Some("runc".to_string()),
            runtimes: self.world().runtimes.clone(),
        })
    }

    async fn exec(&self, name: &str, cmd: &[String]) -> HostResult<()> {
        self.enter(HostOp::Exec)?;
        let mut world = self.world();
        let container = world.find(name).ok_or_else(|| no_such_container(name))?;
        if container.state != FakeState::Running {
            return Err(HostError::response(409, not_running(&container.id)));
        }
        container.execs.push(cmd.to_vec());
        Ok(())
    }
}
