//! Capability surface over the container host.
//!
//! [`LifecycleClient`] is a thin pass-through over the daemon: every call
//! returns the host's own loosely-typed [`HostError`] and leaves the
//! interpretation to [`classify`](super::classify) and the lifecycle manager.
//! [`DockerClient`](super::DockerClient) talks to a real daemon and
//! [`FakeHost`](super::FakeHost) keeps everything in memory.

use crate::container::ContainerSpec;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};

/// Raw failure reported by the container host.
///
/// `status` carries the HTTP status code when the daemon answered; transport
/// failures have none.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct HostError {
    pub status: Option<u16>,
    pub message: String,
}

impl HostError {
    /// Error the daemon answered with.
    pub fn response<S: Into<String>>(status: u16, message: S) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    /// Error raised before any answer from the daemon.
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }
}

/// Result type for raw host calls.
pub type HostResult<T> = std::result::Result<T, HostError>;

/// Identity of a freshly created container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedContainer {
    pub id: String,
    pub warnings: Vec<String>,
}

/// Observed container record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ContainerDetails {
    /// Container ID
    pub id: String,
    /// Container name without the leading slash
    pub name: String,
    /// Image the container was created from
    pub image: String,
    /// Raw state reported by the host ("created", "running", "paused", ...)
    pub status: String,
    pub running: bool,
    pub paused: bool,
    /// Address on the container network, when attached
    pub ip_address: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// Container summary information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container ID
    pub id: String,
    /// Container names
    pub names: Vec<String>,
    /// Image name
    pub image: String,
    /// Container state
    pub state: String,
    /// Container status
    pub status: String,
    pub labels: BTreeMap<String, String>,
}

/// Image information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
    /// Image ID
    pub id: String,
    /// Repository tags
    pub repo_tags: Vec<String>,
    /// Size in bytes
    pub size: i64,
    /// Creation timestamp
    pub created: i64,
    pub labels: BTreeMap<String, String>,
}

/// Subset of the daemon's system information.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonInfo {
    pub id: String,
    pub name: String,
    pub server_version: String,
    pub default_runtime: Option<String>,
    /// Registered OCI runtimes and their executable path
    pub runtimes: BTreeMap<String, Option<String>>,
}

/// Listing filter in the daemon's `filters` vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// `key` or `key=value`
    pub label: Option<String>,
    /// Image reference
    pub reference: Option<String>,
}

impl ListFilter {
    pub fn label<S: Into<String>>(label: S) -> Self {
        Self {
            label: Some(label.into()),
            reference: None,
        }
    }

    pub fn reference<S: Into<String>>(reference: S) -> Self {
        Self {
            label: None,
            reference: Some(reference.into()),
        }
    }

    /// Render as the daemon's filter map.
    pub fn to_filters(&self) -> HashMap<String, Vec<String>> {
        let mut filters = HashMap::new();
        if let Some(label) = &self.label {
            filters.insert("label".to_string(), vec![label.clone()]);
        }
        if let Some(reference) = &self.reference {
            filters.insert("reference".to_string(), vec![reference.clone()]);
        }
        filters
    }

    /// Whether a record with these labels and references passes the filter.
    pub fn matches(&self, labels: &BTreeMap<String, String>, references: &[String]) -> bool {
        let label_ok = match &self.label {
            None => true,
            Some(label) => match label.split_once('=') {
                Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
                None => labels.contains_key(label),
            },
        };
        let reference_ok = match &self.reference {
            None => true,
            Some(reference) => references.iter().any(|r| r == reference),
        };
        label_ok && reference_ok
    }
}

/// Pass-through capabilities of a container host.
#[async_trait]
pub trait LifecycleClient: Send + Sync {
    /// Load an image tarball into the host.
    async fn load_image(&self, archive: BoxStream<'static, Bytes>, quiet: bool) -> HostResult<()>;

    /// Pull an image from its registry.
    async fn pull_image(&self, reference: &str) -> HostResult<()>;

    async fn inspect_image(&self, reference: &str) -> HostResult<ImageInfo>;

    async fn create_container(&self, spec: &ContainerSpec) -> HostResult<CreatedContainer>;

    async fn start_container(&self, id: &str) -> HostResult<()>;

    async fn inspect_container(&self, name: &str) -> HostResult<ContainerDetails>;

    async fn kill_container(&self, name: &str, signal: &str) -> HostResult<()>;

    async fn remove_container(&self, name: &str) -> HostResult<()>;

    async fn pause_container(&self, name: &str) -> HostResult<()>;

    async fn unpause_container(&self, name: &str) -> HostResult<()>;

    async fn list_containers(&self, filter: &ListFilter) -> HostResult<Vec<ContainerSummary>>;

    async fn list_images(&self, filter: &ListFilter) -> HostResult<Vec<ImageInfo>>;

    async fn daemon_info(&self) -> HostResult<DaemonInfo>;

    /// Run a command in the container without waiting for it.
    async fn exec(&self, name: &str, cmd: &[String]) -> HostResult<()>;
}

/// Strip the leading slash the daemon puts on container names.
pub fn normalize_name(name: &str) -> String {
    name.trim_start_matches('/').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_by_label_key() {
        let filter = ListFilter::label("ai.tensorchord.envd.managed");
        let mut labels = BTreeMap::new();
        assert!(!filter.matches(&labels, &[]));

        labels.insert("ai.tensorchord.envd.managed".to_string(), "true".to_string());
        assert!(filter.matches(&labels, &[]));
    }

    #[test]
    fn test_filter_by_label_value() {
        let filter = ListFilter::label("ai.tensorchord.envd.name=c1");
        let mut labels = BTreeMap::new();
        labels.insert("ai.tensorchord.envd.name".to_string(), "c2".to_string());
        assert!(!filter.matches(&labels, &[]));

        labels.insert("ai.tensorchord.envd.name".to_string(), "c1".to_string());
        assert!(filter.matches(&labels, &[]));
    }

    #[test]
    fn test_filter_by_reference() {
        let filter = ListFilter::reference("img:dev");
        let tags = vec!["img:latest".to_string(), "img:dev".to_string()];
        assert!(filter.matches(&BTreeMap::new(), &tags));
        assert!(!filter.matches(&BTreeMap::new(), &tags[..1]));

        let filters = filter.to_filters();
        assert_eq!(filters.get("reference"), Some(&vec!["img:dev".to_string()]));
        assert!(!filters.contains_key("label"));
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("/c1"), "c1");
        assert_eq!(normalize_name("c1"), "c1");
    }
}
