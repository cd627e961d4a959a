//! Integration tests against a real Docker/Podman daemon.
//!
//! Tests are skipped if Docker/Podman is not available or SKIP_CONTAINER_TESTS=1.

#![cfg(feature = "docker")]

use envd::config::EnvdConfig;
use envd::container::{ContainerError, DockerClient, LifecycleManager};
use serial_test::serial;
use std::sync::Arc;
use test_tag::tag;

/// Check if container tests should run.
fn should_run_container_tests() -> bool {
    if let Ok(value) = std::env::var("SKIP_CONTAINER_TESTS") {
        if value == "1" || value.eq_ignore_ascii_case("true") {
            return false;
        }
    }

    std::process::Command::new("docker")
        .arg("info")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
        || std::process::Command::new("podman")
            .arg("info")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
}

async fn manager() -> LifecycleManager {
    let client = DockerClient::new().await.expect("Failed to connect");
    LifecycleManager::new(Arc::new(client), EnvdConfig::default())
}

fn unique_name() -> String {
    format!("envd-test-{}", uuid::Uuid::new_v4().simple())
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_daemon_info_and_gpu_check() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests (Docker/Podman not available or SKIP_CONTAINER_TESTS=1)");
        return;
    }

    let manager = manager().await;
    let info = manager.info().await.expect("Failed to query daemon info");
    assert!(!info.server_version.is_empty());

    // Only the query itself must succeed; the runtime may be absent.
    manager.gpu_enabled().await.expect("GPU check failed");
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_missing_container_semantics() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests");
        return;
    }

    let manager = manager().await;
    let name = unique_name();

    assert!(!manager.exists(&name).await.unwrap());
    assert!(!manager.is_running(&name).await.unwrap());
    assert_eq!(manager.destroy(&name).await.unwrap(), None);
    assert!(matches!(
        manager.pause(&name).await,
        Err(ContainerError::ContainerNotFound(_))
    ));
    assert!(matches!(
        manager.resume(&name).await,
        Err(ContainerError::ContainerNotFound(_))
    ));
}

#[tokio::test]
#[serial]
#[tag(integration, container)]
async fn test_list_managed_resources() {
    if !should_run_container_tests() {
        eprintln!("Skipping container tests");
        return;
    }

    let manager = manager().await;
    manager.list_containers().await.expect("Failed to list containers");
    manager.list_images().await.expect("Failed to list images");
    assert!(matches!(
        manager.get_image(&format!("{}:missing", unique_name())).await,
        Err(ContainerError::ImageNotFound(_))
    ));
}
