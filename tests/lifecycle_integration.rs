//! End-to-end lifecycle tests against the in-memory host.

use envd::config::EnvdConfig;
use envd::container::fake::FakeState;
use envd::container::{
    ContainerError, EnvdRequest, FakeHost, HostError, HostOp, LifecycleClient, LifecycleManager,
    MountSpec, PortAllocator, ReadinessWaiter, ServiceFlags, WaitState, free_port,
};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const TICK: Duration = Duration::from_millis(10);

/// Hands out a fixed sequence of ports.
struct ScriptedPorts(Mutex<Vec<u16>>);

impl ScriptedPorts {
    fn new(ports: &[u16]) -> Arc<Self> {
        let mut ports = ports.to_vec();
        ports.reverse();
        Arc::new(Self(Mutex::new(ports)))
    }
}

impl PortAllocator for ScriptedPorts {
    fn allocate(&self) -> envd::container::Result<u16> {
        self.0
            .lock()
            .unwrap()
            .pop()
            .ok_or_else(|| ContainerError::ResourceAllocation("script exhausted".to_string()))
    }
}

fn test_config() -> EnvdConfig {
    EnvdConfig {
        poll_interval_ms: TICK.as_millis() as u64,
        ..EnvdConfig::default()
    }
}

fn setup() -> (Arc<FakeHost>, LifecycleManager) {
    let host = Arc::new(FakeHost::new());
    let manager = LifecycleManager::new(host.clone(), test_config());
    (host, manager)
}

fn basic_request(name: &str, ssh_port: u16) -> EnvdRequest {
    EnvdRequest::builder()
        .tag("img")
        .name(name)
        .build_context("/proj")
        .ssh_host_port(ssh_port)
        .build()
        .unwrap()
}

#[test]
fn test_reference_spec_scenario() {
    let (_host, manager) = setup();
    let request = EnvdRequest::builder()
        .tag("img")
        .name("c1")
        .build_context("/proj")
        .gpus(false, 0)
        .ssh_host_port(2222)
        .services(ServiceFlags::default())
        .mount("/host/data:/data")
        .build()
        .unwrap();

    let spec = manager.build_spec(&request).unwrap();

    assert_eq!(spec.working_dir.as_deref(), Some("/home/envd/proj"));
    assert_eq!(
        spec.mounts,
        vec![
            MountSpec::bind("/host/data", "/data"),
            MountSpec::bind("/proj", "/home/envd/proj"),
        ]
    );
    assert_eq!(spec.port_bindings.len(), 1);
    assert_eq!(spec.port_bindings[0].container_port, 2222);
    assert_eq!(spec.port_bindings[0].host_ip, "127.0.0.1");
    assert_eq!(spec.port_bindings[0].host_port, 2222);
    assert!(spec.device_request.is_none());
    assert!(spec.exposed_ports.is_empty());
}

#[test]
fn test_gpu_request_count_follows_request() {
    let (_host, manager) = setup();
    for count in [0, 1, 4] {
        let request = EnvdRequest::builder()
            .tag("img")
            .name("gpu")
            .build_context("/proj")
            .gpus(true, count)
            .ssh_host_port(2222)
            .build()
            .unwrap();
        let spec = manager.build_spec(&request).unwrap();
        let device = spec.device_request.expect("device request");
        assert_eq!(device.count, count);
        assert_eq!(device.capabilities.len(), 8);
    }
}

#[test]
fn test_both_services_get_distinct_ports() {
    let host = Arc::new(FakeHost::new());
    let manager = LifecycleManager::new(host, test_config())
        .with_port_allocator(ScriptedPorts::new(&[41000, 41001]));
    let request = EnvdRequest::builder()
        .tag("img")
        .name("svc")
        .build_context("/proj")
        .ssh_host_port(40999)
        .jupyter(true)
        .rstudio(true)
        .build()
        .unwrap();

    let spec = manager.build_spec(&request).unwrap();
    let ports: HashSet<u16> = spec.port_bindings.iter().map(|b| b.host_port).collect();
    assert_eq!(ports.len(), spec.port_bindings.len());
    assert_eq!(spec.host_port(8888), Some(41000));
    assert_eq!(spec.host_port(8787), Some(41001));
}

#[test]
fn test_duplicate_service_port_fails_build() {
    let host = Arc::new(FakeHost::new());
    let manager = LifecycleManager::new(host, test_config())
        .with_port_allocator(ScriptedPorts::new(&[41000, 41000]));
    let request = EnvdRequest::builder()
        .tag("img")
        .name("svc")
        .build_context("/proj")
        .ssh_host_port(40999)
        .jupyter(true)
        .rstudio(true)
        .build()
        .unwrap();

    assert!(matches!(
        manager.build_spec(&request),
        Err(ContainerError::ResourceAllocation(_))
    ));
}

#[test]
fn test_malformed_mount_options_fail_build() {
    let (_host, manager) = setup();
    for option in ["/only-host", ":/data", "/host:", "/a:/b:/c", ""] {
        let request = EnvdRequest::builder()
            .tag("img")
            .name("m")
            .build_context("/proj")
            .ssh_host_port(2222)
            .mount(option)
            .build()
            .unwrap();
        match manager.build_spec(&request) {
            Err(ContainerError::Validation(msg)) => assert!(msg.contains(option)),
            other => panic!("expected validation error for {option:?}, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn test_start_then_destroy_twice() {
    let (host, manager) = setup();
    let env = manager
        .start_envd(&basic_request("dev", 43001), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(env.name, "dev");
    assert!(manager.is_running("dev").await.unwrap());

    assert!(manager.destroy("dev").await.unwrap().is_some());
    assert!(manager.destroy("dev").await.unwrap().is_none());
    assert!(!manager.exists("dev").await.unwrap());
    assert!(host.container("dev").is_none());
}

#[tokio::test]
async fn test_pause_resume_cycle() {
    let (host, manager) = setup();
    manager
        .start_envd(&basic_request("dev", 43002), Some(Duration::from_secs(5)))
        .await
        .unwrap();

    manager.pause("dev").await.unwrap();
    manager.pause("dev").await.unwrap();
    assert_eq!(host.state_of("dev"), Some(FakeState::Paused));

    manager.resume("dev").await.unwrap();
    manager.resume("dev").await.unwrap();
    assert_eq!(host.state_of("dev"), Some(FakeState::Running));

    for result in [manager.pause("nope").await, manager.resume("nope").await] {
        assert!(matches!(result, Err(ContainerError::ContainerNotFound(name)) if name == "nope"));
    }
}

#[tokio::test]
async fn test_port_conflict_can_be_retried_with_fresh_port() {
    let (host, manager) = setup();
    manager
        .start_envd(&basic_request("first", 43003), Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let err = manager
        .start_envd(&basic_request("second", 43003), Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, ContainerError::PortConflict(_)));

    // The half-created container keeps its name until it is destroyed.
    manager.destroy("second").await.unwrap();
    let env = manager
        .start_envd(&basic_request("second", free_port().unwrap()), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(env.name, "second");
    assert_eq!(host.state_of("second"), Some(FakeState::Running));
}

#[tokio::test]
async fn test_name_collision_is_a_host_error() {
    let (_host, manager) = setup();
    manager
        .start_envd(&basic_request("dev", 43004), Some(Duration::from_secs(5)))
        .await
        .unwrap();

    let err = manager
        .start_envd(&basic_request("dev", 43005), Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, ContainerError::Host { .. }));
}

#[tokio::test]
async fn test_wait_never_exceeds_deadline_plus_interval() {
    let host = FakeHost::new();
    host.hold_in_created(true);
    let created = host
        .create_container(&envd::container::ContainerSpec::new("img", "slow"))
        .await
        .unwrap();
    host.start_container(&created.id).await.unwrap();

    let timeout = Duration::from_millis(80);
    let mut waiter = ReadinessWaiter::new(&host, TICK);
    let begin = Instant::now();
    let err = waiter.wait_until_running("slow", timeout).await.unwrap_err();

    assert!(matches!(err, ContainerError::Timeout { .. }));
    assert_eq!(waiter.state(), WaitState::TimedOut);
    assert!(begin.elapsed() < timeout + TICK * 20);
}

#[tokio::test]
async fn test_transient_inspect_error_fails_start() {
    let (host, manager) = setup();
    host.fail_next(
        HostOp::InspectContainer,
        HostError::transport("connection reset by peer"),
    );

    let err = manager
        .start_envd(&basic_request("dev", 43006), Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, ContainerError::Host { .. }));
}

#[tokio::test]
async fn test_wait_cancelled_by_token() {
    let (host, manager) = setup();
    host.hold_in_created(true);
    let created = host
        .create_container(&envd::container::ContainerSpec::new("img", "held"))
        .await
        .unwrap();
    host.start_container(&created.id).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = manager
        .wait_until_running_with_cancel("held", Duration::from_secs(30), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ContainerError::Cancelled(_)));
}

#[tokio::test]
async fn test_managed_listing() {
    let (host, manager) = setup();
    manager
        .start_envd(&basic_request("dev", 43007), Some(Duration::from_secs(5)))
        .await
        .unwrap();
    host.create_container(&envd::container::ContainerSpec::new("other", "unmanaged"))
        .await
        .unwrap();

    let containers = manager.list_containers().await.unwrap();
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].names, vec!["/dev".to_string()]);

    let details = manager.get_container("/dev").await.unwrap();
    assert_eq!(details.name, "dev");
    assert!(matches!(
        manager.get_container("ghost").await,
        Err(ContainerError::ContainerNotFound(_))
    ));
}

#[tokio::test]
async fn test_non_loopback_bind_address_creates_nothing() {
    let host = Arc::new(FakeHost::new());
    let config = EnvdConfig {
        host_ip: "0.0.0.0".to_string(),
        ..test_config()
    };
    let manager = LifecycleManager::new(host.clone(), config);

    let err = manager
        .start_envd(&basic_request("dev", 43008), Some(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, ContainerError::Validation(_)));
    assert_eq!(host.call_count(HostOp::CreateContainer), 0);
}

#[tokio::test]
async fn test_cancel_during_slow_inspection() {
    let (host, manager) = setup();
    host.hold_in_created(true);
    let created = host
        .create_container(&envd::container::ContainerSpec::new("img", "stuck"))
        .await
        .unwrap();
    host.start_container(&created.id).await.unwrap();
    host.set_inspect_delay(Duration::from_secs(30));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(TICK * 5).await;
        trigger.cancel();
    });

    let begin = Instant::now();
    let err = manager
        .wait_until_running_with_cancel("stuck", Duration::from_secs(60), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, ContainerError::Cancelled(_)));
    assert!(begin.elapsed() < Duration::from_secs(2));
    assert_eq!(host.call_count(HostOp::InspectContainer), 1);
}

#[tokio::test]
async fn test_destroy_empty_name_touches_nothing() {
    let (host, manager) = setup();
    manager
        .start_envd(&basic_request("dev", 43009), Some(Duration::from_secs(5)))
        .await
        .unwrap();

    assert!(manager.destroy("").await.unwrap().is_none());
    assert_eq!(host.state_of("dev"), Some(FakeState::Running));
}
