//! Readiness wait.
//!
//! [`ReadinessWaiter`] polls the host on a fixed interval until the container
//! is observed running or the deadline passes. The first poll happens one
//! interval after the wait starts.
//!
//! A failing state query ends the wait immediately with that error; the next
//! tick is not attempted.

use crate::container::lifecycle::is_running;
use crate::container::{ContainerError, LifecycleClient, Result};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Progress of a readiness wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitState {
    Waiting,
    Ready,
    TimedOut,
}

impl WaitState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, WaitState::Waiting)
    }
}

/// Polling state machine for one container.
pub struct ReadinessWaiter<'a> {
    client: &'a dyn LifecycleClient,
    interval: Duration,
    state: WaitState,
}

impl<'a> ReadinessWaiter<'a> {
    pub fn new(client: &'a dyn LifecycleClient, interval: Duration) -> Self {
        Self {
            client,
            interval,
            state: WaitState::Waiting,
        }
    }

    pub fn state(&self) -> WaitState {
        self.state
    }

    /// Block until `name` is running or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`ContainerError::Timeout`] when the deadline passes and the
    /// query error when a state check fails.
    pub async fn wait_until_running(&mut self, name: &str, timeout: Duration) -> Result<()> {
        self.wait_until_running_with_cancel(name, timeout, &CancellationToken::new())
            .await
    }

    /// Like [`wait_until_running`](Self::wait_until_running), returning
    /// [`ContainerError::Cancelled`] as soon as `cancel` fires. An in-flight
    /// state query is dropped.
    pub async fn wait_until_running_with_cancel(
        &mut self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        debug!(container = %name, ?timeout, "waiting to start");
        self.state = WaitState::Waiting;

        let (client, interval) = (self.client, self.interval);
        let started = Instant::now();
        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(container = %name, "wait cancelled");
                    return Err(ContainerError::Cancelled(name.to_string()));
                }
                _ = &mut deadline => {
                    let elapsed = started.elapsed();
                    self.state = WaitState::TimedOut;
                    self.log_last_state(name).await;
                    return Err(ContainerError::Timeout {
                        name: name.to_string(),
                        elapsed,
                    });
                }
                polled = poll(client, interval, name) => {
                    if polled? {
                        debug!(container = %name, "the container is running");
                        self.state = WaitState::Ready;
                        return Ok(());
                    }
                    trace!(container = %name, "container is not running yet");
                }
            }
        }
    }

    /// Best-effort dump of the last observed state, bounded by one interval.
    async fn log_last_state(&self, name: &str) {
        match tokio::time::timeout(self.interval, self.client.inspect_container(name)).await {
            Ok(Ok(details)) => match serde_json::to_string(&details) {
                Ok(state) => debug!(container = %name, %state, "container state"),
                Err(e) => debug!(container = %name, error = %e, "failed to marshal container state"),
            },
            Ok(Err(e)) => debug!(container = %name, error = %e, "failed to inspect container"),
            Err(_) => debug!(container = %name, "inspecting container timed out"),
        }
    }
}

async fn poll(client: &dyn LifecycleClient, interval: Duration, name: &str) -> Result<bool> {
    tokio::time::sleep(interval).await;
    is_running(client, name).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::{ContainerSpec, FakeHost, HostError, HostOp};

    const TICK: Duration = Duration::from_millis(10);

    async fn started(host: &FakeHost, name: &str) {
        let created = host
            .create_container(&ContainerSpec::new("img", name))
            .await
            .unwrap();
        host.start_container(&created.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_ready_on_first_tick() {
        let host = FakeHost::new();
        started(&host, "c1").await;

        let mut waiter = ReadinessWaiter::new(&host, TICK);
        let begin = Instant::now();
        waiter
            .wait_until_running("c1", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(waiter.state(), WaitState::Ready);
        assert!(begin.elapsed() >= TICK, "first poll must wait one interval");
        assert!(begin.elapsed() < Duration::from_secs(1));
        assert_eq!(host.call_count(HostOp::InspectContainer), 1);
    }

    #[tokio::test]
    async fn test_ready_after_several_ticks() {
        let host = FakeHost::new();
        host.set_start_delay(3);
        started(&host, "c1").await;

        let mut waiter = ReadinessWaiter::new(&host, TICK);
        waiter
            .wait_until_running("c1", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(waiter.state(), WaitState::Ready);
        assert_eq!(host.call_count(HostOp::InspectContainer), 4);
    }

    #[tokio::test]
    async fn test_times_out_within_one_interval_of_deadline() {
        let host = FakeHost::new();
        host.hold_in_created(true);
        started(&host, "c1").await;

        let timeout = Duration::from_millis(100);
        let mut waiter = ReadinessWaiter::new(&host, TICK);
        let begin = Instant::now();
        let err = waiter.wait_until_running("c1", timeout).await.unwrap_err();

        match err {
            ContainerError::Timeout { name, elapsed } => {
                assert_eq!(name, "c1");
                assert!(elapsed >= timeout);
            }
            other => panic!("expected timeout, got {other}"),
        }
        assert_eq!(waiter.state(), WaitState::TimedOut);
        assert!(begin.elapsed() < timeout + TICK * 20);
    }

    #[tokio::test]
    async fn test_missing_container_times_out() {
        let host = FakeHost::new();
        let mut waiter = ReadinessWaiter::new(&host, TICK);
        let err = waiter
            .wait_until_running("ghost", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::Timeout { .. }));
    }

    // Pins the fail-fast policy: one transient query error ends the wait
    // even though the deadline is far away.
    #[tokio::test]
    async fn test_poll_error_aborts_wait_without_retry() {
        let host = FakeHost::new();
        host.hold_in_created(true);
        started(&host, "c1").await;
        host.fail_next(
            HostOp::InspectContainer,
            HostError::transport("connection reset by peer"),
        );

        let mut waiter = ReadinessWaiter::new(&host, TICK);
        let err = waiter
            .wait_until_running("c1", Duration::from_secs(5))
            .await
            .unwrap_err();

        assert!(matches!(err, ContainerError::Host { .. }));
        assert_eq!(waiter.state(), WaitState::Waiting);
        assert_eq!(host.call_count(HostOp::InspectContainer), 1);
    }

    #[tokio::test]
    async fn test_cancellation_returns_promptly() {
        let host = FakeHost::new();
        host.hold_in_created(true);
        started(&host, "c1").await;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let mut waiter = ReadinessWaiter::new(&host, Duration::from_secs(10));
        let begin = Instant::now();
        let err = waiter
            .wait_until_running_with_cancel("c1", Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ContainerError::Cancelled(_)));
        assert!(begin.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_cancellation_interrupts_pending_inspection() {
        let host = FakeHost::new();
        host.hold_in_created(true);
        started(&host, "c1").await;
        host.set_inspect_delay(Duration::from_secs(10));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(TICK * 5).await;
            trigger.cancel();
        });

        let mut waiter = ReadinessWaiter::new(&host, TICK);
        let begin = Instant::now();
        let err = waiter
            .wait_until_running_with_cancel("c1", Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, ContainerError::Cancelled(_)));
        assert!(begin.elapsed() < Duration::from_secs(1));
        assert_eq!(host.call_count(HostOp::InspectContainer), 1);
        assert_eq!(waiter.state(), WaitState::Waiting);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!WaitState::Waiting.is_terminal());
        assert!(WaitState::Ready.is_terminal());
        assert!(WaitState::TimedOut.is_terminal());
    }
}
