//! Server lifecycle: health state, shutdown signalling, and in-flight
//! operation tracking.
//!
//! Health transitions go through `ArcSwap` so health checks never contend with the
//! operation path. In-flight broker operations hold an `InFlightGuard`; the
//! last guard to drop during a drain wakes `wait_for_drain`.

use std::pin::pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Notify};

/// Server health state, transitioned by the shutdown controller.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Listener bound, sessions not yet accepted.
    Starting,
    /// Accepting WebSocket sessions.
    Ready,
    /// Closing sessions and waiting for in-flight operations.
    Draining,
    /// Every in-flight operation finished after the drain.
    Stopped,
}

impl HealthState {
    /// Lowercase name reported by the health endpoint.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }

    /// Whether new WebSocket sessions may be opened.
    #[must_use]
    pub fn is_accepting(self) -> bool {
        matches!(self, Self::Ready)
    }
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    idle: Notify,
}

/// Coordinates shutdown across the server.
///
/// 1. Health checks read `health_state()`
/// 2. The WebSocket upgrade handler refuses new sessions unless Ready
/// 3. Live sessions watch `shutdown_receiver()` and close themselves
/// 4. `wait_for_drain()` waits until in-flight broker operations complete
#[derive(Debug)]
pub struct ShutdownController {
    signal: watch::Sender<bool>,
    health: ArcSwap<HealthState>,
    in_flight: Arc<InFlight>,
}

impl ShutdownController {
    /// Creates a controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (signal, _rx) = watch::channel(false);
        Self {
            signal,
            health: ArcSwap::from_pointee(HealthState::Starting),
            in_flight: Arc::new(InFlight::default()),
        }
    }

    pub fn set_ready(&self) {
        self.health.store(Arc::new(HealthState::Ready));
    }

    /// Receiver that flips to `true` once shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.signal.subscribe()
    }

    /// Moves to `Draining` and signals every session.
    ///
    /// Idempotent; a second call neither re-signals nor leaves `Stopped`.
    pub fn trigger_shutdown(&self) {
        let previous = self.health.swap(Arc::new(HealthState::Draining));
        if *previous == HealthState::Stopped {
            self.health.store(previous);
            return;
        }
        self.signal.send_if_modified(|fired| !std::mem::replace(fired, true));
    }

    #[must_use]
    pub fn health_state(&self) -> HealthState {
        **self.health.load()
    }

    /// Marks one broker operation as in flight until the guard drops.
    #[must_use]
    pub fn in_flight_guard(&self) -> InFlightGuard {
        self.in_flight.count.fetch_add(1, Ordering::AcqRel);
        InFlightGuard {
            in_flight: Arc::clone(&self.in_flight),
        }
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits until no operation is in flight, up to `timeout`.
    ///
    /// Returns `true` and moves to `Stopped` when drained. On timeout returns
    /// `false` and the state stays `Draining`.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let mut idle = pin!(self.in_flight.idle.notified());
            idle.as_mut().enable();

            if self.in_flight_count() == 0 {
                self.health.store(Arc::new(HealthState::Stopped));
                return true;
            }
            if tokio::time::timeout_at(deadline, idle).await.is_err() {
                return false;
            }
        }
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count on drop, including during unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_starting_ready_draining() {
        let controller = ShutdownController::new();
        assert_eq!(controller.health_state(), HealthState::Starting);
        assert!(!controller.health_state().is_accepting());

        controller.set_ready();
        assert!(controller.health_state().is_accepting());

        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Draining);
        assert!(!controller.health_state().is_accepting());
    }

    #[test]
    fn health_state_names() {
        assert_eq!(HealthState::Starting.as_str(), "starting");
        assert_eq!(HealthState::Ready.as_str(), "ready");
        assert_eq!(HealthState::Draining.as_str(), "draining");
        assert_eq!(HealthState::Stopped.as_str(), "stopped");
    }

    #[test]
    fn guards_track_in_flight_operations() {
        let controller = ShutdownController::new();
        let a = controller.in_flight_guard();
        let b = controller.in_flight_guard();
        assert_eq!(controller.in_flight_count(), 2);

        drop(a);
        assert_eq!(controller.in_flight_count(), 1);
        drop(b);
        assert_eq!(controller.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn sessions_observe_the_signal_once() {
        let controller = ShutdownController::new();
        let mut rx = controller.shutdown_receiver();
        assert!(!*rx.borrow());

        controller.trigger_shutdown();
        rx.changed().await.unwrap();
        assert!(*rx.borrow_and_update());

        controller.trigger_shutdown();
        assert!(!rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn drain_is_immediate_when_idle() {
        let controller = ShutdownController::new();
        controller.set_ready();
        controller.trigger_shutdown();

        assert!(controller.wait_for_drain(Duration::from_secs(1)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);

        // A late trigger does not resurrect Draining.
        controller.trigger_shutdown();
        assert_eq!(controller.health_state(), HealthState::Stopped);
    }

    #[tokio::test]
    async fn drain_wakes_when_last_guard_drops() {
        let controller = Arc::new(ShutdownController::new());
        controller.set_ready();
        let first = controller.in_flight_guard();
        let second = controller.in_flight_guard();
        controller.trigger_shutdown();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(first);
            tokio::time::sleep(Duration::from_millis(20)).await;
            drop(second);
        });

        assert!(controller.wait_for_drain(Duration::from_secs(2)).await);
        assert_eq!(controller.health_state(), HealthState::Stopped);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn drain_times_out_with_stuck_operation() {
        let controller = ShutdownController::new();
        controller.set_ready();
        let _stuck = controller.in_flight_guard();
        controller.trigger_shutdown();

        assert!(!controller.wait_for_drain(Duration::from_millis(30)).await);
        assert_eq!(controller.health_state(), HealthState::Draining);
    }
}
