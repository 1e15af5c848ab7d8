//! Graceful shutdown controller with in-flight work tracking.
//!
//! Lifecycle state lives in an `ArcSwap`; in-flight work is counted by RAII
//! guards, and the guard that brings the count to zero wakes drain waiters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Notify};

/// Process lifecycle state, transitioned by the shutdown controller.
///
/// State machine: Starting -> Ready -> Draining -> Stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Services are initializing.
    Starting,
    /// Fully operational.
    Ready,
    /// Finishing in-flight work; background sweeps should stop early.
    Draining,
    /// All in-flight work completed.
    Stopped,
}

impl LifecycleState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

// ---------------------------------------------------------------------------
// ShutdownController
// ---------------------------------------------------------------------------

/// Coordinates graceful shutdown across services.
///
/// 1. Health checks read `state()` to report readiness
/// 2. Background workers check `is_running()` between units of work
/// 3. `trigger_shutdown()` moves to Draining and signals all listeners, so
///    workers started with a [`shutdown_receiver`](Self::shutdown_receiver)
///    stop their periodic ticks
/// 4. `wait_for_drain()` waits until the last in-flight guard is dropped
#[derive(Debug)]
pub struct ShutdownController {
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<InFlight>,
    state: ArcSwap<LifecycleState>,
}

#[derive(Debug, Default)]
struct InFlight {
    count: AtomicU64,
    drained: Notify,
}

impl ShutdownController {
    /// Creates a new shutdown controller in the `Starting` state.
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            shutdown_signal: tx,
            in_flight: Arc::new(InFlight::default()),
            state: ArcSwap::from_pointee(LifecycleState::Starting),
        }
    }

    /// Transitions to `Ready`.
    pub fn set_ready(&self) {
        self.state.store(Arc::new(LifecycleState::Ready));
    }

    /// Returns a receiver notified when shutdown is triggered.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Transitions to `Draining` and signals all shutdown receivers.
    pub fn trigger_shutdown(&self) {
        self.state.store(Arc::new(LifecycleState::Draining));
        // Receivers may have been dropped.
        let _ = self.shutdown_signal.send(true);
    }

    #[must_use]
    pub fn state(&self) -> LifecycleState {
        **self.state.load()
    }

    /// Whether new work may still be started.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            LifecycleState::Starting | LifecycleState::Ready
        )
    }

    /// Creates an RAII guard that tracks one unit of in-flight work.
    ///
    /// The counter is incremented on creation and decremented when the
    /// guard is dropped, even if the holder panics.
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

    /// Waits for in-flight work to complete, up to `timeout`.
    ///
    /// Returns `true` and transitions to `Stopped` on a clean drain. Returns
    /// `false` if the timeout expired (state remains `Draining`).
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let drain = async {
            loop {
                // Registered before the check so a concurrent final drop
                // cannot be missed.
                let notified = self.in_flight.drained.notified();
                if self.in_flight_count() == 0 {
                    return;
                }
                notified.await;
            }
        };
        let drained = tokio::time::timeout(timeout, drain).await.is_ok();
        if drained {
            self.state.store(Arc::new(LifecycleState::Stopped));
        }
        drained
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// InFlightGuard
// ---------------------------------------------------------------------------

/// RAII guard that decrements the in-flight counter when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.drained.notify_waiters();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
