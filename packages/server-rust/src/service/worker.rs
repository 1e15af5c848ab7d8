//! Background worker for periodic and on-demand tasks.
//!
//! `BackgroundWorker<R>` drives a `BackgroundRunnable` from a spawned tokio
//! task: commands arrive over an mpsc channel and a fixed-interval tick
//! triggers periodic work such as recovery sweeps and health polling.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::MissedTickBehavior;
use tracing::debug;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Handler executed by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// Command type accepted through [`BackgroundWorker::submit`].
    type Task: Send + 'static;

    /// Process a single submitted command.
    async fn run(&mut self, task: Self::Task);

    /// Called on each tick. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Spawned task that feeds commands and ticks to a [`BackgroundRunnable`].
///
/// Commands and ticks are handled one at a time, so the runnable never
/// observes overlapping invocations.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker. The first tick fires one `tick_interval` after start.
    ///
    /// Must be called from within a tokio runtime. The command channel
    /// capacity is fixed at 256.
    pub fn start(runnable: R, tick_interval: Duration) -> Self {
        Self::spawn(runnable, tick_interval, None)
    }

    /// Like [`start`](Self::start), but ticks stop once `shutdown` turns
    /// `true`. Commands are still processed until [`stop`](Self::stop).
    pub fn start_with_shutdown(
        runnable: R,
        tick_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self::spawn(runnable, tick_interval, Some(shutdown))
    }

    fn spawn(
        mut runnable: R,
        tick_interval: Duration,
        mut shutdown_signal: Option<watch::Receiver<bool>>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(256);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // Skip the immediate first tick.
            ticker.tick().await;
            let mut ticking = true;

            loop {
                tokio::select! {
                    task = rx.recv() => {
                        match task {
                            Some(t) => runnable.run(t).await,
                            None => break,
                        }
                    }
                    _ = ticker.tick(), if ticking => {
                        runnable.on_tick().await;
                    }
                    () = shutdown_signalled(&mut shutdown_signal), if ticking => {
                        debug!("shutdown signalled, periodic work stopped");
                        ticking = false;
                    }
                    _ = &mut shutdown_rx => {
                        break;
                    }
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Submit a command to the worker.
    ///
    /// # Errors
    ///
    /// Returns an error if the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        match &self.tx {
            Some(tx) => tx
                .send(task)
                .await
                .map_err(|_| anyhow::anyhow!("worker channel closed")),
            None => Err(anyhow::anyhow!("worker not running")),
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Stop the worker, waiting for the in-progress invocation and
    /// `shutdown()` to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

/// Resolves once `signal` carries `true`. Pending forever without a signal
/// or after its sender is gone.
async fn shutdown_signalled(signal: &mut Option<watch::Receiver<bool>>) {
    if let Some(rx) = signal {
        let signalled = rx.wait_for(|stop| *stop).await.is_ok();
        if signalled {
            return;
        }
    }
    std::future::pending::<()>().await;
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
