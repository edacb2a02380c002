//! Background work for the broker.
//!
//! `BackgroundWorker<R>` drives a `BackgroundRunnable` from an mpsc channel
//! plus a periodic tick. `ExpirySweeper` is the runnable the server starts
//! when a correlation TTL is configured: each tick drops pending
//! correlations older than the TTL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use capbroker_core::RoutingEngine;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Work driven by a `BackgroundWorker`.
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    type Task: Send + 'static;

    /// Handles one submitted task.
    async fn run(&mut self, task: Self::Task);

    /// Called once per tick interval.
    async fn on_tick(&mut self) {}

    /// Called once after the worker stops.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Owns the tokio task driving a `BackgroundRunnable`.
///
/// Queued tasks and ticks are handled one at a time on the same task, so a
/// runnable never sees concurrent calls. Missed ticks are delayed rather than
/// bursted.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tasks: Option<mpsc::Sender<R::Task>>,
    stop: Option<oneshot::Sender<()>>,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Queue capacity for submitted tasks.
    const QUEUE: usize = 64;

    /// Spawns the worker. The first tick fires one interval after start.
    pub fn start(mut runnable: R, tick_interval_ms: u64) -> Self {
        let (tasks, mut rx) = mpsc::channel::<R::Task>(Self::QUEUE);
        let (stop, mut stop_rx) = oneshot::channel::<()>();
        let period = Duration::from_millis(tick_interval_ms.max(1));

        let join = tokio::spawn(async move {
            let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = ticks.tick() => runnable.on_tick().await,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tasks: Some(tasks),
            stop: Some(stop),
            join: Some(join),
        }
    }

    /// Queues `task` for the runnable.
    ///
    /// # Errors
    ///
    /// Fails once the worker has been stopped.
    pub async fn submit(&self, task: R::Task) -> anyhow::Result<()> {
        let Some(tasks) = &self.tasks else {
            anyhow::bail!("worker not running");
        };
        tasks
            .send(task)
            .await
            .map_err(|_| anyhow::anyhow!("worker channel closed"))
    }

    /// Stops the worker and waits for `BackgroundRunnable::shutdown` to finish.
    /// Idempotent.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        self.tasks.take();
        if let Some(join) = self.join.take() {
            let _ = join.await;
        }
    }
}

// ---------------------------------------------------------------------------
// ExpirySweeper
// ---------------------------------------------------------------------------

/// On-demand work for the expiry sweeper.
#[derive(Debug)]
pub enum ExpiryTask {
    /// Sweep now and report how many correlations were dropped.
    SweepNow { reply: Option<oneshot::Sender<usize>> },
}

/// Periodically expires pending correlations past the engine's TTL.
pub struct ExpirySweeper {
    engine: Arc<RoutingEngine>,
    swept_total: u64,
}

impl ExpirySweeper {
    #[must_use]
    pub fn new(engine: Arc<RoutingEngine>) -> Self {
        Self {
            engine,
            swept_total: 0,
        }
    }

    fn sweep(&mut self) -> usize {
        let expired = self.engine.expire_pending(Instant::now());
        self.swept_total += expired as u64;
        if expired > 0 {
            debug!(expired, "expiry sweep dropped pending correlations");
        }
        expired
    }
}

#[async_trait]
impl BackgroundRunnable for ExpirySweeper {
    type Task = ExpiryTask;

    async fn run(&mut self, task: ExpiryTask) {
        match task {
            ExpiryTask::SweepNow { reply } => {
                let expired = self.sweep();
                if let Some(reply) = reply {
                    let _ = reply.send(expired);
                }
            }
        }
    }

    async fn on_tick(&mut self) {
        self.sweep();
    }

    async fn shutdown(&mut self) {
        info!(swept_total = self.swept_total, "expiry sweeper stopped");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
