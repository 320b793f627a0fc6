//! Background work on the tokio runtime.
//!
//! An environment is served by a small pool of periodic tasks: `threads`
//! workers that drain the [`plan`] through `Environment::step`, plus log
//! rotation and metrics. The [`Scheduler`] owns their timers and stops them
//! together; deciding what to run is left to the planner.

pub mod plan;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::{Error, Result};
use crate::store::{register_tasks, Environment};

/// Handed to a task on every run.
pub struct Context {
    pub task: &'static str,
    /// Number of this run, starting at 1.
    pub run: u64,
    stop: watch::Receiver<bool>,
}

impl Context {
    pub(crate) fn new(task: &'static str, run: u64, stop: watch::Receiver<bool>) -> Self {
        Self { task, run, stop }
    }

    /// Whether the scheduler is shutting down. Long runs check this between
    /// units of work.
    pub fn stopping(&self) -> bool {
        *self.stop.borrow()
    }
}

#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    fn name(&self) -> &'static str;

    /// Delay between the end of one run and the start of the next.
    fn interval(&self) -> Duration;

    async fn execute(&self, ctx: Context) -> Result<()>;
}

pub struct Scheduler {
    handles: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
    stop: watch::Sender<bool>,
}

impl Scheduler {
    pub fn new() -> Self {
        let (stop, _) = watch::channel(false);
        Self {
            handles: Mutex::new(Vec::new()),
            stop,
        }
    }

    /// Starts the worker pool and periodic tasks of an open environment.
    pub fn start(env: &Arc<Environment>) -> Result<Self> {
        let scheduler = Self::new();
        register_tasks(env, &scheduler)?;
        tracing::info!(
            tasks = scheduler.len(),
            workers = env.config().scheduler.threads.max(1),
            "Scheduler started"
        );
        Ok(scheduler)
    }

    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> Result<&Self> {
        let name = task.name();
        let handle = tokio::spawn(run(task, self.stop.subscribe()));
        self.handles.lock()?.push((name, handle));
        Ok(self)
    }

    /// Number of registered tasks.
    pub fn len(&self) -> usize {
        self.handles.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stops every task and waits for runs in flight to return.
    pub async fn shutdown(self) -> Result<()> {
        self.stop.send_replace(true);
        let handles: Vec<_> = self.handles.lock()?.drain(..).collect();
        for (name, handle) in handles {
            handle
                .await
                .map_err(|e| Error::InvalidState(format!("task {} failed to join: {}", name, e)))?;
        }
        tracing::info!("Scheduler stopped");
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop.send_replace(true);
    }
}

async fn run<T: BackgroundTask + ?Sized>(task: Arc<T>, mut stop: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(task.interval());
    // A slow compaction must not be followed by a burst of catch-up runs.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut run = 0u64;
    let mut failures = 0u32;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => {}
        }
        if *stop.borrow() {
            break;
        }

        run += 1;
        match task.execute(Context::new(task.name(), run, stop.clone())).await {
            Ok(()) => failures = 0,
            Err(e) => {
                failures += 1;
                tracing::error!(task = task.name(), run, failures, error = %e, "Task failed");
            }
        }
    }
    tracing::debug!(task = task.name(), runs = run, "Task stopped");
}
