use std::{sync::Arc, time::Duration};

use crate::{
    error::{Error, Result},
    scheduler::{BackgroundTask, Context, Scheduler},
    store::{environment::Environment, metrics::MetricsTask},
};

/// Runs planned engine tasks until the planner runs dry.
pub struct WorkerTask {
    env: Arc<Environment>,
}

impl WorkerTask {
    pub fn new(env: Arc<Environment>) -> Self {
        Self { env }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for WorkerTask {
    fn name(&self) -> &'static str {
        "worker"
    }

    fn interval(&self) -> Duration {
        self.env.config().scheduler.worker_interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        loop {
            // Compaction and backup are blocking file I/O.
            let env = Arc::clone(&self.env);
            let worked = tokio::task::spawn_blocking(move || env.step())
                .await
                .map_err(|e| Error::InvalidState(format!("Worker join error: {}", e)))??;
            if !worked || ctx.stopping() {
                return Ok(());
            }
        }
    }
}

pub struct LogRotateTask {
    env: Arc<Environment>,
}

impl LogRotateTask {
    pub fn new(env: Arc<Environment>) -> Self {
        Self { env }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for LogRotateTask {
    fn name(&self) -> &'static str {
        "log-rotate"
    }

    fn interval(&self) -> Duration {
        self.env.config().scheduler.log_rotate_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        if self.env.rotate_log_if_ready()? {
            tracing::debug!("Rotated log file");
        }
        Ok(())
    }
}

/// Registers the configured number of workers plus log rotation and
/// metrics.
pub fn register_tasks(env: &Arc<Environment>, scheduler: &Scheduler) -> Result<()> {
    for _ in 0..env.config().scheduler.threads.max(1) {
        scheduler.register(Arc::new(WorkerTask::new(Arc::clone(env))))?;
    }
    scheduler.register(Arc::new(LogRotateTask::new(Arc::clone(env))))?;
    scheduler.register(Arc::new(MetricsTask::new(Arc::clone(env))))?;
    Ok(())
}
