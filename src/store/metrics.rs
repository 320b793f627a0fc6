use std::{sync::Arc, time::Duration};

use crate::{
    error::Result,
    scheduler::{BackgroundTask, Context},
    store::environment::Environment,
};

pub struct MetricsTask {
    env: Arc<Environment>,
}

impl MetricsTask {
    pub fn new(env: Arc<Environment>) -> Self {
        Self { env }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for MetricsTask {
    fn name(&self) -> &'static str {
        "metrics"
    }

    fn interval(&self) -> Duration {
        self.env.config().scheduler.metrics_interval
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        // Nothing to report while offline.
        let Ok(metrics) = self.env.metrics() else {
            return Ok(());
        };

        tracing::info!(
            status = %self.env.status(),
            databases = metrics.databases,
            nodes = metrics.nodes,
            garbage_nodes = metrics.garbage_nodes,
            memory_used = metrics.memory_used,
            transactions = metrics.transactions,
            shadows = metrics.shadows,
            log_files = metrics.log_files,
            log_records = metrics.log_records,
            lsn = metrics.lsn,
            "Engine metrics"
        );

        Ok(())
    }
}
