//! Worker scheduler for background tasks.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, error, info};

use clickhouse_client::ClickHouseClient;
use telemetry::{health, metrics};

use crate::ledger::LedgerMirror;
use crate::pipeline::Pipeline;

/// Worker scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Metrics flush interval
    #[serde(default = "default_metrics_flush_secs")]
    pub metrics_flush_secs: u64,
}

fn default_metrics_flush_secs() -> u64 {
    60
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            metrics_flush_secs: default_metrics_flush_secs(),
        }
    }
}

/// Background worker scheduler.
///
/// Runs the queue worker pool, the stale task sweeper and the metrics flush,
/// plus the ledger mirror when ClickHouse is configured.
pub struct WorkerScheduler {
    config: WorkerConfig,
    pipeline: Pipeline,
    clickhouse: Option<ClickHouseClient>,
    ledger_mirror: Option<LedgerMirror>,
    shutdown: watch::Receiver<bool>,
}

impl WorkerScheduler {
    pub fn new(config: WorkerConfig, pipeline: Pipeline, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            config,
            pipeline,
            clickhouse: None,
            ledger_mirror: None,
            shutdown,
        }
    }

    /// Mirror metrics snapshots and ledger entries into ClickHouse.
    pub fn with_clickhouse(mut self, clickhouse: ClickHouseClient, ledger_mirror: LedgerMirror) -> Self {
        self.clickhouse = Some(clickhouse);
        self.ledger_mirror = Some(ledger_mirror);
        self
    }

    /// Starts all background workers.
    pub fn start(self) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        let queue = self.pipeline.orchestrator().config().clone();

        // Ledger mirror stops on its own once every ledger sender is dropped
        if let Some(mirror) = self.ledger_mirror {
            handles.push(tokio::spawn(mirror.run()));
            info!("Ledger mirror started");
        }

        for worker_id in 0..queue.workers {
            let pipeline = self.pipeline.clone();
            let shutdown = self.shutdown.clone();
            let poll = queue.poll_interval();
            handles.push(tokio::spawn(async move {
                run_queue_worker(worker_id, pipeline, poll, shutdown).await;
            }));
        }
        info!(workers = queue.workers, "Queue workers started");

        let pipeline = self.pipeline.clone();
        let shutdown = self.shutdown.clone();
        let sweep_every = queue.sweep_interval();
        handles.push(tokio::spawn(async move {
            run_stale_sweeper(pipeline, sweep_every, shutdown).await;
        }));

        let pipeline = self.pipeline.clone();
        let clickhouse = self.clickhouse;
        let shutdown = self.shutdown.clone();
        let flush_every = Duration::from_secs(self.config.metrics_flush_secs.max(1));
        handles.push(tokio::spawn(async move {
            run_metrics_flush(pipeline, clickhouse, flush_every, shutdown).await;
        }));

        info!("Background workers started");
        handles
    }
}

async fn run_queue_worker(
    worker_id: usize,
    pipeline: Pipeline,
    poll: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        match pipeline.orchestrator().process_next().await {
            Ok(Some(run)) => {
                debug!(worker_id = worker_id, task_id = %run.task_id, "Task finished");
                continue;
            }
            Ok(None) => {}
            Err(e) => {
                error!(worker_id = worker_id, error = %e, "Queue worker error");
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    debug!(worker_id = worker_id, "Queue worker stopped");
}

async fn run_stale_sweeper(pipeline: Pipeline, every: Duration, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = interval(every);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        if let Err(e) = pipeline.orchestrator().sweep_stale().await {
            error!(error = %e, "Stale task sweep error");
        }
    }
}

async fn run_metrics_flush(
    pipeline: Pipeline,
    clickhouse: Option<ClickHouseClient>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    use clickhouse_client::insert_metrics;

    let mut ticker = interval(every);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }

        // Refreshes the queue depth gauge
        if let Err(e) = pipeline.get_queue_status().await {
            error!(error = %e, "Failed to read queue status");
        }

        let Some(ref clickhouse) = clickhouse else {
            continue;
        };
        let snapshot = metrics().snapshot();
        match insert_metrics(clickhouse, snapshot).await {
            Ok(()) => {
                metrics().clickhouse_inserts.inc();
                health().clickhouse.set_healthy();
            }
            Err(e) => {
                metrics().clickhouse_insert_errors.inc();
                health().clickhouse.set_unhealthy(e.to_string());
                error!(error = %e, "Failed to flush metrics");
            }
        }
    }
}
